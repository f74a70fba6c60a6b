//! # Streaming Relay
//!
//! Turns the graph's event stream into client frames. Every relayed stream ends
//! with exactly one [`DONE`] frame, whether the turn succeeded or failed.
//!
//! Wire format per frame: one `data: <line>` per payload line, then a blank line.

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::graph::GraphEvent;

pub const STREAM_START: &str = "stream_start";
pub const DONE: &str = "[DONE]";
pub const PLACEHOLDER: &str = "I'm processing your request...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start,
    Token(String),
    /// Sent when the turn produced no content at all
    Placeholder,
    Error(String),
    Done,
}

impl Frame {
    pub fn payload(&self) -> String {
        match self {
            Frame::Start => STREAM_START.to_string(),
            Frame::Token(text) => text.clone(),
            Frame::Placeholder => PLACEHOLDER.to_string(),
            Frame::Error(message) => format!("Error processing your request: {}", message),
            Frame::Done => DONE.to_string(),
        }
    }

    /// Payload with every line break normalized to `\n`.
    pub fn lines(&self) -> String {
        self.payload().replace("\r\n", "\n").replace('\r', "\n")
    }

    /// `data:` framed text, ready to write to the client.
    pub fn encode(&self) -> String {
        let payload = self.lines();
        let mut out = String::with_capacity(payload.len() + 8);
        for line in payload.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Frame::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Streaming,
    Closing,
    Finished,
}

struct RelayState<S> {
    events: S,
    phase: Phase,
    /// First event, held back while the start frame goes out
    pending: Option<GraphEvent>,
    produced_content: bool,
}

impl<S> RelayState<S>
where
    S: Stream<Item = GraphEvent> + Unpin,
{
    async fn next_frame(&mut self) -> Option<Frame> {
        match self.phase {
            Phase::Opening => {
                let first = self.events.next().await;
                if let Some(GraphEvent::Error(message)) = first {
                    // Pre-graph failure: no start frame, just the error and the sentinel
                    self.phase = Phase::Closing;
                    return Some(Frame::Error(message));
                }
                self.pending = first;
                self.phase = Phase::Streaming;
                Some(Frame::Start)
            }
            Phase::Streaming => loop {
                let event = match self.pending.take() {
                    Some(event) => Some(event),
                    None => self.events.next().await,
                };
                match event {
                    Some(GraphEvent::Token(text)) if text.is_empty() => continue,
                    Some(GraphEvent::Token(text)) => {
                        self.produced_content = true;
                        return Some(Frame::Token(text));
                    }
                    Some(GraphEvent::Error(message)) => {
                        self.phase = Phase::Closing;
                        return Some(Frame::Error(message));
                    }
                    None => {
                        self.phase = Phase::Closing;
                        if !self.produced_content {
                            tracing::debug!("Turn produced no content, sending placeholder");
                            return Some(Frame::Placeholder);
                        }
                        return self.close();
                    }
                }
            },
            Phase::Closing => self.close(),
            Phase::Finished => None,
        }
    }

    fn close(&mut self) -> Option<Frame> {
        self.phase = Phase::Finished;
        Some(Frame::Done)
    }
}

/// Relay graph events in producer order.
///
/// Dropping the returned stream drops `events`, which is how a client
/// disconnect reaches the producer.
pub fn relay<S>(events: S) -> impl Stream<Item = Frame> + Send
where
    S: Stream<Item = GraphEvent> + Unpin + Send + 'static,
{
    let state = RelayState {
        events,
        phase: Phase::Opening,
        pending: None,
        produced_content: false,
    };
    stream::unfold(state, |mut state| async move {
        let frame = state.next_frame().await?;
        Some((frame, state))
    })
}

/// [`relay`] over the receiving half of a turn's event channel.
pub fn relay_channel(rx: mpsc::Receiver<GraphEvent>) -> impl Stream<Item = Frame> + Send {
    relay(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<GraphEvent> {
        items.iter().map(|t| GraphEvent::Token(t.to_string())).collect()
    }

    async fn collect(events: Vec<GraphEvent>) -> Vec<Frame> {
        relay(stream::iter(events)).collect().await
    }

    #[tokio::test]
    async fn tokens_keep_producer_order() {
        let frames = collect(tokens(&["a", "b", "", "c"])).await;
        assert_eq!(
            frames,
            vec![
                Frame::Start,
                Frame::Token("a".into()),
                Frame::Token("b".into()),
                Frame::Token("c".into()),
                Frame::Done
            ]
        );
    }

    #[tokio::test]
    async fn placeholder_when_nothing_was_produced() {
        let frames = collect(tokens(&["", ""])).await;
        assert_eq!(frames, vec![Frame::Start, Frame::Placeholder, Frame::Done]);

        let frames = collect(vec![]).await;
        assert_eq!(frames, vec![Frame::Start, Frame::Placeholder, Frame::Done]);
    }

    #[tokio::test]
    async fn pre_graph_error_is_a_single_terminal_event() {
        let frames = collect(vec![GraphEvent::Error("Project not found".into())]).await;
        assert_eq!(
            frames,
            vec![Frame::Error("Project not found".into()), Frame::Done]
        );
        assert_eq!(
            frames[0].encode(),
            "data: Error processing your request: Project not found\n\n"
        );
    }

    #[tokio::test]
    async fn error_mid_stream_stops_relaying() {
        let mut events = tokens(&["partial"]);
        events.push(GraphEvent::Error("boom".into()));
        events.extend(tokens(&["late"]));

        let frames = collect(events).await;
        assert_eq!(
            frames,
            vec![
                Frame::Start,
                Frame::Token("partial".into()),
                Frame::Error("boom".into()),
                Frame::Done
            ]
        );
    }

    #[tokio::test]
    async fn sentinel_exactly_once() {
        for events in [tokens(&["x"]), vec![], vec![GraphEvent::Error("e".into())]] {
            let frames = collect(events).await;
            assert_eq!(frames.iter().filter(|f| f.is_done()).count(), 1);
            assert!(frames.last().unwrap().is_done());
        }
    }

    #[tokio::test]
    async fn channel_relay_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(GraphEvent::Token("hi".into())).await.unwrap();
        drop(tx);

        let frames: Vec<Frame> = relay_channel(rx).collect().await;
        assert_eq!(frames, vec![Frame::Start, Frame::Token("hi".into()), Frame::Done]);
    }

    #[tokio::test]
    async fn dropping_the_relay_closes_the_channel() {
        let (tx, rx) = mpsc::channel(8);
        let frames = relay_channel(rx);
        drop(frames);
        assert!(tx.is_closed());
    }

    #[test]
    fn frames_wait_for_the_producer() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let (tx, rx) = mpsc::channel(4);
        let mut frames = task::spawn(relay_channel(rx));
        assert_pending!(frames.poll_next());

        tx.try_send(GraphEvent::Token("hi".into())).unwrap();
        assert!(frames.is_woken());
        assert_ready_eq!(frames.poll_next(), Some(Frame::Start));
        assert_ready_eq!(frames.poll_next(), Some(Frame::Token("hi".into())));
        assert_pending!(frames.poll_next());

        drop(tx);
        assert_ready_eq!(frames.poll_next(), Some(Frame::Done));
        assert_ready_eq!(frames.poll_next(), None);
    }

    #[test]
    fn encoding() {
        assert_eq!(Frame::Start.encode(), "data: stream_start\n\n");
        assert_eq!(Frame::Done.encode(), "data: [DONE]\n\n");
        assert_eq!(
            Frame::Token("line one\r\nline two\rthree".into()).encode(),
            "data: line one\ndata: line two\ndata: three\n\n"
        );
        assert_eq!(Frame::Token("{\"a\":1}\n".into()).encode(), "data: {\"a\":1}\ndata: \n\n");
    }
}
