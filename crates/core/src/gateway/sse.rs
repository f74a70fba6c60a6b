//! Incremental decoder for provider `text/event-stream` bodies.

/// Splits a byte stream into the payloads of its `data:` lines.
///
/// Chunks may end mid-line (or mid UTF-8 sequence); incomplete input is
/// buffered until the next push.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(payload) = data_payload(line.trim_end_matches(['\r', '\n'])) {
                payloads.push(payload.to_string());
            }
        }
        payloads
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        data_payload(line.trim_end_matches(['\r', '\n'])).map(str::to_string)
    }
}

fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Stream terminator used by OpenAI-compatible endpoints.
pub fn is_done(payload: &str) -> bool {
    payload.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_payloads_across_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let out = decoder.push(b":1}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}", "[DONE]"]);
        assert!(is_done(&out[1]));
    }

    #[test]
    fn handles_crlf_and_unterminated_tail() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push(b"data:x\r\n"), vec!["x"]);
        decoder.push(b"data: tail");
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn multibyte_characters_split_between_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: héllo\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec!["héllo"]);
    }
}
