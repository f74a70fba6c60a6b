//! Provider-neutral chat messages.

use serde::{Deserialize, Serialize};

use crate::images::ImageAsset;

use super::envelope::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// One piece of a multimodal message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(ImageAsset),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: Vec<ContentPart>,
    /// Tool calls requested by an assistant message
    pub tool_calls: Vec<ToolCall>,
    /// Call this tool message answers
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(ChatRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(ChatRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, text)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(ChatRole::Tool, content)
        }
    }

    /// Append text to the message as a further part
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(ContentPart::Text(text.into()));
        self
    }

    pub fn with_images(mut self, images: impl IntoIterator<Item = ImageAsset>) -> Self {
        self.parts.extend(images.into_iter().map(ContentPart::Image));
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, ContentPart::Image(_)))
    }

    /// Text parts only, joined by newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Plain-text rendering with every image replaced by `[Image]`.
    pub fn flat_text(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                ContentPart::Text(t) => t.as_str(),
                ContentPart::Image(_) => "[Image]",
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text-only copy of this message for transports that cannot carry images.
    pub fn flattened(&self) -> Self {
        Self {
            role: self.role,
            parts: vec![ContentPart::Text(self.flat_text())],
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> ImageAsset {
        ImageAsset {
            source_url: "https://x/a.png".into(),
            mime_type: "image/png".into(),
            size_bytes: 3,
            encoded_payload: "AAEC".into(),
        }
    }

    #[test]
    fn flattening_elides_images() {
        let msg = ChatMessage::user("describe this")
            .with_images(vec![asset()])
            .with_text("and be brief");
        assert!(msg.has_images());

        let flat = msg.flattened();
        assert!(!flat.has_images());
        assert_eq!(flat.text(), "describe this\n[Image]\nand be brief");
    }

    #[test]
    fn text_skips_images() {
        let msg = ChatMessage::user("a").with_images(vec![asset()]);
        assert_eq!(msg.text(), "a");
    }
}
