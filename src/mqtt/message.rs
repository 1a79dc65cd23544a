use chrono::NaiveDateTime;
use std::fmt;

const PREVIEW_CHARS: usize = 32;

/// A single payload on its way from an HTTP caller to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    topic: String,
    payload: Vec<u8>,
    received_at: NaiveDateTime,
}

impl fmt::Display for BridgeMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            write!(f, "{} - {}: {}...", self.received_at, self.topic, preview)
        } else {
            write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
        }
    }
}

impl BridgeMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        BridgeMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.topic, self.payload)
    }
}
