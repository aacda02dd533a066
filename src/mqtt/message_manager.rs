use chrono::{DateTime, Utc};
use std::fmt;

/// An application message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.topic, self.preview())
    }
}

impl BusMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        BusMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload as text for logs and the audit trail
    pub fn payload_text(&self) -> String {
        payload_text(&self.payload)
    }

    /// First 64 characters of the payload
    pub fn preview(&self) -> String {
        let text = self.payload_text();
        match text.char_indices().nth(64) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text,
        }
    }
}

/// Lossy UTF-8 rendering of a payload
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_long_payloads() {
        let msg = BusMessage::from_topic("tele/dev/STATE", "x".repeat(100));
        assert_eq!(msg.preview().len(), 67);
        assert_eq!(msg.to_string(), format!("tele/dev/STATE -> {}...", "x".repeat(64)));

        let short = BusMessage::from_topic("tele/dev/LWT", "Online");
        assert_eq!(short.to_string(), "tele/dev/LWT -> Online");
    }

    #[test]
    fn test_invalid_utf8_is_rendered_lossy() {
        assert_eq!(payload_text(&[0x4f, 0x4e, 0xff]), "ON\u{fffd}");
    }
}
