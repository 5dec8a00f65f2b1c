use rumqttc::Publish;

/// A message received from the broker on a subscribed topic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Message {
        Message {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// The payload as UTF-8 text, if it is any.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_str_decodes_utf8() {
        let message = Message::new("t", "PING".as_bytes());
        assert_eq!(message.payload_str(), Some("PING"));
    }

    #[test]
    fn payload_str_rejects_invalid_utf8() {
        let message = Message::new("t", &b"\xc3\x28"[..]);
        assert_eq!(message.payload_str(), None);
    }
}
