// Values flowing from the MQTT event pump to the relay consumer. A `Message`
// is the only data the relay ever sees: a topic and the raw payload bytes,
// dropped as soon as the handler returns.
use std::borrow::Cow;

use rumqttc::Publish;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload for display. Invalid UTF-8 sequences are replaced
    /// with U+FFFD instead of failing; callers can check `is_text()` to log it.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_text(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        Message::new(p.topic, p.payload.to_vec())
    }
}

/// Everything the relay consumer reacts to, in broker delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// CONNACK received (or the connection was refused); `code` uses the
    /// MQTT 3.1.1 return code numbering, 0 meaning accepted.
    Connected { code: u8 },
    Message(Message),
    /// The broker connection is gone. Nothing reconnects after this.
    BrokerLost(String),
}

impl RelayEvent {
    /// Terminal events end the pump: no more events follow them.
    pub fn is_terminal(&self) -> bool {
        match self {
            RelayEvent::Connected { code } => *code != 0,
            RelayEvent::Message(_) => false,
            RelayEvent::BrokerLost(_) => true,
        }
    }
}
