use std::collections::HashMap;

use bytes::Bytes;

/// String-keyed message metadata.
pub type Attributes = HashMap<String, String>;

/// An opaque payload plus attributes. The broker never looks inside `data`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Bytes,
    pub attributes: Attributes,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A message as delivered to a subscription.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Server-assigned message id, as returned to the publisher.
    pub id: String,
    /// Token that acknowledges this particular delivery.
    pub ack_id: String,
    pub message: Message,
    /// Whether an earlier delivery of the same message went unacknowledged.
    pub redelivered: bool,
}

impl ReceivedMessage {
    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.message.attributes.get(key).map(String::as_str)
    }
}
