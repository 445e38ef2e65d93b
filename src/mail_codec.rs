use serde::{Deserialize, Serialize};

pub mod encoded_word;
pub mod incoming;
pub mod outgoing;

pub use incoming::{decode_message, IncomingMessage};
pub use outgoing::{encode_message, OutgoingMessage};

/// One body alternative of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContentPart {
    pub html: bool,
    pub data: Vec<u8>,
}

impl ContentPart {
    pub fn plain(data: impl Into<Vec<u8>>) -> Self {
        ContentPart { html: false, data: data.into() }
    }

    pub fn html(data: impl Into<Vec<u8>>) -> Self {
        ContentPart { html: true, data: data.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Attachment { name: name.into(), data: data.into() }
    }
}
