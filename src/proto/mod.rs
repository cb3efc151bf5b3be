//! Wire protocol: the message envelope and its JSON codecs.

mod message;

pub use message::{MessageHeader, MessageType, MeshMessage};
