//! The binary wire codec: opcode classification, field primitives and
//! the `Message` sum type covering every packet in the protocol.

mod message;
mod opcode;
mod primitives;

pub use message::{DownloadCode, Holder, Message};
pub use opcode::Opcode;
pub use primitives::LenString;
