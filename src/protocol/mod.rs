//! PiControl message types, payload codec and topic conventions

pub mod codec;
pub mod messages;
pub mod topics;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use messages::*;
pub use topics::*;
