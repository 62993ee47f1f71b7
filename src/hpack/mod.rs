//! HPACK header compression (RFC 7541).
//!
//! One `Decoder` and one `Encoder` live for the lifetime of a session;
//! both carry a dynamic table whose state is shared with the peer by
//! construction of the protocol.

mod decoder;
mod encoder;
mod huffman;
mod table;

pub(crate) use self::decoder::{Decoder, DecoderError};
pub(crate) use self::encoder::Encoder;
