//! HTTP/2 frame vocabulary.
//!
//! Each frame kind knows how to load itself from a frame payload and how
//! to encode itself onto a write buffer. Header-block decoding (HPACK,
//! CONTINUATION reassembly) lives in the codec, which feeds fragments
//! through these types.

mod data;
mod goaway;
mod head;
mod headers;
mod ping;
mod priority;
mod reason;
mod rst_stream;
mod settings;
mod stream_id;
mod window_update;

pub(crate) use self::data::Data;
pub(crate) use self::goaway::GoAway;
pub(crate) use self::head::{Head, Kind};
pub(crate) use self::headers::{encode_headers, HeadersFragment, PushPromise};
pub(crate) use self::ping::Ping;
pub(crate) use self::priority::{Priority, StreamDependency};
pub use self::reason::Reason;
pub(crate) use self::rst_stream::RstStream;
pub(crate) use self::settings::Settings;
pub use self::stream_id::StreamId;
pub(crate) use self::window_update::WindowUpdate;

/// The length of an HTTP/2 frame header, in bytes.
pub(crate) const HEADER_LEN: usize = 9;

/// Smallest legal SETTINGS_MAX_FRAME_SIZE, and the value in effect until
/// the peer raises it.
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// The default priority weight assigned to new streams (RFC 7540 §5.3.5).
pub(crate) const DEFAULT_WEIGHT: u16 = 16;

// Frame flag bits. Meaning depends on the frame kind.
pub(crate) const END_STREAM: u8 = 0x1;
pub(crate) const ACK: u8 = 0x1;
pub(crate) const END_HEADERS: u8 = 0x4;
pub(crate) const PADDED: u8 = 0x8;
pub(crate) const PRIORITY_FLAG: u8 = 0x20;

/// Strips the pad-length prefix and trailing padding from a padded
/// payload, returning the inner slice bounds.
///
/// The pad length must leave at least zero payload bytes; a pad length
/// equal to or exceeding the remaining payload is a connection error
/// (RFC 7540 §6.1).
pub(crate) fn strip_padding(payload: &mut bytes::Bytes) -> Result<u8, Reason> {
    if payload.is_empty() {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    let pad_len = payload[0] as usize;
    bytes::Buf::advance(payload, 1);
    if pad_len > payload.len() {
        // pad length counts only the trailing padding, which must fit
        // inside what is left of the payload.
        return Err(Reason::PROTOCOL_ERROR);
    }
    payload.truncate(payload.len() - pad_len);
    Ok(pad_len as u8)
}
