use bytes::{BufMut, Bytes};

use super::{Head, Kind, Reason, StreamId, ACK};

/// A SETTINGS frame: either an acknowledgement, or a set of parameter
/// values from one peer.
///
/// Unknown identifiers are ignored, as RFC 7540 §6.5.2 requires.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) ack: bool,
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub(crate) const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

impl Settings {
    pub(crate) fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Settings, Reason> {
        if !head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if head.is_flagged(ACK) {
            if !payload.is_empty() {
                return Err(Reason::FRAME_SIZE_ERROR);
            }
            return Ok(Settings::ack());
        }
        Settings::from_payload(&payload)
    }

    /// Decodes a raw settings payload, as found in a SETTINGS frame body
    /// or a base64url-decoded `HTTP2-Settings` header.
    pub(crate) fn from_payload(payload: &[u8]) -> Result<Settings, Reason> {
        if payload.len() % 6 != 0 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let mut settings = Settings::default();
        for raw in payload.chunks(6) {
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(Reason::PROTOCOL_ERROR);
                    }
                    settings.enable_push = Some(value);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Reason::FLOW_CONTROL_ERROR);
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(Reason::PROTOCOL_ERROR);
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => {
                    tracing::trace!("ignoring unknown setting id {}", id);
                }
            }
        }
        Ok(settings)
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        let flag = if self.ack { ACK } else { 0 };
        let payload_len = self.payload_len();
        Head::new(Kind::Settings, flag, StreamId::ZERO).encode(payload_len, dst);

        let mut put = |id: u16, value: Option<u32>| {
            if let Some(value) = value {
                dst.put_u16(id);
                dst.put_u32(value);
            }
        };
        put(HEADER_TABLE_SIZE, self.header_table_size);
        put(ENABLE_PUSH, self.enable_push);
        put(MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        put(INITIAL_WINDOW_SIZE, self.initial_window_size);
        put(MAX_FRAME_SIZE, self.max_frame_size);
        put(MAX_HEADER_LIST_SIZE, self.max_header_list_size);
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        let mut count = |v: &Option<u32>| {
            if v.is_some() {
                len += 6;
            }
        };
        count(&self.header_table_size);
        count(&self.enable_push);
        count(&self.max_concurrent_streams);
        count(&self.initial_window_size);
        count(&self.max_frame_size);
        count(&self.max_header_list_size);
        len
    }
}
