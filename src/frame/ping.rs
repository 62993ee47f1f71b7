use bytes::{BufMut, Bytes};

use super::{Head, Kind, Reason, StreamId, ACK};

/// A PING frame; the engine only ever answers them.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Ping {
    pub(crate) ack: bool,
    pub(crate) payload: [u8; 8],
}

impl Ping {
    pub(crate) fn pong(payload: [u8; 8]) -> Ping {
        Ping { ack: true, payload }
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Ping, Reason> {
        if !head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if payload.len() != 8 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&payload);
        Ok(Ping {
            ack: head.is_flagged(ACK),
            payload: bytes,
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        let flag = if self.ack { ACK } else { 0 };
        Head::new(Kind::Ping, flag, StreamId::ZERO).encode(8, dst);
        dst.put_slice(&self.payload);
    }
}
