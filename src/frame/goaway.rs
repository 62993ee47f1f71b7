use bytes::{Buf, BufMut, Bytes};

use super::{Head, Kind, Reason, StreamId};

/// A GOAWAY frame: no more streams past `last_stream_id`.
#[derive(Debug, Clone)]
pub(crate) struct GoAway {
    pub(crate) last_stream_id: StreamId,
    pub(crate) reason: Reason,
    pub(crate) debug_data: Bytes,
}

impl GoAway {
    pub(crate) fn new(last_stream_id: StreamId, reason: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<GoAway, Reason> {
        if !head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if payload.len() < 8 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        payload.advance(4);
        let reason = payload.get_u32().into();
        Ok(GoAway {
            last_stream_id,
            reason,
            debug_data: payload,
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        Head::new(Kind::GoAway, 0, StreamId::ZERO)
            .encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.into());
        dst.put_u32(self.reason.into());
        dst.put_slice(&self.debug_data);
    }
}
