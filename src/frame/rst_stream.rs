use bytes::{Buf, BufMut, Bytes};

use super::{Head, Kind, Reason, StreamId};

/// A RST_STREAM frame, abruptly terminating one stream.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RstStream {
    pub(crate) stream_id: StreamId,
    pub(crate) reason: Reason,
}

impl RstStream {
    pub(crate) fn new(stream_id: StreamId, reason: Reason) -> RstStream {
        RstStream { stream_id, reason }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<RstStream, Reason> {
        if head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if payload.len() != 4 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        Ok(RstStream {
            stream_id: head.stream_id(),
            reason: payload.get_u32().into(),
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        Head::new(Kind::Reset, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}
