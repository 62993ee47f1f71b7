use bytes::{BufMut, Bytes};

use super::{Head, Kind, Reason, StreamId};

/// A WINDOW_UPDATE frame for the connection (stream 0) or one stream.
#[derive(Debug, Copy, Clone)]
pub(crate) struct WindowUpdate {
    pub(crate) stream_id: StreamId,
    pub(crate) increment: u32,
}

impl WindowUpdate {
    pub(crate) fn new(stream_id: StreamId, increment: u32) -> WindowUpdate {
        WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<WindowUpdate, Reason> {
        if payload.len() != 4 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        // reuse the stream-id parser: same 31-bit + reserved layout
        let (increment, _) = StreamId::parse(&payload);
        let increment: u32 = increment.into();
        if increment == 0 {
            return Err(Reason::PROTOCOL_ERROR);
        }
        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            increment,
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        Head::new(Kind::WindowUpdate, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.increment);
    }
}
