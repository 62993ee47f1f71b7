use bytes::{BufMut, Bytes};

use super::{Head, Reason, StreamId};

/// A PRIORITY frame, reprioritizing one stream.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Priority {
    pub(crate) stream_id: StreamId,
    pub(crate) dependency: StreamDependency,
}

/// The 5-byte dependency block shared by PRIORITY frames and prioritized
/// HEADERS.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct StreamDependency {
    /// The stream this one depends on.
    pub(crate) dependency_id: StreamId,
    /// Weight on the wire is 0..=255 and means 1..=256.
    pub(crate) weight: u16,
    pub(crate) is_exclusive: bool,
}

impl Priority {
    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Priority, Reason> {
        if head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if payload.len() != 5 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let dependency = StreamDependency::load(payload)?;
        if dependency.dependency_id == head.stream_id() {
            // a stream cannot depend on itself
            return Err(Reason::PROTOCOL_ERROR);
        }
        Ok(Priority {
            stream_id: head.stream_id(),
            dependency,
        })
    }

}

impl StreamDependency {
    pub(crate) fn new(dependency_id: StreamId, weight: u16, is_exclusive: bool) -> Self {
        debug_assert!((1..=256).contains(&weight));
        StreamDependency {
            dependency_id,
            weight,
            is_exclusive,
        }
    }

    pub(crate) fn load(src: &[u8]) -> Result<StreamDependency, Reason> {
        if src.len() < 5 {
            return Err(Reason::FRAME_SIZE_ERROR);
        }
        let (dependency_id, is_exclusive) = StreamId::parse(src);
        let weight = src[4] as u16 + 1;
        Ok(StreamDependency {
            dependency_id,
            weight,
            is_exclusive,
        })
    }

    pub(crate) fn encode<T: BufMut>(&self, dst: &mut T) {
        let mut id: u32 = self.dependency_id.into();
        if self.is_exclusive {
            id |= 1 << 31;
        }
        dst.put_u32(id);
        dst.put_u8((self.weight - 1) as u8);
    }
}

/// Strips the priority block off a prioritized HEADERS payload.
pub(crate) fn split_dependency(payload: &mut Bytes) -> Result<StreamDependency, Reason> {
    if payload.len() < 5 {
        return Err(Reason::FRAME_SIZE_ERROR);
    }
    let dependency = StreamDependency::load(&payload[..5])?;
    bytes::Buf::advance(payload, 5);
    Ok(dependency)
}

#[cfg(test)]
mod tests {
    use super::super::Kind;
    use super::*;

    #[test]
    fn exclusive_bit_round_trips() {
        let dep = StreamDependency::new(StreamId::from(3), 256, true);
        let mut buf = Vec::new();
        dep.encode(&mut buf);
        assert_eq!(StreamDependency::load(&buf).unwrap(), dep);
    }

    #[test]
    fn self_dependency_is_a_protocol_error() {
        let head = Head::new(Kind::Priority, 0, StreamId::from(5));
        let mut buf = Vec::new();
        StreamDependency::new(StreamId::from(5), 16, false).encode(&mut buf);
        assert_eq!(
            Priority::load(head, &buf).unwrap_err(),
            Reason::PROTOCOL_ERROR
        );
    }
}
