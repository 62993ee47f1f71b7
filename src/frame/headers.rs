use bytes::{BufMut, Bytes};

use super::priority::split_dependency;
use super::{
    strip_padding, Head, Kind, Reason, StreamDependency, StreamId, END_HEADERS,
    END_STREAM, PADDED, PRIORITY_FLAG,
};

/// The framing-level view of a HEADERS frame: flags, optional priority
/// block, and the still-compressed header block fragment.
///
/// The codec strings fragments together across CONTINUATION frames and
/// runs HPACK over the result; this type never sees decoded headers.
#[derive(Debug)]
pub(crate) struct HeadersFragment {
    pub(crate) stream_id: StreamId,
    pub(crate) eos: bool,
    pub(crate) end_headers: bool,
    pub(crate) priority: Option<StreamDependency>,
    pub(crate) fragment: Bytes,
}

impl HeadersFragment {
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<HeadersFragment, Reason> {
        if head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        if head.is_flagged(PADDED) {
            strip_padding(&mut payload)?;
        }
        let priority = if head.is_flagged(PRIORITY_FLAG) {
            let dependency = split_dependency(&mut payload)?;
            if dependency.dependency_id == head.stream_id() {
                return Err(Reason::PROTOCOL_ERROR);
            }
            Some(dependency)
        } else {
            None
        };
        Ok(HeadersFragment {
            stream_id: head.stream_id(),
            eos: head.is_flagged(END_STREAM),
            end_headers: head.is_flagged(END_HEADERS),
            priority,
            fragment: payload,
        })
    }

    /// Appends a CONTINUATION fragment for the same header block.
    pub(crate) fn extend(&mut self, head: Head, payload: Bytes) -> Result<(), Reason> {
        debug_assert_eq!(head.kind(), Kind::Continuation);
        if head.stream_id() != self.stream_id {
            return Err(Reason::PROTOCOL_ERROR);
        }
        self.end_headers = head.is_flagged(END_HEADERS);
        let mut joined = Vec::with_capacity(self.fragment.len() + payload.len());
        joined.extend_from_slice(&self.fragment);
        joined.extend_from_slice(&payload);
        self.fragment = joined.into();
        Ok(())
    }
}

/// Encodes a HEADERS frame, splitting the already-compressed block into
/// CONTINUATION frames when it exceeds the peer's max frame size.
pub(crate) fn encode_headers<T: BufMut>(
    stream_id: StreamId,
    mut block: Bytes,
    eos: bool,
    max_frame_size: usize,
    dst: &mut T,
) {
    let mut flag = if eos { END_STREAM } else { 0 };
    let first_len = block.len().min(max_frame_size);
    let first = block.split_to(first_len);
    if block.is_empty() {
        flag |= END_HEADERS;
    }
    Head::new(Kind::Headers, flag, stream_id).encode(first.len(), dst);
    dst.put_slice(&first);

    while !block.is_empty() {
        let len = block.len().min(max_frame_size);
        let chunk = block.split_to(len);
        let flag = if block.is_empty() { END_HEADERS } else { 0 };
        Head::new(Kind::Continuation, flag, stream_id).encode(chunk.len(), dst);
        dst.put_slice(&chunk);
    }
}

/// A PUSH_PROMISE frame the server emits to announce a pushed stream.
///
/// Servers never legally *receive* these, so only the encode side exists.
#[derive(Debug)]
pub(crate) struct PushPromise {
    pub(crate) stream_id: StreamId,
    pub(crate) promised_id: StreamId,
    pub(crate) block: Bytes,
}

impl PushPromise {
    pub(crate) fn encode<T: BufMut>(&self, max_frame_size: usize, dst: &mut T) {
        let mut block = self.block.clone();
        let first_len = block.len().min(max_frame_size.saturating_sub(4));
        let first = block.split_to(first_len);
        let flag = if block.is_empty() { END_HEADERS } else { 0 };
        Head::new(Kind::PushPromise, flag, self.stream_id).encode(first.len() + 4, dst);
        dst.put_u32(self.promised_id.into());
        dst.put_slice(&first);

        while !block.is_empty() {
            let len = block.len().min(max_frame_size);
            let chunk = block.split_to(len);
            let flag = if block.is_empty() { END_HEADERS } else { 0 };
            Head::new(Kind::Continuation, flag, self.stream_id).encode(chunk.len(), dst);
            dst.put_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_keeps_fragment_after_priority_and_padding() {
        let mut payload = Vec::new();
        payload.push(2u8); // pad length
        StreamDependency::new(StreamId::ZERO, 16, false).encode(&mut payload);
        payload.extend_from_slice(b"frag");
        payload.extend_from_slice(&[0, 0]);

        let head = Head::new(
            Kind::Headers,
            PADDED | PRIORITY_FLAG | END_HEADERS,
            StreamId::from(1),
        );
        let frag = HeadersFragment::load(head, payload.into()).unwrap();
        assert_eq!(&frag.fragment[..], b"frag");
        assert!(frag.end_headers);
        assert!(!frag.eos);
        assert!(frag.priority.is_some());
    }

    #[test]
    fn continuation_must_match_stream() {
        let head = Head::new(Kind::Headers, 0, StreamId::from(1));
        let mut frag = HeadersFragment::load(head, Bytes::from_static(b"a")).unwrap();
        let cont = Head::new(Kind::Continuation, END_HEADERS, StreamId::from(3));
        assert_eq!(
            frag.extend(cont, Bytes::from_static(b"b")).unwrap_err(),
            Reason::PROTOCOL_ERROR
        );
    }

    #[test]
    fn encode_splits_into_continuations() {
        let block = Bytes::from(vec![0u8; 40]);
        let mut buf = bytes::BytesMut::new();
        encode_headers(StreamId::from(1), block, true, 16, &mut buf);

        let first = Head::parse(&buf[..9]);
        assert_eq!(first.kind(), Kind::Headers);
        assert!(first.is_flagged(END_STREAM));
        assert!(!first.is_flagged(END_HEADERS));

        // 40 bytes at 16 per frame: 16 + 16 + 8
        let second = Head::parse(&buf[9 + 16..]);
        assert_eq!(second.kind(), Kind::Continuation);
        let third = Head::parse(&buf[9 + 16 + 9 + 16..]);
        assert_eq!(third.kind(), Kind::Continuation);
        assert!(third.is_flagged(END_HEADERS));
    }
}
