use bytes::{BufMut, Bytes};

use super::{strip_padding, Head, Kind, Reason, StreamId, END_STREAM, PADDED};

/// A DATA frame: a chunk of a request or response body.
#[derive(Debug)]
pub(crate) struct Data {
    pub(crate) stream_id: StreamId,
    pub(crate) payload: Bytes,
    pub(crate) eos: bool,
    pub(crate) pad_len: u8,
}

impl Data {
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Data, Reason> {
        if head.stream_id().is_zero() {
            return Err(Reason::PROTOCOL_ERROR);
        }
        let pad_len = if head.is_flagged(PADDED) {
            strip_padding(&mut payload)?
        } else {
            0
        };
        Ok(Data {
            stream_id: head.stream_id(),
            payload,
            eos: head.is_flagged(END_STREAM),
            pad_len,
        })
    }

    /// Flow-controlled size of the frame: payload plus any padding plus
    /// the pad-length octet (RFC 7540 §6.9.1).
    pub(crate) fn flow_len(&self) -> usize {
        let pad = self.pad_len as usize;
        self.payload.len() + pad + if pad > 0 { 1 } else { 0 }
    }

    pub(crate) fn encode<T: BufMut>(
        stream_id: StreamId,
        payload: &[u8],
        eos: bool,
        dst: &mut T,
    ) {
        let flag = if eos { END_STREAM } else { 0 };
        Head::new(Kind::Data, flag, stream_id).encode(payload.len(), dst);
        dst.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_padded_data() {
        let head = Head::new(Kind::Data, PADDED | END_STREAM, StreamId::from(1));
        let payload = Bytes::from_static(&[1, b'o', b'k', 0]);
        let data = Data::load(head, payload).unwrap();
        assert_eq!(&data.payload[..], b"ok");
        assert!(data.eos);
        assert_eq!(data.flow_len(), 4);
    }

    #[test]
    fn data_on_stream_zero_is_rejected() {
        let head = Head::new(Kind::Data, 0, StreamId::ZERO);
        assert_eq!(
            Data::load(head, Bytes::new()).unwrap_err(),
            Reason::PROTOCOL_ERROR
        );
    }
}
