use bytes::BufMut;

use super::StreamId;

/// The fixed 9-byte header every HTTP/2 frame starts with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Unknown,
}

// ===== impl Head =====

impl Head {
    pub(crate) fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse an HTTP/2 frame header.
    pub(crate) fn parse(header: &[u8]) -> Head {
        let (stream_id, _) = StreamId::parse(&header[5..]);

        Head {
            kind: Kind::new(header[3]),
            flag: header[4],
            stream_id,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn is_flagged(&self, flag: u8) -> bool {
        self.flag & flag == flag
    }

    pub(crate) fn encode<T: BufMut>(&self, payload_len: usize, dst: &mut T) {
        debug_assert!(payload_len < 1 << 24);

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.into());
    }
}

// ===== impl Kind =====

impl Kind {
    pub(crate) fn new(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            _ => Kind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inverts_encode() {
        let head = Head::new(Kind::Settings, super::super::ACK, StreamId::ZERO);
        let mut buf = Vec::new();
        head.encode(0, &mut buf);
        assert_eq!(buf.len(), super::super::HEADER_LEN);
        assert_eq!(Head::parse(&buf), head);
    }

    #[test]
    fn reserved_bit_is_ignored() {
        let raw = [0, 0, 0, 0, 0, 0x80, 0, 0, 3];
        let head = Head::parse(&raw);
        assert_eq!(head.stream_id(), StreamId::from(3));
    }
}
