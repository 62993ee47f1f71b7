//! The frame codec: everything between raw transport bytes and typed
//! frame events.
//!
//! The session owns exactly one `FrameCodec` and is its only caller.
//! Inbound, the codec eats the client preface, reassembles CONTINUATION
//! runs, and runs HPACK, handing the session decoded events. Outbound,
//! it serializes frames into the ConnIO write buffer and keeps the
//! send-side flow-control accounting.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::frame::{
    self, Data, GoAway, Head, HeadersFragment, Kind, Ping, Priority, PushPromise,
    Reason, RstStream, Settings, StreamDependency, StreamId, WindowUpdate,
};
use crate::hpack;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// The default connection-level send window before the peer says
/// otherwise (RFC 7540 §6.9.2).
const DEFAULT_WINDOW: i64 = 65_535;

/// Largest legal window, connection or stream.
pub(crate) const MAX_WINDOW: i64 = (1 << 31) - 1;

/// A decoded header block, ready for request assembly.
#[derive(Debug)]
pub(crate) struct DecodedHeaders {
    pub(crate) stream_id: StreamId,
    pub(crate) eos: bool,
    pub(crate) priority: Option<StreamDependency>,
    pub(crate) fields: Vec<(Bytes, Bytes)>,
}

/// One inbound protocol event for the session's dispatch function.
#[derive(Debug)]
pub(crate) enum Event {
    Headers(DecodedHeaders),
    Data(Data),
    Priority(Priority),
    Reset(RstStream),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
}

/// Settings currently in force for the peer (what the client sent us).
#[derive(Debug)]
pub(crate) struct RemoteSettings {
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) enable_push: bool,
}

impl Default for RemoteSettings {
    fn default() -> RemoteSettings {
        RemoteSettings {
            initial_window_size: DEFAULT_WINDOW as u32,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            enable_push: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct FrameCodec {
    hpack_decoder: hpack::Decoder,
    hpack_encoder: hpack::Encoder,
    /// Bytes of the client preface still unconsumed.
    preface_left: usize,
    /// A header block still waiting for its CONTINUATION frames.
    partial: Option<HeadersFragment>,
    remote: RemoteSettings,
    /// Our settings are fixed at session start; the codec only tracks
    /// whether the peer acknowledged them.
    local_acked: bool,
    /// Connection-level send window.
    conn_send_window: i64,
    /// Connection-level receive window (what we allow the peer to send).
    conn_recv_window: i64,
    /// Largest frame payload we accept; ours, never negotiated upward.
    max_recv_frame_size: usize,
}

impl FrameCodec {
    pub(crate) fn new(max_header_list_size: usize) -> FrameCodec {
        FrameCodec {
            hpack_decoder: hpack::Decoder::new(max_header_list_size),
            hpack_encoder: hpack::Encoder::new(),
            preface_left: PREFACE.len(),
            partial: None,
            remote: RemoteSettings::default(),
            local_acked: false,
            conn_send_window: DEFAULT_WINDOW,
            conn_recv_window: DEFAULT_WINDOW,
            max_recv_frame_size: frame::DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    // ===== receive side =====

    /// Decodes the next event out of `src`, or `None` if more bytes are
    /// needed. Protocol violations come back as `BadFrame` errors
    /// carrying the GOAWAY reason.
    pub(crate) fn poll_event(&mut self, src: &mut BytesMut) -> Result<Option<Event>> {
        loop {
            if self.preface_left > 0 {
                let take = self.preface_left.min(src.len());
                let offset = PREFACE.len() - self.preface_left;
                if src[..take] != PREFACE[offset..offset + take] {
                    debug!("client preface mismatch");
                    return Err(Error::new_bad_frame(Reason::PROTOCOL_ERROR));
                }
                src.advance(take);
                self.preface_left -= take;
                if self.preface_left > 0 {
                    return Ok(None);
                }
                trace!("client preface consumed");
            }

            if src.len() < frame::HEADER_LEN {
                return Ok(None);
            }
            let payload_len =
                u32::from_be_bytes([0, src[0], src[1], src[2]]) as usize;
            if payload_len > self.max_recv_frame_size {
                debug!("oversized frame: {} bytes", payload_len);
                return Err(Error::new_bad_frame(Reason::FRAME_SIZE_ERROR));
            }
            if src.len() < frame::HEADER_LEN + payload_len {
                return Ok(None);
            }
            let head = Head::parse(&src[..frame::HEADER_LEN]);
            src.advance(frame::HEADER_LEN);
            let payload = src.split_to(payload_len).freeze();
            trace!(
                "recv frame {:?} stream={} len={}",
                head.kind(),
                head.stream_id(),
                payload_len
            );

            if let Some(mut partial) = self.partial.take() {
                if head.kind() != Kind::Continuation {
                    debug!("expected CONTINUATION, got {:?}", head.kind());
                    return Err(Error::new_bad_frame(Reason::PROTOCOL_ERROR));
                }
                partial
                    .extend(head, payload)
                    .map_err(Error::new_bad_frame)?;
                if partial.end_headers {
                    return Ok(Some(self.finish_headers(partial)?));
                }
                self.partial = Some(partial);
                continue;
            }

            let event = match head.kind() {
                Kind::Data => {
                    let data = Data::load(head, payload).map_err(Error::new_bad_frame)?;
                    self.conn_recv_window -= data.flow_len() as i64;
                    if self.conn_recv_window < 0 {
                        return Err(Error::new_bad_frame(Reason::FLOW_CONTROL_ERROR));
                    }
                    Event::Data(data)
                }
                Kind::Headers => {
                    let fragment =
                        HeadersFragment::load(head, payload).map_err(Error::new_bad_frame)?;
                    if !fragment.end_headers {
                        self.partial = Some(fragment);
                        continue;
                    }
                    self.finish_headers(fragment)?
                }
                Kind::Priority => Event::Priority(
                    Priority::load(head, &payload).map_err(Error::new_bad_frame)?,
                ),
                Kind::Reset => Event::Reset(
                    RstStream::load(head, payload).map_err(Error::new_bad_frame)?,
                ),
                Kind::Settings => {
                    let settings =
                        Settings::load(head, payload).map_err(Error::new_bad_frame)?;
                    if settings.ack {
                        self.local_acked = true;
                        continue;
                    }
                    Event::Settings(settings)
                }
                Kind::Ping => {
                    Event::Ping(Ping::load(head, payload).map_err(Error::new_bad_frame)?)
                }
                Kind::GoAway => Event::GoAway(
                    GoAway::load(head, payload).map_err(Error::new_bad_frame)?,
                ),
                Kind::WindowUpdate => {
                    let update =
                        WindowUpdate::load(head, payload).map_err(Error::new_bad_frame)?;
                    if update.stream_id.is_zero() {
                        self.conn_send_window += update.increment as i64;
                        if self.conn_send_window > MAX_WINDOW {
                            return Err(Error::new_bad_frame(Reason::FLOW_CONTROL_ERROR));
                        }
                        continue;
                    }
                    Event::WindowUpdate(update)
                }
                Kind::PushPromise => {
                    // clients do not push
                    debug!("received PUSH_PROMISE from client");
                    return Err(Error::new_bad_frame(Reason::PROTOCOL_ERROR));
                }
                Kind::Continuation => {
                    debug!("CONTINUATION without open header block");
                    return Err(Error::new_bad_frame(Reason::PROTOCOL_ERROR));
                }
                Kind::Unknown => {
                    // unknown frame types must be ignored
                    continue;
                }
            };
            return Ok(Some(event));
        }
    }

    fn finish_headers(&mut self, fragment: HeadersFragment) -> Result<Event> {
        let fields = self
            .hpack_decoder
            .decode(&fragment.fragment)
            .map_err(|err| {
                debug!("hpack decoding failed: {:?}", err);
                match err {
                    hpack::DecoderError::ListTooLarge => {
                        Error::new_bad_frame(Reason::ENHANCE_YOUR_CALM)
                    }
                    _ => Error::new_bad_frame(Reason::COMPRESSION_ERROR),
                }
            })?;
        Ok(Event::Headers(DecodedHeaders {
            stream_id: fragment.stream_id,
            eos: fragment.eos,
            priority: fragment.priority,
            fields,
        }))
    }

    /// Applies a non-ack SETTINGS frame from the peer. Returns the
    /// change to apply to every open stream's send window.
    pub(crate) fn apply_remote_settings(&mut self, settings: &Settings) -> i64 {
        let mut delta = 0;
        if let Some(size) = settings.initial_window_size {
            delta = size as i64 - self.remote.initial_window_size as i64;
            self.remote.initial_window_size = size;
        }
        if let Some(size) = settings.max_frame_size {
            self.remote.max_frame_size = size;
        }
        if let Some(push) = settings.enable_push {
            self.remote.enable_push = push == 1;
        }
        delta
    }

    /// Applies the base64url-decoded `HTTP2-Settings` payload of an h2c
    /// upgrade as the client's first SETTINGS frame.
    pub(crate) fn apply_upgrade_settings(&mut self, payload: &[u8]) -> Result<i64> {
        let settings = Settings::from_payload(payload).map_err(Error::new_bad_frame)?;
        Ok(self.apply_remote_settings(&settings))
    }

    pub(crate) fn remote(&self) -> &RemoteSettings {
        &self.remote
    }

    /// The send window a new stream starts with.
    pub(crate) fn initial_send_window(&self) -> i64 {
        self.remote.initial_window_size as i64
    }

    pub(crate) fn conn_send_window(&self) -> i64 {
        self.conn_send_window
    }

    /// Grows the connection receive window back by `n` consumed bytes
    /// and returns the WINDOW_UPDATE increment to send, if due.
    pub(crate) fn consume_conn_recv(&mut self, n: u32) -> u32 {
        self.conn_recv_window += n as i64;
        n
    }

    /// Raises the connection receive window near the maximum; returns
    /// the increment to announce.
    pub(crate) fn disable_conn_flow_control(&mut self) -> u32 {
        let increment = (MAX_WINDOW - self.conn_recv_window) as u32;
        self.conn_recv_window = MAX_WINDOW;
        increment
    }

    // ===== send side =====

    pub(crate) fn encode_settings(&mut self, settings: &Settings, dst: &mut BytesMut) {
        trace!("send SETTINGS {:?}", settings);
        settings.encode(dst);
    }

    pub(crate) fn encode_settings_ack(&mut self, dst: &mut BytesMut) {
        trace!("send SETTINGS ack");
        Settings::ack().encode(dst);
    }

    pub(crate) fn encode_ping_ack(&mut self, payload: [u8; 8], dst: &mut BytesMut) {
        Ping::pong(payload).encode(dst);
    }

    pub(crate) fn encode_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
        dst: &mut BytesMut,
    ) {
        trace!("send WINDOW_UPDATE stream={} inc={}", stream_id, increment);
        WindowUpdate::new(stream_id, increment).encode(dst);
    }

    pub(crate) fn encode_rst_stream(
        &mut self,
        stream_id: StreamId,
        reason: Reason,
        dst: &mut BytesMut,
    ) {
        debug!("send RST_STREAM stream={} {:?}", stream_id, reason);
        RstStream::new(stream_id, reason).encode(dst);
    }

    pub(crate) fn encode_goaway(
        &mut self,
        last_stream_id: StreamId,
        reason: Reason,
        dst: &mut BytesMut,
    ) {
        debug!("send GOAWAY last={} {:?}", last_stream_id, reason);
        GoAway::new(last_stream_id, reason).encode(dst);
    }

    /// HPACK-encodes and frames a response or trailer block.
    pub(crate) fn encode_headers<'a, I>(
        &mut self,
        stream_id: StreamId,
        fields: I,
        eos: bool,
        dst: &mut BytesMut,
    ) where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let block = self.hpack_encoder.encode(fields);
        frame::encode_headers(stream_id, block, eos, self.remote.max_frame_size as usize, dst);
    }

    /// Frames a PUSH_PROMISE announcing `promised_id` with the given
    /// request headers.
    pub(crate) fn encode_push_promise<'a, I>(
        &mut self,
        stream_id: StreamId,
        promised_id: StreamId,
        fields: I,
        dst: &mut BytesMut,
    ) where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let block = self.hpack_encoder.encode(fields);
        PushPromise {
            stream_id,
            promised_id,
            block,
        }
        .encode(self.remote.max_frame_size as usize, dst);
    }

    /// Emits one DATA frame, debiting the connection send window. The
    /// caller is responsible for the stream-level window.
    pub(crate) fn encode_data(
        &mut self,
        stream_id: StreamId,
        payload: &[u8],
        eos: bool,
        dst: &mut BytesMut,
    ) {
        debug_assert!(payload.len() as i64 <= self.conn_send_window);
        debug_assert!(payload.len() <= self.remote.max_frame_size as usize);
        self.conn_send_window -= payload.len() as i64;
        Data::encode(stream_id, payload, eos, dst);
    }

    /// Largest DATA payload currently sendable on a stream with the
    /// given send window.
    pub(crate) fn max_data_len(&self, stream_window: i64, wanted: usize) -> usize {
        let cap = self
            .conn_send_window
            .min(stream_window)
            .max(0)
            .min(self.remote.max_frame_size as i64) as usize;
        cap.min(wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn codec() -> FrameCodec {
        FrameCodec::new(16 * 1024)
    }

    fn with_preface(frames: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(PREFACE);
        buf.put_slice(frames);
        buf
    }

    #[test]
    fn preface_then_settings() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        Settings::default().encode(&mut wire);
        let mut src = with_preface(&wire);

        match codec.poll_event(&mut src).unwrap() {
            Some(Event::Settings(s)) => assert!(!s.ack),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(codec.poll_event(&mut src).unwrap().is_none());
    }

    #[test]
    fn preface_can_arrive_in_pieces() {
        let mut codec = codec();
        let mut src = BytesMut::from(&PREFACE[..10]);
        assert!(codec.poll_event(&mut src).unwrap().is_none());
        let mut src = BytesMut::from(&PREFACE[10..]);
        assert!(codec.poll_event(&mut src).unwrap().is_none());
        assert_eq!(codec.preface_left, 0);
    }

    #[test]
    fn bad_preface_is_rejected() {
        let mut codec = codec();
        let mut src = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        let err = codec.poll_event(&mut src).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn headers_span_continuation() {
        let mut client = hpack::Encoder::new();
        let block = client.encode(vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"https"[..]),
            (&b":path"[..], &b"/"[..]),
            (&b":authority"[..], &b"example.com"[..]),
        ]);

        // split the block across HEADERS + CONTINUATION by hand
        let split = block.len() / 2;
        let mut wire = BytesMut::new();
        Head::new(Kind::Headers, frame::END_STREAM, StreamId::from(1))
            .encode(split, &mut wire);
        wire.put_slice(&block[..split]);
        Head::new(Kind::Continuation, frame::END_HEADERS, StreamId::from(1))
            .encode(block.len() - split, &mut wire);
        wire.put_slice(&block[split..]);

        let mut codec = codec();
        let mut src = with_preface(&wire);
        match codec.poll_event(&mut src).unwrap() {
            Some(Event::Headers(h)) => {
                assert_eq!(h.stream_id, StreamId::from(1));
                assert!(h.eos);
                assert_eq!(&h.fields[0].1[..], b"GET");
                assert_eq!(&h.fields[3].1[..], b"example.com");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn interleaved_frame_during_continuation_is_fatal() {
        let mut wire = BytesMut::new();
        Head::new(Kind::Headers, 0, StreamId::from(1)).encode(0, &mut wire);
        Ping::pong([0; 8]).encode(&mut wire);

        let mut codec = codec();
        let mut src = with_preface(&wire);
        let err = codec.poll_event(&mut src).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn settings_ack_is_swallowed() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        Settings::ack().encode(&mut wire);
        let mut src = with_preface(&wire);
        assert!(codec.poll_event(&mut src).unwrap().is_none());
        assert!(codec.local_acked);
    }

    #[test]
    fn connection_window_update_is_absorbed() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        WindowUpdate::new(StreamId::ZERO, 1000).encode(&mut wire);
        let mut src = with_preface(&wire);
        assert!(codec.poll_event(&mut src).unwrap().is_none());
        assert_eq!(codec.conn_send_window(), DEFAULT_WINDOW + 1000);
    }

    #[test]
    fn initial_window_size_yields_stream_delta() {
        let mut codec = codec();
        let settings = Settings {
            initial_window_size: Some(100),
            ..Settings::default()
        };
        assert_eq!(codec.apply_remote_settings(&settings), 100 - DEFAULT_WINDOW);
        assert_eq!(codec.initial_send_window(), 100);
    }

    #[test]
    fn max_data_len_respects_all_limits() {
        let mut codec = codec();
        assert_eq!(codec.max_data_len(10, 100), 10);
        assert_eq!(codec.max_data_len(1 << 20, 100), 100);
        codec.conn_send_window = 5;
        assert_eq!(codec.max_data_len(1 << 20, 100), 5);
        codec.conn_send_window = -1;
        assert_eq!(codec.max_data_len(1 << 20, 100), 0);
    }
}
