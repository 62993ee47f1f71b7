//! Session-side stream state.
//!
//! A stream's cross-thread I/O buffers live in the multiplexer; what
//! lives here is everything only the session thread touches: the
//! HTTP/2 lifecycle state, request assembly from decoded header fields,
//! priority, and flow-control windows.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, trace};

use crate::frame::{Reason, StreamId, DEFAULT_WEIGHT};

/// The HTTP/2 stream lifecycle (RFC 7540 §5.1), reserved states folded
/// into the send/recv closed pair the server engine actually visits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    Closed,
}

/// A captured request, ready to hand to a task.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The request method.
    pub method: Method,
    /// The `:scheme` pseudo header.
    pub scheme: String,
    /// The `:authority` pseudo header (or `Host` fallback).
    pub authority: String,
    /// The `:path` pseudo header.
    pub path: String,
    /// Regular request headers, in arrival order.
    pub headers: HeaderMap,
    /// Whether the request body was already complete at headers-end.
    pub eos: bool,
    /// Whether the body must be serialized chunked for the host.
    pub chunked: bool,
}

/// A captured response head, set exactly once before any body output.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// The response status.
    pub status: StatusCode,
    /// Response headers as captured from the host, connection-scoped
    /// ones already stripped.
    pub headers: HeaderMap,
}

/// What the session knows about one stream.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) state: StreamState,
    /// DATA emission is paused until the multiplexer reports output.
    pub(crate) suspended: bool,
    /// Set when either side reset the stream.
    pub(crate) rst_error: Option<Reason>,
    /// Response HEADERS were submitted to the codec.
    pub(crate) submitted: bool,
    /// A task was scheduled for this stream.
    pub(crate) scheduled: bool,
    /// Pseudo-header assembly, complete once `request` is built.
    assembly: Assembly,
    pub(crate) request: Option<RequestHead>,
    /// Trailing headers received after the body, kept with the request.
    pub(crate) trailers: Option<HeaderMap>,
    // priority
    pub(crate) parent: StreamId,
    pub(crate) weight: u16,
    // flow control
    pub(crate) send_window: i64,
    pub(crate) recv_window: i64,
    pub(crate) data_sent: u64,
    pub(crate) data_received: u64,
}

#[derive(Debug, Default)]
struct Assembly {
    method: Option<Bytes>,
    scheme: Option<Bytes>,
    authority: Option<Bytes>,
    path: Option<Bytes>,
    headers: HeaderMap,
    malformed: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, send_window: i64, recv_window: i64) -> Stream {
        Stream {
            id,
            state: StreamState::Idle,
            suspended: false,
            rst_error: None,
            submitted: false,
            scheduled: false,
            assembly: Assembly::default(),
            request: None,
            trailers: None,
            parent: StreamId::ZERO,
            weight: DEFAULT_WEIGHT,
            send_window,
            recv_window,
            data_sent: 0,
            data_received: 0,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Remote closed its sending direction (END_STREAM received).
    pub(crate) fn recv_close(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
        };
        trace!("stream {} recv_close -> {:?}", self.id, self.state);
    }

    /// We closed our sending direction (END_STREAM sent).
    pub(crate) fn send_close(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedLocal => StreamState::HalfClosedLocal,
        };
        trace!("stream {} send_close -> {:?}", self.id, self.state);
    }

    pub(crate) fn open(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    pub(crate) fn reset(&mut self, reason: Reason) {
        self.rst_error = Some(reason);
        self.state = StreamState::Closed;
    }

    /// Feeds one decoded header field into request assembly.
    ///
    /// Pseudo headers bind the request line; unknown pseudo headers and
    /// uppercase names mark the request malformed, which surfaces as a
    /// stream error at end-of-headers.
    pub(crate) fn recv_header(&mut self, name: Bytes, value: Bytes) {
        let asm = &mut self.assembly;
        if name.starts_with(b":") {
            match &name[..] {
                b":method" => asm.method = Some(value),
                b":scheme" => asm.scheme = Some(value),
                b":authority" => asm.authority = Some(value),
                b":path" => asm.path = Some(value),
                _ => {
                    debug!("ignoring unknown pseudo header {:?}", name);
                }
            }
            return;
        }
        let header = HeaderName::from_bytes(&name)
            .ok()
            .filter(|_| !name.iter().any(u8::is_ascii_uppercase))
            .zip(HeaderValue::from_bytes(&value).ok());
        match header {
            Some((name, value)) => {
                asm.headers.append(name, value);
            }
            None => {
                debug!("malformed header field {:?}", name);
                asm.malformed = true;
            }
        }
    }

    /// Ends the header block and builds the request, applying the
    /// HTTP/1.1 bridging rules:
    ///
    /// - `:authority` overrides `Host`; with neither the request is
    ///   malformed.
    /// - Without `content-length` and without END_STREAM the body is
    ///   bridged as chunked.
    /// - END_STREAM at headers-end with a `content-type` gets an
    ///   explicit `content-length: 0`.
    pub(crate) fn end_headers(&mut self, eos: bool) -> Result<&RequestHead, Reason> {
        let asm = &mut self.assembly;
        if asm.malformed {
            return Err(Reason::PROTOCOL_ERROR);
        }
        let method = asm
            .method
            .take()
            .and_then(|m| Method::from_bytes(&m).ok())
            .ok_or(Reason::PROTOCOL_ERROR)?;
        let scheme = take_utf8(&mut asm.scheme).ok_or(Reason::PROTOCOL_ERROR)?;
        let path = take_utf8(&mut asm.path).ok_or(Reason::PROTOCOL_ERROR)?;

        let authority = match take_utf8(&mut asm.authority) {
            Some(authority) => {
                let host = HeaderValue::from_str(&authority)
                    .map_err(|_| Reason::PROTOCOL_ERROR)?;
                asm.headers.insert(http::header::HOST, host);
                authority
            }
            None => match asm.headers.get(http::header::HOST) {
                Some(host) => host
                    .to_str()
                    .map_err(|_| Reason::PROTOCOL_ERROR)?
                    .to_string(),
                None => return Err(Reason::PROTOCOL_ERROR),
            },
        };

        let mut chunked = false;
        if asm.headers.get(http::header::CONTENT_LENGTH).is_none() {
            if !eos {
                chunked = true;
            } else if asm.headers.get(http::header::CONTENT_TYPE).is_some() {
                asm.headers.insert(
                    http::header::CONTENT_LENGTH,
                    HeaderValue::from_static("0"),
                );
            }
        }

        self.request = Some(RequestHead {
            method,
            scheme,
            authority,
            path,
            headers: std::mem::take(&mut asm.headers),
            eos,
            chunked,
        });
        Ok(self.request.as_ref().unwrap())
    }

    /// Stores trailing headers arriving after the request body.
    pub(crate) fn recv_trailers(&mut self, fields: Vec<(Bytes, Bytes)>) {
        let mut map = HeaderMap::new();
        for (name, value) in fields {
            if name.starts_with(b":") {
                debug!("pseudo header in trailers on stream {}", self.id);
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(&name),
                HeaderValue::from_bytes(&value),
            ) {
                map.append(name, value);
            }
        }
        self.trailers = Some(map);
    }
}

fn take_utf8(src: &mut Option<Bytes>) -> Option<String> {
    src.take()
        .and_then(|b| String::from_utf8(b.to_vec()).ok())
}
