//! Shared machinery for the integration tests: an in-memory duplex
//! transport, a frame-level HTTP/2 test client, and a small host that
//! answers requests like an ordinary HTTP/1.1 stack would.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use weft::{Host, SubConn, Transport};

pub fn init_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ===== in-memory duplex transport =====

#[derive(Default)]
struct ChanState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Chan {
    state: Mutex<ChanState>,
    cond: Condvar,
}

impl Chan {
    fn push(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.data.extend(bytes);
        self.cond.notify_all();
        Ok(())
    }

    fn pull(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.data.is_empty() && !state.closed {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    guard
                }
                None => self.cond.wait(state).unwrap(),
            };
        }
        if state.data.is_empty() {
            return Ok(0); // closed
        }
        let n = buf.len().min(state.data.len());
        for (i, byte) in state.data.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }

    fn try_pull(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.data.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.data.len());
        for (i, byte) in state.data.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// One end of an in-memory duplex pipe. The server end implements
/// `weft::Transport`; the client end drives the test.
pub struct PipeEnd {
    rx: Arc<Chan>,
    tx: Arc<Chan>,
}

pub fn pipe() -> (PipeEnd, PipeEnd) {
    let a = Arc::new(Chan::default());
    let b = Arc::new(Chan::default());
    (
        PipeEnd {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
        },
        PipeEnd { rx: b, tx: a },
    )
}

impl PipeEnd {
    pub fn send(&self, bytes: &[u8]) {
        self.tx.push(bytes).expect("peer closed");
    }

    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.rx.pull(buf, Some(timeout))
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

impl Transport for PipeEnd {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        self.rx.pull(buf, timeout)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.try_pull(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.tx.close();
        Ok(())
    }
}

// ===== frame-level test client =====

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DATA: u8 = 0;
pub const HEADERS: u8 = 1;
pub const PRIORITY: u8 = 2;
pub const RST_STREAM: u8 = 3;
pub const SETTINGS: u8 = 4;
pub const PUSH_PROMISE: u8 = 5;
pub const PING: u8 = 6;
pub const GOAWAY: u8 = 7;
pub const WINDOW_UPDATE: u8 = 8;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_ACK: u8 = 0x1;

/// A raw frame as seen on the wire.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Drives the client side of a connection frame by frame.
pub struct TestClient {
    pipe: PipeEnd,
    buf: Vec<u8>,
}

impl TestClient {
    pub fn new(pipe: PipeEnd) -> TestClient {
        TestClient {
            pipe,
            buf: Vec::new(),
        }
    }

    /// Client preface plus an empty SETTINGS frame.
    pub fn handshake(&self) {
        self.pipe.send(PREFACE);
        self.send_frame(SETTINGS, 0, 0, &[]);
    }

    pub fn send_frame(&self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let mut frame = Vec::with_capacity(9 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        frame.push(kind);
        frame.push(flags);
        frame.extend_from_slice(&stream_id.to_be_bytes());
        frame.extend_from_slice(payload);
        self.pipe.send(&frame);
    }

    /// Sends HEADERS with the fields encoded as HPACK literals without
    /// indexing (new names, no Huffman), which every decoder accepts.
    pub fn send_headers(&self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let mut block = Vec::new();
        for (name, value) in fields {
            block.push(0x00);
            block.push(name.len() as u8);
            block.extend_from_slice(name.as_bytes());
            block.push(value.len() as u8);
            block.extend_from_slice(value.as_bytes());
        }
        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        self.send_frame(HEADERS, flags, stream_id, &block);
    }

    pub fn send_get(&self, stream_id: u32, path: &str) {
        self.send_headers(
            stream_id,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", path),
                (":authority", "example.com"),
            ],
            true,
        );
    }

    pub fn send_data(&self, stream_id: u32, payload: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, payload);
    }

    pub fn send_rst(&self, stream_id: u32, code: u32) {
        self.send_frame(RST_STREAM, 0, stream_id, &code.to_be_bytes());
    }

    pub fn send_window_update(&self, stream_id: u32, increment: u32) {
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes());
    }

    pub fn send_goaway(&self, last_stream_id: u32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&last_stream_id.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        self.send_frame(GOAWAY, 0, 0, &payload);
    }

    pub fn close(&self) {
        self.pipe.close();
    }

    /// Reads the next complete frame, pulling from the pipe as needed.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<RawFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.buf.len() >= 9 {
                let len = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
                if self.buf.len() >= 9 + len {
                    let kind = self.buf[3];
                    let flags = self.buf[4];
                    let stream_id = u32::from_be_bytes([
                        self.buf[5] & 0x7f,
                        self.buf[6],
                        self.buf[7],
                        self.buf[8],
                    ]);
                    let payload = self.buf[9..9 + len].to_vec();
                    self.buf.drain(..9 + len);
                    return Some(RawFrame {
                        kind,
                        flags,
                        stream_id,
                        payload,
                    });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let mut chunk = [0u8; 16 * 1024];
            match self.pipe.recv(&mut chunk, deadline - now) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => return None,
            }
        }
    }

    /// Collects one whole response on a stream: HEADERS, DATA until
    /// END_STREAM. WINDOW_UPDATEs grow the returned credit total;
    /// frames for other streams are pushed to `other`.
    pub fn collect_response(
        &mut self,
        stream_id: u32,
        timeout: Duration,
    ) -> Response {
        let deadline = Instant::now() + timeout;
        let mut response = Response::default();
        while Instant::now() < deadline {
            let frame = match self.recv_frame(Duration::from_millis(100)) {
                Some(frame) => frame,
                None => continue,
            };
            if frame.stream_id != stream_id {
                response.other.push(frame);
                continue;
            }
            match frame.kind {
                HEADERS => {
                    if response.header_block.is_none() {
                        response.header_block = Some(frame.payload.clone());
                    } else {
                        response.trailer_block = Some(frame.payload.clone());
                    }
                    if frame.is_end_stream() {
                        response.end_stream = true;
                        return response;
                    }
                }
                DATA => {
                    response.body.extend_from_slice(&frame.payload);
                    if frame.is_end_stream() {
                        response.end_stream = true;
                        return response;
                    }
                }
                RST_STREAM => {
                    let p = &frame.payload;
                    response.reset = Some(u32::from_be_bytes([p[0], p[1], p[2], p[3]]));
                    return response;
                }
                _ => response.other.push(frame),
            }
        }
        response
    }
}

/// What `collect_response` gathered for one stream.
#[derive(Debug, Default)]
pub struct Response {
    pub header_block: Option<Vec<u8>>,
    pub trailer_block: Option<Vec<u8>>,
    pub body: Vec<u8>,
    pub end_stream: bool,
    pub reset: Option<u32>,
    pub other: Vec<RawFrame>,
}

impl Response {
    /// The engine encodes `:status: 200` as the indexed static-table
    /// entry 8, so a 200 response head always starts with 0x88.
    pub fn status_is_200(&self) -> bool {
        self.header_block
            .as_ref()
            .map(|block| block.first() == Some(&0x88))
            .unwrap_or(false)
    }
}

// ===== test host =====

/// A host that reads the bridged HTTP/1.1 request fully and answers by
/// path, the way the real host's request pipeline would.
pub struct TestHost;

impl Host for TestHost {
    fn process_connection(&self, conn: &mut dyn SubConn) -> io::Result<()> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = conn.read(&mut buf)?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        let request = parse_request(&raw);

        match request.path.as_str() {
            "/" => {
                let body = b"hello world";
                write_response(conn, 200, body, &[])?;
            }
            "/echo" => {
                let body = echo_summary(&request.body);
                write_response(conn, 200, body.as_bytes(), &[])?;
            }
            path if path.starts_with("/slow") => {
                // dribble a long body so the client can interrupt
                conn.write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 40960\r\n\r\n",
                )?;
                for i in 0..40u8 {
                    conn.write_all(&[i; 1024])?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            path if path.starts_with("/block") => {
                // a fixed 8 KiB body written in 2 KiB slices, which
                // exercises the stream output cap when it is small
                conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 8192\r\n\r\n")?;
                for i in 0..4u8 {
                    conn.write_all(&[b'a' + i; 2048])?;
                }
            }
            path if path.starts_with("/nap") => {
                std::thread::sleep(Duration::from_millis(300));
                write_response(conn, 200, b"rested", &[])?;
            }
            _ => {
                write_response(conn, 404, b"not found", &[])?;
            }
        }
        Ok(())
    }
}

pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Parses the bridged request; de-chunks the body if needed.
pub fn parse_request(raw: &[u8]) -> ParsedRequest {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request.parse(raw) {
        Ok(httparse::Status::Complete(n)) => n,
        other => panic!("bad bridged request: {:?}", other),
    };
    let chunked = request.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("transfer-encoding")
            && h.value.eq_ignore_ascii_case(b"chunked")
    });
    let mut body = raw[head_len..].to_vec();
    if chunked {
        body = dechunk(&body);
    }
    ParsedRequest {
        method: request.method.unwrap_or("").to_string(),
        path: request.path.unwrap_or("").to_string(),
        body,
    }
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = match raw.windows(2).position(|w| w == b"\r\n") {
            Some(at) => at,
            None => panic!("truncated chunk size line"),
        };
        let size = usize::from_str_radix(
            std::str::from_utf8(&raw[..line_end]).unwrap().trim(),
            16,
        )
        .unwrap();
        raw = &raw[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

/// First and last bytes plus length, enough to prove order end to end.
pub fn echo_summary(body: &[u8]) -> String {
    format!(
        "len={} first={} last={}",
        body.len(),
        body.first().copied().unwrap_or(0),
        body.last().copied().unwrap_or(0),
    )
}

pub fn write_response(
    conn: &mut dyn SubConn,
    status: u16,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\ncontent-length: {}\r\n", status, reason, body.len());
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    conn.write_all(head.as_bytes())?;
    conn.write_all(body)
}
