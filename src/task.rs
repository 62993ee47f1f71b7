//! Per-stream task execution.
//!
//! A task runs on a worker thread and plays both ends of an HTTP/1.1
//! conversation against the host's ordinary request pipeline: it
//! serializes the captured HTTP/2 request into request bytes (chunk-
//! framing the body when its length is unknown), and it captures the
//! host's response bytes, peeling off the status line and headers into a
//! response head and funneling body bytes into the multiplexer.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tracing::{debug, trace, warn};

use crate::error::{Error, User};
use crate::frame::StreamId;
use crate::mplx::Mplx;
use crate::stream::{RequestHead, ResponseHead};

/// How much request body a single multiplexer read may hand over.
const READ_CHUNK: usize = 16 * 1024;

/// The maximum number of response headers the capture filter parses.
const MAX_HEADERS: usize = 100;

/// The host's request pipeline, seen through the narrowest possible
/// interface: a bidirectional byte stream carrying HTTP/1.1.
///
/// The engine synthesizes request bytes on the read side and captures
/// response bytes on the write side; everything in between belongs to
/// the host.
pub trait Host: Send + Sync + 'static {
    /// Processes one sub-connection to completion.
    ///
    /// Errors bubble out of the engine's filters as ordinary
    /// `io::Error`s (aborts surface as `ConnectionAborted`); returning
    /// them here is sufficient, the engine cleans up either way.
    fn process_connection(&self, conn: &mut dyn SubConn) -> io::Result<()>;
}

/// The sub-connection handed to [`Host::process_connection`].
pub trait SubConn: Read + Write {}

impl<T: Read + Write> SubConn for T {}

/// The per-stream unit of work executed on a worker thread.
pub(crate) struct Task {
    mplx: Arc<Mplx>,
    stream_id: StreamId,
    request: RequestHead,
    host: Arc<dyn Host>,
    aborted: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("stream_id", &self.stream_id)
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        mplx: Arc<Mplx>,
        stream_id: StreamId,
        request: RequestHead,
        host: Arc<dyn Host>,
    ) -> Task {
        Task {
            mplx,
            stream_id,
            request,
            host,
            aborted: AtomicBool::new(false),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Runs the task to completion: sub-connection setup, the host
    /// pipeline, output close, and the finished callback into the mplx.
    pub(crate) fn run(self) {
        self.started.store(true, Ordering::SeqCst);
        trace!("task({}) starting", self.stream_id);

        let host = Arc::clone(&self.host);
        let mut conn = TaskConn::new(&self);
        let result = host.process_connection(&mut conn);
        let head_sent = conn.sink.head_sent();
        if let Err(err) = result {
            debug!("task({}) host pipeline ended: {}", self.stream_id, err);
        }
        if !head_sent && !self.is_aborted() {
            // the pipeline died without producing a response head; give
            // the client a plain 500 rather than silence
            let head = ResponseHead {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                headers: HeaderMap::new(),
            };
            if self.mplx.set_response(self.stream_id, head).is_err() {
                trace!("task({}) stream gone before error response", self.stream_id);
            }
        }
        let _ = self.mplx.close_output(self.stream_id);

        self.finished.store(true, Ordering::SeqCst);
        self.mplx.task_finished(self.stream_id);
        trace!("task({}) finished", self.stream_id);
    }
}

/// The sub-connection: request bytes out of `read`, response bytes into
/// `write`.
struct TaskConn<'a> {
    task: &'a Task,
    source: RequestSource,
    sink: ResponseSink<'a>,
}

impl<'a> TaskConn<'a> {
    fn new(task: &'a Task) -> TaskConn<'a> {
        TaskConn {
            task,
            source: RequestSource::new(&task.request),
            sink: ResponseSink::new(task),
        }
    }
}

impl<'a> Read for TaskConn<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.task.is_aborted() {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        self.source.read(self.task, buf)
    }
}

impl<'a> Write for TaskConn<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.task.is_aborted() {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        self.sink.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ===== request side =====

#[derive(Debug, PartialEq)]
enum ReadPhase {
    /// Streaming body bytes from the multiplexer.
    Body,
    /// Everything delivered.
    Eof,
}

/// Serializes the captured request as HTTP/1.1 for the host.
struct RequestSource {
    pending: Vec<u8>,
    pos: usize,
    phase: ReadPhase,
    chunked: bool,
}

impl RequestSource {
    fn new(request: &RequestHead) -> RequestSource {
        let mut head = Vec::with_capacity(256);
        extend(&mut head, request.method.as_str().as_bytes());
        extend(&mut head, b" ");
        extend(&mut head, request.path.as_bytes());
        extend(&mut head, b" HTTP/1.1\r\n");
        for (name, value) in request.headers.iter() {
            extend(&mut head, name.as_str().as_bytes());
            extend(&mut head, b": ");
            extend(&mut head, value.as_bytes());
            extend(&mut head, b"\r\n");
        }
        if request.chunked {
            extend(&mut head, b"transfer-encoding: chunked\r\n");
        }
        extend(&mut head, b"\r\n");

        let phase = if request.eos && !request.chunked {
            ReadPhase::Eof
        } else {
            ReadPhase::Body
        };
        RequestSource {
            pending: head,
            pos: 0,
            phase,
            chunked: request.chunked,
        }
    }

    fn read(&mut self, task: &Task, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.phase == ReadPhase::Eof {
                return Ok(0);
            }

            self.pending.clear();
            self.pos = 0;
            let (bytes, eos) = task
                .mplx
                .read_input(task.stream_id, READ_CHUNK, true)
                .map_err(io::Error::from)?;
            if !bytes.is_empty() {
                if self.chunked {
                    extend(&mut self.pending, format!("{:x}\r\n", bytes.len()).as_bytes());
                    extend(&mut self.pending, &bytes);
                    extend(&mut self.pending, b"\r\n");
                } else {
                    extend(&mut self.pending, &bytes);
                }
            }
            if eos {
                if self.chunked {
                    extend(&mut self.pending, b"0\r\n\r\n");
                }
                self.phase = ReadPhase::Eof;
            }
        }
    }
}

// ===== response side =====

/// Response-capture states, in the order the bytes come.
enum WritePhase {
    /// Accumulating the status line and headers.
    Head(Vec<u8>),
    /// Forwarding a length-delimited or close-delimited body.
    Body,
    /// De-chunking a chunked body before it enters the multiplexer.
    Chunked(ChunkDecoder),
    /// Response complete; trailing bytes are dropped.
    Done,
}

/// Captures the host's response: head first, then body into the mplx.
struct ResponseSink<'a> {
    task: &'a Task,
    phase: WritePhase,
    head_sent: bool,
}

impl<'a> ResponseSink<'a> {
    fn new(task: &'a Task) -> ResponseSink<'a> {
        ResponseSink {
            task,
            phase: WritePhase::Head(Vec::with_capacity(512)),
            head_sent: false,
        }
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }

    fn write(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.phase {
                WritePhase::Head(ref mut pending) => {
                    pending.extend_from_slice(buf);
                    let head_len = match find_head_end(pending) {
                        Some(len) => len,
                        None => return Ok(()),
                    };
                    let rest = pending.split_off(head_len);
                    let head = std::mem::take(pending);
                    let (response, chunked) = parse_response_head(&head)?;
                    self.task
                        .mplx
                        .set_response(self.task.stream_id, response)
                        .map_err(io::Error::from)?;
                    self.head_sent = true;
                    self.phase = if chunked {
                        WritePhase::Chunked(ChunkDecoder::new())
                    } else {
                        WritePhase::Body
                    };
                    if !rest.is_empty() {
                        self.write(&rest)?;
                    }
                    return Ok(());
                }
                WritePhase::Body => {
                    self.task
                        .mplx
                        .write_output(self.task.stream_id, Bytes::copy_from_slice(buf))
                        .map_err(io::Error::from)?;
                    buf = &[];
                }
                WritePhase::Chunked(ref mut decoder) => {
                    let (data, trailers, consumed) = decoder.feed(buf)?;
                    if !data.is_empty() {
                        self.task
                            .mplx
                            .write_output(self.task.stream_id, data.into())
                            .map_err(io::Error::from)?;
                    }
                    if let Some(trailers) = trailers {
                        if !trailers.is_empty() {
                            let _ = self.task.mplx.set_trailers(self.task.stream_id, trailers);
                        }
                        self.phase = WritePhase::Done;
                    }
                    buf = &buf[consumed..];
                }
                WritePhase::Done => {
                    trace!("task({}) dropping {} post-response bytes", self.task.stream_id, buf.len());
                    buf = &[];
                }
            }
        }
        Ok(())
    }
}

/// Locates the CRLFCRLF (or LFLF) ending the response head, returning
/// the length including the terminator.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
}

/// Parses the captured status line + headers, strips connection-scoped
/// headers, stamps `date`, and reports whether the body is chunked.
fn parse_response_head(head: &[u8]) -> io::Result<(ResponseHead, bool)> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut parsed_headers);
    let status = match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => parsed.code.unwrap_or(500),
        other => {
            warn!("unparseable host response head: {:?}", other);
            return Err(Error::new_user(User::ResponseHead).into());
        }
    };
    let status = StatusCode::from_u16(status)
        .map_err(|_| io::Error::from(Error::new_user(User::ResponseHead)))?;

    let mut headers = HeaderMap::new();
    let mut chunked = false;
    for header in parsed.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        match name.as_str() {
            "transfer-encoding" => {
                chunked = header
                    .value
                    .eq_ignore_ascii_case(b"chunked")
                    || chunked;
            }
            "connection" | "keep-alive" | "proxy-connection" | "upgrade" => {
                trace!("stripping connection header {:?} from response", name);
            }
            _ => {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_bytes(header.value),
                ) {
                    headers.append(name, value);
                }
            }
        }
    }
    if !headers.contains_key(http::header::DATE) {
        let date = httpdate::fmt_http_date(SystemTime::now());
        if let Ok(value) = HeaderValue::from_str(&date) {
            headers.insert(http::header::DATE, value);
        }
    }
    Ok((ResponseHead { status, headers }, chunked))
}

// ===== chunked body decoding =====

#[derive(Debug)]
enum ChunkState {
    Size,
    SizeLf,
    Data(usize),
    DataCr,
    DataLf,
    Trailer,
}

/// Incremental decoder for a chunked response body; the re-framing onto
/// DATA frames happens downstream, so only the payload survives.
struct ChunkDecoder {
    state: ChunkState,
    size_line: Vec<u8>,
    trailer_buf: Vec<u8>,
}

impl ChunkDecoder {
    fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Size,
            size_line: Vec::new(),
            trailer_buf: Vec::new(),
        }
    }

    /// Feeds bytes in; returns decoded payload, trailers once the last
    /// chunk terminator was seen, and how many input bytes were used.
    #[allow(clippy::type_complexity)]
    fn feed(
        &mut self,
        buf: &[u8],
    ) -> io::Result<(Vec<u8>, Option<Vec<(Bytes, Bytes)>>, usize)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            match self.state {
                ChunkState::Size => {
                    let byte = buf[i];
                    i += 1;
                    if byte == b'\r' {
                        self.state = ChunkState::SizeLf;
                    } else {
                        self.size_line.push(byte);
                    }
                }
                ChunkState::SizeLf => {
                    if buf[i] != b'\n' {
                        return Err(invalid_chunk("missing LF after chunk size"));
                    }
                    i += 1;
                    let size = parse_chunk_size(&self.size_line)?;
                    self.size_line.clear();
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(ref mut remaining) => {
                    let n = (*remaining).min(buf.len() - i);
                    out.extend_from_slice(&buf[i..i + n]);
                    i += n;
                    *remaining -= n;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if buf[i] != b'\r' {
                        return Err(invalid_chunk("missing CR after chunk data"));
                    }
                    i += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if buf[i] != b'\n' {
                        return Err(invalid_chunk("missing LF after chunk data"));
                    }
                    i += 1;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    self.trailer_buf.push(buf[i]);
                    i += 1;
                    if ends_trailer(&self.trailer_buf) {
                        let trailers = parse_trailers(&self.trailer_buf);
                        return Ok((out, Some(trailers), i));
                    }
                }
            }
        }
        Ok((out, None, i))
    }
}

fn invalid_chunk(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    // chunk extensions after ';' are ignored
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(&[]);
    let text = std::str::from_utf8(digits)
        .map_err(|_| invalid_chunk("chunk size not ascii"))?;
    usize::from_str_radix(text.trim(), 16)
        .map_err(|_| invalid_chunk("chunk size not hex"))
}

/// The trailer section ends at an empty line. The final-chunk case of a
/// bare CRLF right away is the common one.
fn ends_trailer(buf: &[u8]) -> bool {
    buf == b"\r\n" || buf.ends_with(b"\r\n\r\n")
}

fn parse_trailers(buf: &[u8]) -> Vec<(Bytes, Bytes)> {
    let mut trailers = Vec::new();
    for line in buf.split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(line) => line,
            None => line,
        };
        if line.is_empty() {
            continue;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = line[..colon].to_ascii_lowercase();
            let value = line[colon + 1..]
                .iter()
                .copied()
                .skip_while(|&b| b == b' ' || b == b'\t')
                .collect::<Vec<u8>>();
            trailers.push((Bytes::from(name), Bytes::from(value)));
        }
    }
    trailers
}

fn extend(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::WorkerPool;
    use http::Method;
    use std::time::Duration;

    fn request(method: Method, eos: bool, chunked: bool) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
        RequestHead {
            method,
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/where".into(),
            headers,
            eos,
            chunked,
        }
    }

    struct NullHost;

    impl Host for NullHost {
        fn process_connection(&self, _conn: &mut dyn SubConn) -> io::Result<()> {
            Ok(())
        }
    }

    fn task_for(request: RequestHead) -> Task {
        let pool = WorkerPool::new(0, 1, Duration::from_secs(1));
        let mplx = Arc::new(Mplx::new(7, 64 * 1024, pool));
        mplx.open_io(StreamId::from(1)).unwrap();
        Task::new(mplx, StreamId::from(1), request, Arc::new(NullHost))
    }

    fn read_all(task: &Task) -> Vec<u8> {
        let mut source = RequestSource::new(&task.request);
        let mut out = Vec::new();
        let mut buf = [0u8; 97];
        loop {
            let n = source.read(task, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn serializes_bodyless_get() {
        let task = task_for(request(Method::GET, true, false));
        let bytes = read_all(&task);
        assert_eq!(
            bytes,
            b"GET /where HTTP/1.1\r\nhost: example.com\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn serializes_chunked_post_body() {
        let task = task_for(request(Method::POST, false, true));
        task.mplx
            .append_input(StreamId::from(1), Bytes::from_static(b"abcde"))
            .unwrap();
        task.mplx.close_input(StreamId::from(1)).unwrap();

        let bytes = read_all(&task);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /where HTTP/1.1\r\n"));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n5\r\nabcde\r\n0\r\n\r\n"));
    }

    #[test]
    fn serializes_plain_body_with_content_length() {
        let mut req = request(Method::POST, false, false);
        req.headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("4"),
        );
        let task = task_for(req);
        task.mplx
            .append_input(StreamId::from(1), Bytes::from_static(b"wxyz"))
            .unwrap();
        task.mplx.close_input(StreamId::from(1)).unwrap();

        let text = String::from_utf8(read_all(&task)).unwrap();
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nwxyz"));
    }

    #[test]
    fn captures_head_and_body() {
        let task = task_for(request(Method::GET, true, false));
        let mut sink = ResponseSink::new(&task);
        sink.write(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhel")
            .unwrap();
        sink.write(b"lo").unwrap();
        assert!(sink.head_sent());

        let (id, head) = task.mplx.pop_ready_response().unwrap();
        assert_eq!(id, StreamId::from(1));
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.get("content-length").unwrap(), "5");
        assert!(head.headers.get("connection").is_none());
        assert!(head.headers.get("date").is_some());

        let mut body = Vec::new();
        for _ in 0..2 {
            match task.mplx.read_output(StreamId::from(1), 64).unwrap() {
                crate::mplx::OutputRead::Data { bytes, .. } => {
                    body.extend_from_slice(&bytes)
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(body, b"hello");
    }

    #[test]
    fn dechunks_chunked_response() {
        let task = task_for(request(Method::GET, true, false));
        let mut sink = ResponseSink::new(&task);
        sink.write(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
            .unwrap();
        sink.write(b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();

        let (_, head) = task.mplx.pop_ready_response().unwrap();
        assert!(head.headers.get("transfer-encoding").is_none());
        match task.mplx.read_output(StreamId::from(1), 64).unwrap() {
            crate::mplx::OutputRead::Data { bytes, .. } => {
                assert_eq!(&bytes[..], b"wikipedia");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn chunked_trailers_are_captured() {
        let task = task_for(request(Method::GET, true, false));
        let mut sink = ResponseSink::new(&task);
        sink.write(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
            .unwrap();
        sink.write(b"2\r\nok\r\n0\r\nx-checksum: abc\r\n\r\n").unwrap();

        let trailers = task.mplx.take_trailers(StreamId::from(1)).unwrap();
        assert_eq!(&trailers[0].0[..], b"x-checksum");
        assert_eq!(&trailers[0].1[..], b"abc");
    }

    #[test]
    fn run_without_head_produces_500() {
        struct FailingHost;
        impl Host for FailingHost {
            fn process_connection(&self, _conn: &mut dyn SubConn) -> io::Result<()> {
                Err(io::ErrorKind::Other.into())
            }
        }

        let pool = WorkerPool::new(0, 1, Duration::from_secs(1));
        let mplx = Arc::new(Mplx::new(7, 64 * 1024, pool));
        mplx.open_io(StreamId::from(1)).unwrap();
        let task = Task::new(
            Arc::clone(&mplx),
            StreamId::from(1),
            request(Method::GET, true, false),
            Arc::new(FailingHost),
        );
        task.run();

        let (_, head) = mplx.pop_ready_response().unwrap();
        assert_eq!(head.status, StatusCode::INTERNAL_SERVER_ERROR);
        match mplx.read_output(StreamId::from(1), 16).unwrap() {
            crate::mplx::OutputRead::Data { bytes, eos } => {
                assert!(bytes.is_empty());
                assert!(eos);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
