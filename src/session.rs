//! The HTTP/2 session: one conversation over one transport connection.
//!
//! The session thread is the only thread touching the codec and the
//! ConnIO; everything crossing to worker threads goes through the
//! multiplexer. The loop alternates between reading frames, moving
//! stream output into DATA frames, and parking when neither side has
//! work, following the state machine below:
//!
//! INIT -> BUSY on startup, BUSY <-> IDLE/WAIT while quiet, any state ->
//! LOCAL/REMOTE_SHUTDOWN on GOAWAY, everything -> DONE on errors,
//! timeouts or drained shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::HeaderMap;
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::codec::{DecodedHeaders, Event, FrameCodec};
use crate::config::Config;
use crate::conn_io::{ConnIo, ReadMode, Transport};
use crate::error::{Error, Result};
use crate::frame::{Data, Priority, Reason, Settings, StreamId, DEFAULT_WEIGHT};
use crate::mplx::{Mplx, OutputRead, PriorityKey};
use crate::stream::{RequestHead, ResponseHead, Stream, StreamState};
use crate::task::{Host, Task};
use crate::workers::WorkerPool;

/// Ceiling for the WAIT-state backoff between output checks.
const MAX_WAIT_BACKOFF: Duration = Duration::from_millis(200);

/// First backoff step when the session goes quiet.
const INITIAL_WAIT_BACKOFF: Duration = Duration::from_micros(10);

/// Session states; shutdown intent is tracked separately since both
/// directions can be shut down at once.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Init,
    Busy,
    Idle,
    Wait,
    Done,
}

/// Everything that can move the session state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionEvent {
    Init,
    DataRead,
    NoIo,
    StreamReady,
    LocalGoaway,
    RemoteGoaway,
    ConnError,
    ConnTimeout,
    ProtoError(Reason),
    MpmStopping,
}

/// An `Upgrade: h2c` request captured by the host's HTTP/1.1 layer,
/// handed over to seed stream 1.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// The original request, already normalized for bridging.
    pub request: RequestHead,
    /// Any request body that was read before switching protocols.
    pub body: Bytes,
    /// The raw value of the `HTTP2-Settings` request header.
    pub http2_settings: String,
}

pub(crate) struct Session<T> {
    id: u64,
    config: Config,
    io: ConnIo<T>,
    codec: FrameCodec,
    mplx: Arc<Mplx>,
    host: Arc<dyn Host>,
    stopping: Arc<AtomicBool>,

    state: State,
    local_shutdown: bool,
    remote_shutdown: bool,
    accepting: bool,
    streams: IndexMap<u32, Stream>,

    // timers
    wait_backoff: Duration,
    wait_started: Option<Instant>,

    // counters
    frames_received: u64,
    frames_sent: u64,
    max_stream_id_received: StreamId,
    max_stream_id_handled: StreamId,
    streams_reset: u64,
    pushes_promised: u64,
    pushes_submitted: u64,
    pushes_reset: u64,
    next_push_id: StreamId,
    reprioritize: bool,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        id: u64,
        io: T,
        config: Config,
        host: Arc<dyn Host>,
        workers: Arc<WorkerPool>,
        stopping: Arc<AtomicBool>,
    ) -> Session<T> {
        let codec = FrameCodec::new(config.max_header_list_size);
        let mplx = Arc::new(Mplx::new(id, config.stream_max_mem, workers));
        Session {
            id,
            io: ConnIo::new(io, config.flush_threshold),
            codec,
            mplx,
            host,
            stopping,
            state: State::Init,
            local_shutdown: false,
            remote_shutdown: false,
            accepting: true,
            streams: IndexMap::new(),
            wait_backoff: INITIAL_WAIT_BACKOFF,
            wait_started: None,
            frames_received: 0,
            frames_sent: 0,
            max_stream_id_received: StreamId::ZERO,
            max_stream_id_handled: StreamId::ZERO,
            streams_reset: 0,
            pushes_promised: 0,
            pushes_submitted: 0,
            pushes_reset: 0,
            next_push_id: StreamId::from(2),
            reprioritize: false,
            config,
        }
    }

    /// Seeds stream 1 from an `Upgrade: h2c` request before the loop
    /// starts. The client still sends the connection preface.
    pub(crate) fn apply_upgrade(&mut self, upgrade: UpgradeRequest) -> Result<()> {
        let payload = URL_SAFE_NO_PAD
            .decode(upgrade.http2_settings.trim_end_matches('='))
            .map_err(|_| Error::new_protocol(Reason::PROTOCOL_ERROR))?;
        self.codec.apply_upgrade_settings(&payload)?;

        let id = StreamId::from(1);
        let mut stream = self.new_stream(id);
        stream.open();
        stream.request = Some(upgrade.request.clone());
        self.max_stream_id_received = id;
        self.streams.insert(id.into(), stream);
        self.mplx.open_io(id)?;
        if !upgrade.body.is_empty() {
            self.mplx.append_input(id, upgrade.body)?;
        }
        self.mplx.close_input(id)?;
        if let Some(stream) = self.streams.get_mut(&1u32) {
            stream.recv_close();
        }
        self.schedule_stream(id, upgrade.request)?;
        debug!("session({}): upgraded h2c request on stream 1", self.id);
        Ok(())
    }

    /// Drives the session until DONE; the caller's thread is the session
    /// thread for the whole lifetime.
    pub(crate) fn run(&mut self) -> Result<()> {
        let result = self.run_loop();
        if let Err(ref err) = result {
            debug!("session({}): ended with error: {}", self.id, err);
        }
        self.teardown();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.stopping.load(Ordering::SeqCst) && !self.local_shutdown {
                self.dispatch(SessionEvent::MpmStopping)?;
            }
            match self.state {
                State::Init => {
                    self.start()?;
                    self.dispatch(SessionEvent::Init)?;
                }
                State::Idle => {
                    // all quiet: flush, then park on the transport
                    self.io.flush().or_else(ignore_again)?;
                    match self.io.fill(ReadMode::Block(self.config.keepalive)) {
                        Ok(_) => {
                            self.dispatch(SessionEvent::DataRead)?;
                            self.consume_frames()?;
                        }
                        Err(ref err) if err.is_timeup() => {
                            debug!("session({}): keepalive expired", self.id);
                            self.graceful_goaway(Reason::NO_ERROR)?;
                            self.state = State::Done;
                        }
                        Err(err) => {
                            self.conn_error(err)?;
                        }
                    }
                }
                State::Busy => {
                    let mut progress = false;

                    match self.io.fill(ReadMode::NonBlock) {
                        Ok(_) => {
                            progress = true;
                            self.consume_frames()?;
                        }
                        Err(ref err) if err.is_again() => {}
                        Err(err) => {
                            self.conn_error(err)?;
                            continue;
                        }
                    }
                    if self.state == State::Done {
                        continue;
                    }

                    progress |= self.send_pass()?;

                    if self.io.is_buffered() {
                        self.io.consider_flush().or_else(ignore_again)?;
                    }

                    if progress {
                        self.wait_backoff = INITIAL_WAIT_BACKOFF;
                        self.wait_started = None;
                    } else {
                        self.dispatch(SessionEvent::NoIo)?;
                    }
                }
                State::Wait => {
                    // everything is parked on task output; wait for the
                    // mplx to signal, backing off exponentially
                    self.io.flush().or_else(ignore_again)?;
                    match self.mplx.trywait_output(self.wait_backoff) {
                        Ok(()) => {
                            self.wait_backoff = INITIAL_WAIT_BACKOFF;
                            self.wait_started = None;
                            self.dispatch(SessionEvent::StreamReady)?;
                        }
                        Err(ref err) if err.is_timeup() => {
                            let started =
                                *self.wait_started.get_or_insert_with(Instant::now);
                            if started.elapsed() >= self.config.timeout {
                                self.dispatch(SessionEvent::ConnTimeout)?;
                            } else {
                                self.wait_backoff =
                                    (self.wait_backoff * 2).min(MAX_WAIT_BACKOFF);
                                // the mplx may have signalled between our
                                // send pass and the wait; check directly
                                self.dispatch(SessionEvent::StreamReady)?;
                            }
                        }
                        Err(_) => {
                            self.dispatch(SessionEvent::ConnError)?;
                        }
                    }
                }
                State::Done => {
                    return Ok(());
                }
            }
        }
    }

    /// Submits the server preface: SETTINGS, then a connection-level
    /// WINDOW_UPDATE that effectively disables connection flow control
    /// (per-stream windows do the real work).
    fn start(&mut self) -> Result<()> {
        let settings = Settings {
            ack: false,
            max_concurrent_streams: Some(self.config.max_streams),
            initial_window_size: Some(self.config.initial_window_size),
            max_header_list_size: Some(self.config.max_header_list_size as u32),
            ..Settings::default()
        };
        self.codec.encode_settings(&settings, self.io.write_buf());
        self.frames_sent += 1;

        let increment = self.codec.disable_conn_flow_control();
        if increment > 0 {
            self.codec
                .encode_window_update(StreamId::ZERO, increment, self.io.write_buf());
            self.frames_sent += 1;
        }
        self.io.flush().or_else(ignore_again)?;
        debug!("session({}): started", self.id);
        Ok(())
    }

    // ===== state machine =====

    fn dispatch(&mut self, event: SessionEvent) -> Result<()> {
        let prev = self.state;
        match event {
            SessionEvent::Init => {
                self.state = State::Busy;
            }
            SessionEvent::DataRead => {
                self.wait_backoff = INITIAL_WAIT_BACKOFF;
                self.wait_started = None;
                self.state = State::Busy;
            }
            SessionEvent::StreamReady => {
                self.state = State::Busy;
            }
            SessionEvent::NoIo => {
                if self.shutdown_drained() {
                    self.state = State::Done;
                } else if self.streams.is_empty() && self.accepting {
                    self.state = State::Idle;
                } else if !self.streams.is_empty() {
                    self.state = State::Wait;
                } else {
                    // shutdown in progress, no streams left: flush out
                    self.state = State::Done;
                }
            }
            SessionEvent::LocalGoaway => {
                self.local_shutdown = true;
                self.accepting = false;
                self.state = if self.remote_shutdown || self.streams.is_empty() {
                    State::Done
                } else {
                    State::Busy
                };
            }
            SessionEvent::RemoteGoaway => {
                self.remote_shutdown = true;
                self.accepting = false;
                self.state = if self.local_shutdown {
                    State::Done
                } else {
                    State::Busy
                };
            }
            SessionEvent::MpmStopping => {
                debug!("session({}): server stopping, going away", self.id);
                self.graceful_goaway(Reason::NO_ERROR)?;
            }
            SessionEvent::ConnError => {
                // peer is gone; no GOAWAY will reach it
                self.state = State::Done;
            }
            SessionEvent::ConnTimeout => {
                warn!("session({}): timeout waiting for stream output", self.id);
                self.error_goaway(Reason::NO_ERROR)?;
                self.state = State::Done;
            }
            SessionEvent::ProtoError(reason) => {
                self.error_goaway(reason)?;
                self.state = State::Done;
            }
        }
        if prev != self.state {
            trace!(
                "session({}): {:?} -> {:?} on {:?}",
                self.id,
                prev,
                self.state,
                event
            );
        }
        Ok(())
    }

    fn shutdown_drained(&self) -> bool {
        (self.local_shutdown && self.remote_shutdown)
            || ((self.local_shutdown || self.remote_shutdown)
                && self.streams.is_empty()
                && !self.io.is_buffered())
    }

    fn conn_error(&mut self, err: Error) -> Result<()> {
        if err.is_eof() || err.is_conn_aborted() {
            debug!("session({}): connection gone", self.id);
            self.dispatch(SessionEvent::ConnError)
        } else if err.is_timeup() {
            self.dispatch(SessionEvent::ConnTimeout)
        } else if let Some(reason) = err.reason() {
            self.dispatch(SessionEvent::ProtoError(reason))
        } else {
            self.dispatch(SessionEvent::ConnError)
        }
    }

    /// GOAWAY with the highest stream id the client opened, leaving
    /// in-flight streams to finish.
    fn graceful_goaway(&mut self, reason: Reason) -> Result<()> {
        self.codec.encode_goaway(
            self.max_stream_id_received,
            reason,
            self.io.write_buf(),
        );
        self.frames_sent += 1;
        self.dispatch(SessionEvent::LocalGoaway)
    }

    /// GOAWAY after an error, advertising only what was handled.
    fn error_goaway(&mut self, reason: Reason) -> Result<()> {
        self.codec
            .encode_goaway(self.max_stream_id_handled, reason, self.io.write_buf());
        self.frames_sent += 1;
        self.local_shutdown = true;
        self.accepting = false;
        let _ = self.io.flush();
        Ok(())
    }

    // ===== receive path =====

    /// Decodes every complete frame currently buffered; one read pass.
    fn consume_frames(&mut self) -> Result<()> {
        loop {
            match self.codec.poll_event(self.io.read_buf()) {
                Ok(Some(event)) => {
                    self.frames_received += 1;
                    self.on_event(event)?;
                    if self.state == State::Done {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    return self.conn_error(err);
                }
            }
        }
    }

    fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Headers(headers) => self.on_headers(headers),
            Event::Data(data) => self.on_data(data),
            Event::Priority(priority) => {
                self.on_priority(priority);
                Ok(())
            }
            Event::Reset(rst) => {
                debug!(
                    "session({}): client reset stream {} ({:?})",
                    self.id, rst.stream_id, rst.reason
                );
                self.close_stream(rst.stream_id, Some(rst.reason));
                Ok(())
            }
            Event::Settings(settings) => {
                let delta = self.codec.apply_remote_settings(&settings);
                if delta != 0 {
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                self.codec.encode_settings_ack(self.io.write_buf());
                self.frames_sent += 1;
                Ok(())
            }
            Event::Ping(ping) => {
                if !ping.ack {
                    self.codec.encode_ping_ack(ping.payload, self.io.write_buf());
                    self.frames_sent += 1;
                }
                Ok(())
            }
            Event::GoAway(goaway) => {
                debug!(
                    "session({}): remote GOAWAY last={} {:?}",
                    self.id, goaway.last_stream_id, goaway.reason
                );
                self.dispatch(SessionEvent::RemoteGoaway)
            }
            Event::WindowUpdate(update) => {
                if let Some(stream) = self.streams.get_mut(&u32::from(update.stream_id)) {
                    stream.send_window += update.increment as i64;
                    if stream.send_window > crate::codec::MAX_WINDOW {
                        self.reset_stream(update.stream_id, Reason::FLOW_CONTROL_ERROR);
                    }
                }
                Ok(())
            }
        }
    }

    fn on_headers(&mut self, headers: DecodedHeaders) -> Result<()> {
        let id = headers.stream_id;
        let key: u32 = id.into();

        if self.streams.contains_key(&key) {
            return self.on_trailers(headers);
        }

        if !id.is_client_initiated() || id <= self.max_stream_id_received {
            debug!("session({}): bad new stream id {}", self.id, id);
            return self.conn_error(Error::new_bad_frame(Reason::PROTOCOL_ERROR));
        }
        self.max_stream_id_received = id;
        if !self.accepting {
            trace!("session({}): refusing stream {} after GOAWAY", self.id, id);
            self.reset_stream(id, Reason::REFUSED_STREAM);
            return Ok(());
        }
        if self.streams.len() as u32 >= self.config.max_streams {
            self.reset_stream(id, Reason::REFUSED_STREAM);
            return Ok(());
        }

        let mut stream = self.new_stream(id);
        stream.open();
        if let Some(dependency) = headers.priority {
            stream.parent = dependency.dependency_id;
            stream.weight = dependency.weight;
            self.reprioritize = true;
        }
        for (name, value) in headers.fields {
            stream.recv_header(name, value);
        }
        let request = match stream.end_headers(headers.eos) {
            Ok(request) => request.clone(),
            Err(reason) => {
                debug!("session({}): malformed request on stream {}", self.id, id);
                self.streams_reset += 1;
                self.codec
                    .encode_rst_stream(id, reason, self.io.write_buf());
                self.frames_sent += 1;
                return Ok(());
            }
        };
        if headers.eos {
            stream.recv_close();
        }
        self.streams.insert(key, stream);

        self.mplx.open_io(id)?;
        if headers.eos {
            self.mplx.close_input(id)?;
        }
        self.schedule_stream(id, request)
    }

    fn on_trailers(&mut self, headers: DecodedHeaders) -> Result<()> {
        let id = headers.stream_id;
        let stream = match self.streams.get_mut(&u32::from(id)) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        if !headers.eos {
            // trailers must end the stream
            self.reset_stream(id, Reason::PROTOCOL_ERROR);
            return Ok(());
        }
        trace!("session({}): trailers on stream {}", self.id, id);
        stream.recv_trailers(headers.fields);
        stream.recv_close();
        self.mplx.close_input(id)?;
        Ok(())
    }

    fn on_data(&mut self, data: Data) -> Result<()> {
        let id = data.stream_id;
        let flow = data.flow_len();
        let stream = match self.streams.get_mut(&u32::from(id)) {
            Some(stream) => stream,
            None => {
                self.reset_stream(id, Reason::INTERNAL_ERROR);
                return Ok(());
            }
        };
        if stream.state == StreamState::HalfClosedRemote || stream.is_closed() {
            self.reset_stream(id, Reason::STREAM_CLOSED);
            return Ok(());
        }
        stream.recv_window -= flow as i64;
        if stream.recv_window < 0 {
            self.reset_stream(id, Reason::FLOW_CONTROL_ERROR);
            return Ok(());
        }
        stream.data_received += data.payload.len() as u64;

        // padding never reaches the tasks: consume it right away
        let padding = flow - data.payload.len();
        if padding > 0 {
            stream.recv_window += padding as i64;
            let _ = self.codec.consume_conn_recv(padding as u32);
            self.codec
                .encode_window_update(id, padding as u32, self.io.write_buf());
            self.codec.encode_window_update(
                StreamId::ZERO,
                padding as u32,
                self.io.write_buf(),
            );
            self.frames_sent += 2;
        }

        if !data.payload.is_empty() {
            self.mplx.append_input(id, data.payload)?;
        }
        if data.eos {
            if let Some(stream) = self.streams.get_mut(&u32::from(id)) {
                stream.recv_close();
            }
            self.mplx.close_input(id)?;
        }
        Ok(())
    }

    fn on_priority(&mut self, priority: Priority) {
        if let Some(stream) = self.streams.get_mut(&u32::from(priority.stream_id)) {
            stream.parent = priority.dependency.dependency_id;
            stream.weight = priority.dependency.weight;
            self.reprioritize = true;
        }
    }

    // ===== send path =====

    /// One submit/resume/data pass; returns whether anything was
    /// produced.
    fn send_pass(&mut self) -> Result<bool> {
        let mut progress = false;

        if self.reprioritize {
            self.reprioritize = false;
            let keys: Vec<(StreamId, PriorityKey)> = self
                .streams
                .keys()
                .map(|&k| {
                    let id = StreamId::from(k);
                    (id, self.priority_key(id))
                })
                .collect();
            self.mplx.reprioritize(move |id| {
                keys.iter()
                    .find(|(k, _)| *k == id)
                    .map(|(_, key)| *key)
                    .unwrap_or(PriorityKey {
                        depth: 0,
                        weight: DEFAULT_WEIGHT,
                    })
            });
        }

        // pending WINDOW_UPDATEs for consumed request bodies
        let mut updates: Vec<(StreamId, usize)> = Vec::new();
        self.mplx.update_input_windows(|id, n| {
            updates.push((id, n));
        })?;
        for (id, n) in updates {
            if let Some(stream) = self.streams.get_mut(&u32::from(id)) {
                stream.recv_window += n as i64;
            }
            self.codec
                .encode_window_update(id, n as u32, self.io.write_buf());
            let conn_inc = self.codec.consume_conn_recv(n as u32);
            self.codec
                .encode_window_update(StreamId::ZERO, conn_inc, self.io.write_buf());
            self.frames_sent += 2;
            progress = true;
        }

        // responses whose head became ready
        while let Some((id, head)) = self.mplx.pop_ready_response() {
            self.submit_response(id, head)?;
            progress = true;
        }

        // resume streams that got fresh output while suspended
        let resumable: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.suspended && s.submitted)
            .map(|(&k, _)| k)
            .collect();
        for key in resumable {
            if self.mplx.output_ready(StreamId::from(key)) {
                if let Some(stream) = self.streams.get_mut(&key) {
                    trace!("session({}): resuming stream {}", self.id, key);
                    stream.suspended = false;
                }
            }
        }

        // emit DATA for every submittable stream
        let sendable: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.submitted && !s.suspended && !s.is_closed())
            .map(|(&k, _)| k)
            .collect();
        for key in sendable {
            progress |= self.pump_stream(StreamId::from(key))?;
        }

        self.mplx.purge();
        Ok(progress)
    }

    fn submit_response(&mut self, id: StreamId, head: ResponseHead) -> Result<()> {
        let stream = match self.streams.get_mut(&u32::from(id)) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        debug!(
            "session({}): submitting response {} on stream {}",
            self.id, head.status, id
        );
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> =
            Vec::with_capacity(head.headers.len() + 1);
        fields.push((b":status".to_vec(), head.status.as_str().as_bytes().to_vec()));
        for (name, value) in head.headers.iter() {
            fields.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        self.codec.encode_headers(
            id,
            fields.iter().map(|(n, v)| (&n[..], &v[..])),
            false,
            self.io.write_buf(),
        );
        self.frames_sent += 1;
        stream.submitted = true;
        if id > self.max_stream_id_handled {
            self.max_stream_id_handled = id;
        }
        self.maybe_push(id, &head.headers)?;
        Ok(())
    }

    /// Pulls output for one stream and frames it as DATA until the
    /// stream suspends, flow control blocks, or EOS.
    fn pump_stream(&mut self, id: StreamId) -> Result<bool> {
        let mut progress = false;
        loop {
            let window = match self.streams.get(&u32::from(id)) {
                Some(stream) => stream.send_window,
                None => return Ok(progress),
            };
            let want = self.codec.max_data_len(window, 16 * 1024);
            if want == 0 {
                // flow-control blocked; WINDOW_UPDATE will unblock us
                trace!(
                    "session({}): stream {} flow blocked (stream={}, conn={})",
                    self.id,
                    id,
                    window,
                    self.codec.conn_send_window()
                );
                return Ok(progress);
            }
            match self.mplx.read_output(id, want)? {
                OutputRead::Data { bytes, eos } => {
                    if bytes.is_empty() && !eos {
                        return Ok(progress);
                    }
                    let trailers = if eos { self.mplx.take_trailers(id) } else { None };
                    if !bytes.is_empty() {
                        let end_stream = eos && trailers.is_none();
                        self.codec
                            .encode_data(id, &bytes, end_stream, self.io.write_buf());
                        self.frames_sent += 1;
                        if let Some(stream) = self.streams.get_mut(&u32::from(id)) {
                            stream.send_window -= bytes.len() as i64;
                            stream.data_sent += bytes.len() as u64;
                        }
                    } else if eos && trailers.is_none() {
                        self.codec.encode_data(id, &[], true, self.io.write_buf());
                        self.frames_sent += 1;
                    }
                    progress = true;
                    if eos {
                        if let Some(trailers) = trailers {
                            self.codec.encode_headers(
                                id,
                                trailers.iter().map(|(n, v)| (&n[..], &v[..])),
                                true,
                                self.io.write_buf(),
                            );
                            self.frames_sent += 1;
                        }
                        trace!("session({}): stream {} finished", self.id, id);
                        if let Some(stream) = self.streams.get_mut(&u32::from(id)) {
                            stream.send_close();
                        }
                        self.close_stream(id, None);
                        return Ok(progress);
                    }
                }
                OutputRead::Suspend => {
                    if let Some(stream) = self.streams.get_mut(&u32::from(id)) {
                        trace!("session({}): suspending stream {}", self.id, id);
                        stream.suspended = true;
                    }
                    return Ok(progress);
                }
                OutputRead::Reset(reason) => {
                    self.reset_stream(id, reason);
                    return Ok(true);
                }
            }
        }
    }

    /// Announces and schedules a server push for `Link: rel=preload`
    /// response headers, when the client permits pushes.
    fn maybe_push(&mut self, initiator: StreamId, headers: &HeaderMap) -> Result<()> {
        if !self.codec.remote().enable_push || !self.accepting {
            return Ok(());
        }
        let (authority, scheme) = match self.streams.get(&u32::from(initiator)) {
            Some(stream) => match stream.request.as_ref() {
                Some(req) => (req.authority.clone(), req.scheme.clone()),
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        let links: Vec<String> = headers
            .get_all(http::header::LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter(|value| value.contains("rel=preload") && !value.contains("nopush"))
            .filter_map(|value| {
                let start = value.find('<')?;
                let end = value.find('>')?;
                let path = &value[start + 1..end];
                if path.starts_with('/') {
                    Some(path.to_string())
                } else {
                    None
                }
            })
            .collect();

        for path in links {
            let promised = self.next_push_id;
            self.next_push_id = match promised.next_id() {
                Ok(next) => next,
                Err(_) => return Ok(()),
            };
            let mut headers = HeaderMap::new();
            if let Ok(host) = http::header::HeaderValue::from_str(&authority) {
                headers.insert(http::header::HOST, host);
            }
            let request = RequestHead {
                method: http::Method::GET,
                scheme: scheme.clone(),
                authority: authority.clone(),
                path: path.clone(),
                headers,
                eos: true,
                chunked: false,
            };
            debug!(
                "session({}): pushing {} on stream {} for {}",
                self.id, path, promised, initiator
            );
            let fields: Vec<(Vec<u8>, Vec<u8>)> = vec![
                (b":method".to_vec(), b"GET".to_vec()),
                (b":scheme".to_vec(), scheme.as_bytes().to_vec()),
                (b":authority".to_vec(), authority.as_bytes().to_vec()),
                (b":path".to_vec(), path.as_bytes().to_vec()),
            ];
            self.codec.encode_push_promise(
                initiator,
                promised,
                fields.iter().map(|(n, v)| (&n[..], &v[..])),
                self.io.write_buf(),
            );
            self.frames_sent += 1;
            self.pushes_promised += 1;

            let mut stream = self.new_stream(promised);
            stream.open();
            stream.parent = initiator;
            stream.request = Some(request.clone());
            // pushed requests have no body
            stream.recv_close();
            self.streams.insert(promised.into(), stream);
            self.mplx.open_io(promised)?;
            self.mplx.close_input(promised)?;
            self.schedule_stream(promised, request)?;
            self.pushes_submitted += 1;
        }
        Ok(())
    }

    // ===== stream plumbing =====

    fn new_stream(&self, id: StreamId) -> Stream {
        Stream::new(
            id,
            self.codec.initial_send_window(),
            self.config.initial_window_size as i64,
        )
    }

    fn schedule_stream(&mut self, id: StreamId, request: RequestHead) -> Result<()> {
        let task = Task::new(Arc::clone(&self.mplx), id, request, Arc::clone(&self.host));
        let key = self.priority_key(id);
        Mplx::schedule(&self.mplx, task, key)?;
        if id > self.max_stream_id_handled {
            self.max_stream_id_handled = id;
        }
        Ok(())
    }

    /// Priority rank: distance from the tree root first, then weight.
    fn priority_key(&self, id: StreamId) -> PriorityKey {
        let mut depth = 0u32;
        let mut at: u32 = id.into();
        while let Some(stream) = self.streams.get(&at) {
            let parent: u32 = stream.parent.into();
            if parent == 0 || parent == at || depth > 32 {
                break;
            }
            depth += 1;
            at = parent;
        }
        let weight = self
            .streams
            .get(&u32::from(id))
            .map(|s| s.weight)
            .unwrap_or(DEFAULT_WEIGHT);
        PriorityKey { depth, weight }
    }

    /// Sends RST_STREAM and forgets the stream.
    fn reset_stream(&mut self, id: StreamId, reason: Reason) {
        self.codec
            .encode_rst_stream(id, reason, self.io.write_buf());
        self.frames_sent += 1;
        self.streams_reset += 1;
        if id.is_server_initiated() {
            self.pushes_reset += 1;
        }
        self.close_stream(id, Some(reason));
    }

    /// Removes a stream from the session and hands its I/O to the mplx
    /// for (possibly deferred) destruction.
    fn close_stream(&mut self, id: StreamId, reason: Option<Reason>) {
        if let Some(mut stream) = self.streams.shift_remove(&u32::from(id)) {
            if let Some(reason) = reason {
                stream.reset(reason);
            }
            trace!(
                "session({}): stream {} closed; in={} out={} trailers={}",
                self.id,
                id,
                stream.data_received,
                stream.data_sent,
                stream.trailers.is_some()
            );
            self.mplx.stream_done(id, reason);
        }
    }

    fn teardown(&mut self) {
        debug!(
            "session({}): closing; frames={}/{} bytes={}/{} resets={} pushes={}/{}/{}",
            self.id,
            self.frames_received,
            self.frames_sent,
            self.io.bytes_read(),
            self.io.bytes_written(),
            self.streams_reset,
            self.pushes_promised,
            self.pushes_submitted,
            self.pushes_reset,
        );
        self.mplx.abort();
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for key in ids {
            self.close_stream(StreamId::from(key), Some(Reason::CANCEL));
        }
        Mplx::release_and_join(&self.mplx);
        self.mplx.purge();
        self.io.write_eoc();
        if self.io.flush().is_err() {
            trace!("session({}): transport gone during close", self.id);
        }
    }
}

fn ignore_again(err: Error) -> Result<()> {
    if err.is_again() {
        Ok(())
    } else {
        Err(err)
    }
}
