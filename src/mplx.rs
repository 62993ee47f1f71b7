//! The stream multiplexer.
//!
//! It pushes bytes from the session thread to the task threads and vice
//! versa, and is the only place both sides meet. There is one `Mplx` per
//! session. Input goes from the session to the tasks; output goes from
//! the tasks to the session, e.g. the client.
//!
//! For each stream, at most `stream_max_mem` output bytes may be queued
//! here. A task thread writing more is blocked until the session drains
//! the stream below the cap.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::frame::{Reason, StreamId};
use crate::stream::ResponseHead;
use crate::task::Task;
use crate::workers::WorkerPool;

/// Priority rank for pending tasks and ready responses: smaller sorts
/// first. Depth in the dependency tree dominates; at equal depth higher
/// weight goes first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PriorityKey {
    pub(crate) depth: u32,
    pub(crate) weight: u16,
}

impl PriorityKey {
    fn rank(&self) -> (u32, i32) {
        (self.depth, -(self.weight as i32))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Result of a session-side output read.
#[derive(Debug)]
pub(crate) enum OutputRead {
    /// Bytes to frame, and whether they end the stream.
    Data { bytes: Bytes, eos: bool },
    /// Nothing buffered right now; suspend the stream.
    Suspend,
    /// The stream was reset while the task was producing.
    Reset(Reason),
}

/// Per-stream I/O state guarded by the mplx lock.
#[derive(Debug)]
struct Io {
    input: VecDeque<Bytes>,
    input_eos: bool,
    input_consumed: usize,
    input_arrived: Arc<Condvar>,
    output: VecDeque<Bytes>,
    output_len: usize,
    output_eos: bool,
    output_drained: Arc<Condvar>,
    response: Option<ResponseHead>,
    trailers: Option<Vec<(Bytes, Bytes)>>,
    rst_error: Option<Reason>,
    task_running: bool,
    priority: PriorityKey,
}

impl Io {
    fn new() -> Io {
        Io {
            input: VecDeque::new(),
            input_eos: false,
            input_consumed: 0,
            input_arrived: Arc::new(Condvar::new()),
            output: VecDeque::new(),
            output_len: 0,
            output_eos: false,
            output_drained: Arc::new(Condvar::new()),
            response: None,
            trailers: None,
            rst_error: None,
            task_running: false,
            priority: PriorityKey {
                depth: 0,
                weight: crate::frame::DEFAULT_WEIGHT,
            },
        }
    }

    fn wake_all(&self) {
        self.input_arrived.notify_all();
        self.output_drained.notify_all();
    }
}

#[derive(Debug)]
struct Inner {
    streams: IndexMap<u32, Io>,
    /// Streams the session is done with whose task is still finishing.
    hold: IndexMap<u32, Io>,
    /// Fully done streams awaiting destruction on the session thread.
    purge: Vec<(u32, Io)>,
    /// Tasks not yet claimed by a worker, priority-ordered.
    pending: Vec<(PriorityKey, Task)>,
    /// Streams whose response head awaits submission.
    ready: Vec<u32>,
    aborted: bool,
    tasks_active: usize,
}

/// The thread-safe bridge between one session and the worker pool.
#[derive(Debug)]
pub(crate) struct Mplx {
    id: u64,
    stream_max_mem: usize,
    workers: Arc<WorkerPool>,
    inner: Mutex<Inner>,
    added_output: Condvar,
    join_wait: Condvar,
}

impl Mplx {
    pub(crate) fn new(id: u64, stream_max_mem: usize, workers: Arc<WorkerPool>) -> Mplx {
        Mplx {
            id,
            stream_max_mem,
            workers,
            inner: Mutex::new(Inner {
                streams: IndexMap::new(),
                hold: IndexMap::new(),
                purge: Vec::new(),
                pending: Vec::new(),
                ready: Vec::new(),
                aborted: false,
                tasks_active: 0,
            }),
            added_output: Condvar::new(),
            join_wait: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.aborted {
            return Err(Error::new_conn_aborted());
        }
        Ok(inner)
    }

    // ===== stream I/O lifecycle (session thread) =====

    /// Prepares the multiplexer to handle in-/output for a stream.
    pub(crate) fn open_io(&self, id: StreamId) -> Result<()> {
        let mut inner = self.checked()?;
        inner.streams.entry(id.into()).or_insert_with(Io::new);
        Ok(())
    }

    /// Notifies the mplx that the session is done with a stream.
    ///
    /// With a task still running the stream moves to the hold set, its
    /// condvars are woken so a parked task observes the reset, and
    /// destruction waits for the task's finish callback.
    pub(crate) fn stream_done(&self, id: StreamId, rst_error: Option<Reason>) {
        let mut inner = self.lock();
        let key: u32 = id.into();
        // drop any never-started task for this stream
        inner.pending.retain(|(_, task)| task.stream_id() != id);
        inner.ready.retain(|&s| s != key);
        if let Some(mut io) = inner.streams.shift_remove(&key) {
            io.rst_error = io.rst_error.or(rst_error);
            if io.task_running {
                trace!("mplx({}): holding stream {} until task finishes", self.id, id);
                io.wake_all();
                inner.hold.insert(key, io);
            } else {
                inner.purge.push((key, io));
            }
        }
    }

    /// Drops streams whose lifecycle fully ended; called from the
    /// session thread so buffer teardown happens off the workers.
    pub(crate) fn purge(&self) {
        let purge = {
            let mut inner = self.lock();
            std::mem::take(&mut inner.purge)
        };
        for (id, _) in &purge {
            trace!("mplx({}): purged stream {}", self.id, id);
        }
    }

    /// Aborts every operation, current and future. Sticky.
    pub(crate) fn abort(&self) {
        let mut inner = self.lock();
        if inner.aborted {
            return;
        }
        debug!("mplx({}): aborting", self.id);
        inner.aborted = true;
        for (_, io) in inner.streams.iter() {
            io.wake_all();
        }
        for (_, io) in inner.hold.iter() {
            io.wake_all();
        }
        for (_, task) in inner.pending.iter() {
            task.abort();
        }
        self.added_output.notify_all();
        self.join_wait.notify_all();
    }

    /// Waits until every task has finished, then unregisters from the
    /// worker pool. Called by the session during teardown.
    pub(crate) fn release_and_join(mplx: &Arc<Mplx>) {
        {
            let mut inner = mplx.lock();
            inner.pending.clear();
            while inner.tasks_active > 0 {
                trace!(
                    "mplx({}): join waiting on {} tasks",
                    mplx.id,
                    inner.tasks_active
                );
                inner = mplx.join_wait.wait(inner).unwrap_or_else(|e| e.into_inner());
            }
        }
        mplx.workers.unregister(mplx);
    }

    // ===== input operations =====

    /// Appends request body bytes for a stream; wakes a blocked reader.
    pub(crate) fn append_input(&self, id: StreamId, bytes: Bytes) -> Result<()> {
        let mut inner = self.checked()?;
        let io = inner
            .streams
            .get_mut(&u32::from(id))
            .ok_or_else(Error::new_eof)?;
        io.input.push_back(bytes);
        io.input_arrived.notify_all();
        Ok(())
    }

    /// Marks end-of-stream on a stream's input.
    pub(crate) fn close_input(&self, id: StreamId) -> Result<()> {
        let mut inner = self.checked()?;
        let io = inner
            .streams
            .get_mut(&u32::from(id))
            .ok_or_else(Error::new_eof)?;
        io.input_eos = true;
        io.input_arrived.notify_all();
        Ok(())
    }

    /// Reads up to `max` request body bytes on behalf of a task.
    ///
    /// Returns the chunk and whether EOS follows it. With nothing
    /// buffered: `Again` when not blocking, otherwise parks on the
    /// stream's `input_arrived` condvar until bytes, EOS, reset, or
    /// abort.
    pub(crate) fn read_input(
        &self,
        id: StreamId,
        max: usize,
        block: bool,
    ) -> Result<(Bytes, bool)> {
        let key: u32 = id.into();
        let mut inner = self.lock();
        loop {
            if inner.aborted {
                return Err(Error::new_conn_aborted());
            }
            let io = match inner.streams.get_mut(&key) {
                Some(io) => io,
                // held or gone: the session is done with this stream
                None => return Err(Error::new_conn_aborted()),
            };
            if io.rst_error.is_some() {
                return Err(Error::new_conn_aborted());
            }
            if let Some(mut chunk) = io.input.pop_front() {
                if chunk.len() > max {
                    let rest = chunk.split_off(max);
                    io.input.push_front(rest);
                }
                io.input_consumed += chunk.len();
                let eos = io.input_eos && io.input.is_empty();
                return Ok((chunk, eos));
            }
            if io.input_eos {
                return Ok((Bytes::new(), true));
            }
            if !block {
                return Err(Error::new_again());
            }
            let cond = Arc::clone(&io.input_arrived);
            inner = cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Invokes `cb(stream, consumed)` for every stream with input read
    /// since the last call, resetting the counters. Returns whether any
    /// stream was reported.
    pub(crate) fn update_input_windows<F>(&self, mut cb: F) -> Result<bool>
    where
        F: FnMut(StreamId, usize),
    {
        let mut inner = self.checked()?;
        let mut updated = false;
        for (&id, io) in inner.streams.iter_mut() {
            if io.input_consumed > 0 {
                cb(StreamId::from(id), io.input_consumed);
                io.input_consumed = 0;
                updated = true;
            }
        }
        Ok(updated)
    }

    // ===== output operations =====

    /// Attaches the response head for a stream and marks it ready for
    /// submission.
    pub(crate) fn set_response(&self, id: StreamId, head: ResponseHead) -> Result<()> {
        let mut inner = self.checked()?;
        let key: u32 = id.into();
        let io = inner.streams.get_mut(&key).ok_or_else(Error::new_conn_aborted)?;
        if io.rst_error.is_some() {
            return Err(Error::new_conn_aborted());
        }
        debug!("mplx({}): response {} on stream {}", self.id, head.status, id);
        io.response = Some(head);
        inner.ready.push(key);
        self.added_output.notify_all();
        Ok(())
    }

    /// Attaches trailing response headers, submitted after the body.
    pub(crate) fn set_trailers(&self, id: StreamId, fields: Vec<(Bytes, Bytes)>) -> Result<()> {
        let mut inner = self.checked()?;
        let io = inner
            .streams
            .get_mut(&u32::from(id))
            .ok_or_else(Error::new_conn_aborted)?;
        io.trailers = Some(fields);
        Ok(())
    }

    /// Appends response body bytes on behalf of a task, blocking while
    /// the stream's buffered output exceeds `stream_max_mem`.
    ///
    /// The cap is not enforced to the last byte: one chunk may overshoot
    /// it, since it is already in memory anyway.
    pub(crate) fn write_output(&self, id: StreamId, bytes: Bytes) -> Result<()> {
        let key: u32 = id.into();
        let mut inner = self.lock();
        loop {
            if inner.aborted {
                return Err(Error::new_conn_aborted());
            }
            let io = match inner.streams.get_mut(&key) {
                Some(io) => io,
                None => return Err(Error::new_conn_aborted()),
            };
            if io.rst_error.is_some() {
                return Err(Error::new_conn_aborted());
            }
            if io.output_len <= self.stream_max_mem {
                io.output_len += bytes.len();
                io.output.push_back(bytes);
                self.added_output.notify_all();
                return Ok(());
            }
            let cond = Arc::clone(&io.output_drained);
            inner = cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Marks end-of-stream on a stream's output.
    pub(crate) fn close_output(&self, id: StreamId) -> Result<()> {
        let mut inner = self.checked()?;
        let io = inner
            .streams
            .get_mut(&u32::from(id))
            .ok_or_else(Error::new_conn_aborted)?;
        io.output_eos = true;
        self.added_output.notify_all();
        Ok(())
    }

    /// Reads up to `max` response body bytes for DATA emission. Session
    /// side; never blocks.
    pub(crate) fn read_output(&self, id: StreamId, max: usize) -> Result<OutputRead> {
        let mut inner = self.checked()?;
        let io = match inner.streams.get_mut(&u32::from(id)) {
            Some(io) => io,
            None => return Ok(OutputRead::Suspend),
        };
        if let Some(reason) = io.rst_error {
            return Ok(OutputRead::Reset(reason));
        }
        if let Some(mut chunk) = io.output.pop_front() {
            if chunk.len() > max {
                let rest = chunk.split_off(max);
                io.output.push_front(rest);
            }
            io.output_len -= chunk.len();
            if io.output_len <= self.stream_max_mem {
                io.output_drained.notify_all();
            }
            let eos = io.output_eos && io.output.is_empty();
            return Ok(OutputRead::Data { bytes: chunk, eos });
        }
        if io.output_eos {
            return Ok(OutputRead::Data {
                bytes: Bytes::new(),
                eos: true,
            });
        }
        Ok(OutputRead::Suspend)
    }

    /// Whether a stream currently has output bytes or EOS to emit.
    pub(crate) fn output_ready(&self, id: StreamId) -> bool {
        let inner = self.lock();
        inner
            .streams
            .get(&u32::from(id))
            .map(|io| !io.output.is_empty() || io.output_eos || io.rst_error.is_some())
            .unwrap_or(false)
    }

    /// Takes the trailers of a stream, if its task attached any.
    pub(crate) fn take_trailers(&self, id: StreamId) -> Option<Vec<(Bytes, Bytes)>> {
        let mut inner = self.lock();
        inner
            .streams
            .get_mut(&u32::from(id))
            .and_then(|io| io.trailers.take())
    }

    /// Pops the highest-priority stream with an unsubmitted response
    /// head.
    pub(crate) fn pop_ready_response(&self) -> Option<(StreamId, ResponseHead)> {
        let mut inner = self.lock();
        if inner.aborted || inner.ready.is_empty() {
            return None;
        }
        let inner = &mut *inner;
        let best = inner
            .ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &id)| {
                inner
                    .streams
                    .get(&id)
                    .map(|io| io.priority)
                    .unwrap_or(PriorityKey {
                        depth: u32::MAX,
                        weight: 1,
                    })
            })
            .map(|(i, _)| i)?;
        let id = inner.ready.swap_remove(best);
        let head = inner.streams.get_mut(&id).and_then(|io| io.response.take());
        head.map(|head| (StreamId::from(id), head))
    }

    /// Parks the session on `added_output` for up to `timeout`.
    pub(crate) fn trywait_output(&self, timeout: Duration) -> Result<()> {
        let inner = self.checked()?;
        let (inner, res) = self
            .added_output
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
        if inner.aborted {
            return Err(Error::new_conn_aborted());
        }
        if res.timed_out() {
            return Err(Error::new_timeup());
        }
        Ok(())
    }

    // ===== task queue =====

    /// Queues a task for execution and registers this mplx with the
    /// worker pool (the pool ignores a register while already listed).
    pub(crate) fn schedule(mplx: &Arc<Mplx>, task: Task, priority: PriorityKey) -> Result<()> {
        {
            let mut inner = mplx.checked()?;
            let key: u32 = task.stream_id().into();
            if let Some(io) = inner.streams.get_mut(&key) {
                io.priority = priority;
            }
            // equal priorities stay FIFO
            let at = inner
                .pending
                .iter()
                .position(|(k, _)| *k > priority)
                .unwrap_or(inner.pending.len());
            inner.pending.insert(at, (priority, task));
        }
        WorkerPool::register(&mplx.workers, mplx);
        Ok(())
    }

    /// Re-keys queued work after a priority change; the session passes a
    /// fresh key function computed from its dependency tree.
    pub(crate) fn reprioritize<F>(&self, keyfn: F)
    where
        F: Fn(StreamId) -> PriorityKey,
    {
        let mut inner = self.lock();
        for (key, task) in inner.pending.iter_mut() {
            *key = keyfn(task.stream_id());
        }
        inner.pending.sort_by(|a, b| a.0.cmp(&b.0));
        for (&id, io) in inner.streams.iter_mut() {
            io.priority = keyfn(StreamId::from(id));
        }
    }

    /// Hands the next pending task to a worker, or `None` if this mplx
    /// has nothing to do (the caller then drops it from its ring and it
    /// must re-register).
    pub(crate) fn pop_task(&self) -> Option<Task> {
        let mut inner = self.lock();
        if inner.aborted || inner.pending.is_empty() {
            return None;
        }
        let (_, task) = inner.pending.remove(0);
        let key: u32 = task.stream_id().into();
        if let Some(io) = inner.streams.get_mut(&key) {
            io.task_running = true;
        }
        inner.tasks_active += 1;
        trace!("mplx({}): task for stream {} claimed", self.id, task.stream_id());
        Some(task)
    }

    /// The task-finished callback: run by the worker after the task
    /// returns, regardless of outcome.
    pub(crate) fn task_finished(&self, id: StreamId) {
        let mut inner = self.lock();
        let key: u32 = id.into();
        inner.tasks_active = inner.tasks_active.saturating_sub(1);
        if let Some(io) = inner.streams.get_mut(&key) {
            io.task_running = false;
        }
        if let Some(io) = inner.hold.shift_remove(&key) {
            inner.purge.push((key, io));
        }
        if inner.tasks_active == 0 {
            self.join_wait.notify_all();
        }
        trace!("mplx({}): task for stream {} finished", self.id, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};
    use std::thread;

    fn mplx() -> Arc<Mplx> {
        let pool = WorkerPool::new(0, 2, Duration::from_secs(1));
        Arc::new(Mplx::new(1, 64, pool))
    }

    fn sid(n: u32) -> StreamId {
        StreamId::from(n)
    }

    #[test]
    fn input_round_trips_in_order() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        m.append_input(sid(1), Bytes::from_static(b"hello ")).unwrap();
        m.append_input(sid(1), Bytes::from_static(b"world")).unwrap();
        m.close_input(sid(1)).unwrap();

        let (a, eos) = m.read_input(sid(1), 1024, false).unwrap();
        assert_eq!(&a[..], b"hello ");
        assert!(!eos);
        let (b, eos) = m.read_input(sid(1), 1024, false).unwrap();
        assert_eq!(&b[..], b"world");
        assert!(eos);
        let (rest, eos) = m.read_input(sid(1), 1024, false).unwrap();
        assert!(rest.is_empty());
        assert!(eos);
    }

    #[test]
    fn read_input_honors_max() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        m.append_input(sid(1), Bytes::from_static(b"abcdef")).unwrap();
        let (a, _) = m.read_input(sid(1), 4, false).unwrap();
        assert_eq!(&a[..], b"abcd");
        let (b, _) = m.read_input(sid(1), 4, false).unwrap();
        assert_eq!(&b[..], b"ef");
    }

    #[test]
    fn empty_input_is_again_then_blocks_until_data() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        assert!(m.read_input(sid(1), 16, false).unwrap_err().is_again());

        let m2 = Arc::clone(&m);
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            m2.append_input(sid(1), Bytes::from_static(b"late")).unwrap();
        });
        let (bytes, _) = m.read_input(sid(1), 16, true).unwrap();
        assert_eq!(&bytes[..], b"late");
        writer.join().unwrap();
    }

    #[test]
    fn update_input_windows_reports_consumed_once() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        m.open_io(sid(3)).unwrap();
        m.append_input(sid(1), Bytes::from_static(b"12345")).unwrap();
        m.read_input(sid(1), 1024, false).unwrap();

        let mut seen = Vec::new();
        let updated = m.update_input_windows(|id, n| seen.push((id, n))).unwrap();
        assert!(updated);
        assert_eq!(seen, vec![(sid(1), 5)]);

        let updated = m.update_input_windows(|_, _| panic!("no update")).unwrap();
        assert!(!updated);
    }

    #[test]
    fn write_output_blocks_over_cap_until_drained() {
        let m = mplx(); // cap: 64 bytes
        m.open_io(sid(1)).unwrap();
        m.write_output(sid(1), Bytes::from(vec![b'x'; 100])).unwrap();

        let m2 = Arc::clone(&m);
        let writer = thread::spawn(move || {
            // over cap now; this must block until the session drains
            m2.write_output(sid(1), Bytes::from(vec![b'y'; 10])).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        match m.read_output(sid(1), 80).unwrap() {
            OutputRead::Data { bytes, eos } => {
                assert_eq!(bytes.len(), 80);
                assert!(!eos);
            }
            other => panic!("unexpected: {:?}", other),
        }
        writer.join().unwrap();

        match m.read_output(sid(1), 100).unwrap() {
            OutputRead::Data { bytes, .. } => assert_eq!(bytes.len(), 20),
            other => panic!("unexpected: {:?}", other),
        }
        match m.read_output(sid(1), 100).unwrap() {
            OutputRead::Data { bytes, .. } => assert_eq!(&bytes[..], &[b'y'; 10][..]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn read_output_suspends_then_sees_eos() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        assert!(matches!(
            m.read_output(sid(1), 10).unwrap(),
            OutputRead::Suspend
        ));
        m.write_output(sid(1), Bytes::from_static(b"ok")).unwrap();
        m.close_output(sid(1)).unwrap();
        match m.read_output(sid(1), 10).unwrap() {
            OutputRead::Data { bytes, eos } => {
                assert_eq!(&bytes[..], b"ok");
                assert!(eos);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn set_response_marks_ready() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        m.open_io(sid(3)).unwrap();
        let head = ResponseHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        m.set_response(sid(3), head.clone()).unwrap();
        let (id, popped) = m.pop_ready_response().unwrap();
        assert_eq!(id, sid(3));
        assert_eq!(popped.status, StatusCode::OK);
        assert!(m.pop_ready_response().is_none());
    }

    #[test]
    fn abort_is_sticky_and_wakes_everyone() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();

        let m2 = Arc::clone(&m);
        let reader = thread::spawn(move || m2.read_input(sid(1), 16, true));
        thread::sleep(Duration::from_millis(20));
        m.abort();

        assert!(reader.join().unwrap().unwrap_err().is_conn_aborted());
        assert!(m.append_input(sid(1), Bytes::new()).unwrap_err().is_conn_aborted());
        // idempotent
        m.abort();
        assert!(m.close_input(sid(1)).unwrap_err().is_conn_aborted());
    }

    #[test]
    fn trywait_output_times_out_and_wakes_on_output() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        assert!(m
            .trywait_output(Duration::from_millis(10))
            .unwrap_err()
            .is_timeup());

        let m2 = Arc::clone(&m);
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            m2.write_output(sid(1), Bytes::from_static(b"!")).unwrap();
        });
        m.trywait_output(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn stream_done_with_running_task_defers_purge() {
        let m = mplx();
        m.open_io(sid(1)).unwrap();
        {
            // simulate a claimed task
            let mut inner = m.lock();
            inner.streams.get_mut(&1).unwrap().task_running = true;
            inner.tasks_active = 1;
        }
        m.stream_done(sid(1), Some(Reason::CANCEL));
        {
            let inner = m.lock();
            assert!(inner.streams.get(&1).is_none());
            assert!(inner.hold.get(&1).is_some());
            assert!(inner.purge.is_empty());
        }
        // a parked writer now errors instead of waiting forever
        assert!(m
            .write_output(sid(1), Bytes::from_static(b"x"))
            .unwrap_err()
            .is_conn_aborted());

        m.task_finished(sid(1));
        {
            let inner = m.lock();
            assert!(inner.hold.get(&1).is_none());
            assert_eq!(inner.purge.len(), 1);
        }
        m.purge();
        assert!(m.lock().purge.is_empty());
    }
}
