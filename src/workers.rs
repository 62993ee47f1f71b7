//! The worker pool: a dynamic set of threads executing tasks from every
//! registered multiplexer.
//!
//! Multiplexers with runnable tasks sit in a ring; a worker pops the
//! head, takes a task, and puts the mplx back at the tail, which gives
//! round-robin fairness across sessions. A worker that got a task keeps
//! pulling from the same mplx for a bounded streak before letting go.
//! An mplx whose queue runs dry falls out of the ring and must register
//! again.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::mplx::Mplx;

/// Back-to-back tasks a worker may take from one held mplx before
/// releasing it.
const FAIRNESS_QUANTUM: usize = 4;

#[derive(Debug)]
struct PoolInner {
    mplxs: VecDeque<Arc<Mplx>>,
    handles: Vec<thread::JoinHandle<()>>,
    worker_count: usize,
    idle_count: usize,
    next_worker_id: usize,
    aborted: bool,
}

/// The process-wide pool of worker threads.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    min_size: usize,
    max_size: usize,
    max_idle: Duration,
    inner: Mutex<PoolInner>,
    mplx_added: Condvar,
}

impl WorkerPool {
    pub(crate) fn new(min_size: usize, max_size: usize, max_idle: Duration) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool {
            min_size,
            max_size,
            max_idle,
            inner: Mutex::new(PoolInner {
                mplxs: VecDeque::new(),
                handles: Vec::new(),
                worker_count: 0,
                idle_count: 0,
                next_worker_id: 0,
                aborted: false,
            }),
            mplx_added: Condvar::new(),
        });
        {
            let mut inner = pool.lock();
            while inner.worker_count < min_size {
                WorkerPool::add_worker(&pool, &mut inner);
            }
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live worker threads.
    pub(crate) fn live_workers(&self) -> usize {
        self.lock().worker_count
    }

    /// Adds an mplx to the ring tail. Signals an idle worker when one is
    /// waiting; otherwise grows the pool while under max.
    pub(crate) fn register(pool: &Arc<WorkerPool>, mplx: &Arc<Mplx>) {
        let mut inner = pool.lock();
        if inner.aborted {
            return;
        }
        if !in_list(&inner.mplxs, mplx) {
            trace!("workers: register mplx({})", mplx.id());
            inner.mplxs.push_back(Arc::clone(mplx));
        }
        if inner.idle_count > 0 {
            pool.mplx_added.notify_one();
        } else if inner.worker_count < pool.max_size {
            trace!("workers: got {} workers, adding 1", inner.worker_count);
            WorkerPool::add_worker(pool, &mut inner);
        }
    }

    /// Drops an mplx from the ring.
    pub(crate) fn unregister(&self, mplx: &Arc<Mplx>) {
        let mut inner = self.lock();
        inner.mplxs.retain(|m| !Arc::ptr_eq(m, mplx));
    }

    /// Stops every worker and joins the threads. Called at child-exit,
    /// after sessions have drained.
    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut inner = self.lock();
            inner.aborted = true;
            inner.mplxs.clear();
            std::mem::take(&mut inner.handles)
        };
        self.mplx_added.notify_all();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }

    fn add_worker(pool: &Arc<WorkerPool>, inner: &mut PoolInner) {
        let id = inner.next_worker_id;
        inner.next_worker_id += 1;
        let pool2 = Arc::clone(pool);
        let spawned = thread::Builder::new()
            .name(format!("weft-worker-{}", id))
            .spawn(move || worker_loop(pool2, id));
        match spawned {
            Ok(handle) => {
                inner.worker_count += 1;
                inner.handles.push(handle);
            }
            Err(err) => {
                warn!("spawning worker {} failed: {}", id, err);
            }
        }
    }
}

/// One worker thread: claim tasks with fairness, shrink when idle.
fn worker_loop(pool: Arc<WorkerPool>, worker_id: usize) {
    trace!("worker({}): starting", worker_id);
    let mut held: Option<Arc<Mplx>> = None;
    let mut streak = 0usize;

    'main: loop {
        // drain the held mplx first, up to the fairness quantum
        if let Some(m) = held.as_ref() {
            if streak < FAIRNESS_QUANTUM {
                if let Some(task) = m.pop_task() {
                    streak += 1;
                    task.run();
                    continue 'main;
                }
            }
            held = None;
            streak = 0;
        }

        let mut inner = pool.lock();
        trace!("worker({}): looking for work", worker_id);
        let wait_start = Instant::now();
        loop {
            if inner.aborted {
                break 'main;
            }

            // round-robin scan: head out, tail back in if it had a task
            while let Some(m) = inner.mplxs.pop_front() {
                if let Some(task) = m.pop_task() {
                    if !in_list(&inner.mplxs, &m) {
                        inner.mplxs.push_back(Arc::clone(&m));
                    }
                    held = Some(m);
                    streak = 1;
                    drop(inner);
                    task.run();
                    continue 'main;
                }
                // dry mplx falls out of the ring until it re-registers
            }

            if inner.worker_count > pool.min_size {
                let elapsed = wait_start.elapsed();
                if elapsed >= pool.max_idle {
                    debug!("worker({}): idle beyond {:?}, exiting", worker_id, pool.max_idle);
                    break 'main;
                }
                inner.idle_count += 1;
                let (guard, _) = pool
                    .mplx_added
                    .wait_timeout(inner, pool.max_idle - elapsed)
                    .unwrap_or_else(|e| e.into_inner());
                inner = guard;
                inner.idle_count -= 1;
            } else {
                trace!(
                    "worker({}): waiting for work, worker_count={}",
                    worker_id,
                    inner.worker_count
                );
                inner.idle_count += 1;
                inner = pool
                    .mplx_added
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
                inner.idle_count -= 1;
            }
        }
    }

    let mut inner = pool.lock();
    inner.worker_count -= 1;
    trace!("worker({}): done", worker_id);
}

fn in_list(ring: &VecDeque<Arc<Mplx>>, mplx: &Arc<Mplx>) -> bool {
    ring.iter().any(|m| Arc::ptr_eq(m, mplx))
}
