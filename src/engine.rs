//! The process-wide engine: worker pool, baseline config, and the entry
//! points a host calls per connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::conn_io::Transport;
use crate::error::Result;
use crate::session::{Session, UpgradeRequest};
use crate::task::Host;
use crate::workers::WorkerPool;

/// The HTTP/2 engine a host embeds: create one per process at
/// child-init, hand every HTTP/2 connection to it, shut it down at
/// child-exit.
pub struct Engine {
    config: Config,
    host: Arc<dyn Host>,
    workers: Arc<WorkerPool>,
    stopping: Arc<AtomicBool>,
    next_session_id: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("stopping", &self.stopping)
            .finish()
    }
}

impl Engine {
    /// Builds the engine: spawns the minimum worker complement and keeps
    /// the config as the baseline for every session.
    pub fn new(config: Config, host: Arc<dyn Host>) -> Arc<Engine> {
        let workers = WorkerPool::new(
            config.min_workers,
            config.max_workers,
            config.max_worker_idle,
        );
        Arc::new(Engine {
            config,
            host,
            workers,
            stopping: Arc::new(AtomicBool::new(false)),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of live worker threads right now.
    pub fn live_workers(&self) -> usize {
        self.workers.live_workers()
    }

    /// Serves one HTTP/2 connection to completion on the calling thread
    /// (the host's connection thread becomes the session thread).
    ///
    /// The transport must already be past protocol selection: TLS+ALPN
    /// `h2`, or cleartext prior knowledge.
    pub fn serve_connection<T: Transport>(&self, io: T) -> Result<()> {
        let mut session = self.new_session(io)?;
        session.run()
    }

    /// Serves a connection that arrived as an HTTP/1.1 `Upgrade: h2c`
    /// request: the upgrade request is replayed as stream 1, then the
    /// connection continues as HTTP/2.
    pub fn serve_upgraded<T: Transport>(&self, io: T, upgrade: UpgradeRequest) -> Result<()> {
        let mut session = self.new_session(io)?;
        session.apply_upgrade(upgrade)?;
        session.run()
    }

    fn new_session<T: Transport>(&self, io: T) -> Result<Session<T>> {
        if !self.config.enabled {
            return Err(crate::error::Error::new_internal());
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!("engine: session({}) accepted", id);
        Ok(Session::new(
            id,
            io,
            self.config.clone(),
            Arc::clone(&self.host),
            Arc::clone(&self.workers),
            Arc::clone(&self.stopping),
        ))
    }

    /// Flags every session to go away gracefully: open streams finish,
    /// no new ones are accepted.
    pub fn initiate_shutdown(&self) {
        debug!("engine: initiating graceful shutdown");
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Child-exit: stop accepting, then stop and join the workers.
    /// Sessions should have drained before this is called.
    pub fn shutdown(&self) {
        self.initiate_shutdown();
        self.workers.shutdown();
    }
}
