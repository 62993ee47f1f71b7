//! Engine configuration.

use std::time::Duration;

use crate::alt_svc::AltSvc;

/// Configuration for the HTTP/2 engine, one snapshot per session.
///
/// A host typically builds one baseline `Config` at child-init and
/// overlays per-virtual-server directives with [`ConfigOverlay::merge`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether HTTP/2 handling is enabled for this server.
    pub enabled: bool,
    /// Maximum concurrent streams per session, advertised in SETTINGS.
    pub max_streams: u32,
    /// Largest accepted request header block, advertised in SETTINGS.
    pub max_header_list_size: usize,
    /// Per-stream initial flow-control window, advertised in SETTINGS.
    pub initial_window_size: u32,
    /// Per-stream output buffer cap; writers past it block.
    pub stream_max_mem: usize,
    /// Lower bound on pool threads.
    pub min_workers: usize,
    /// Upper bound on pool threads.
    pub max_workers: usize,
    /// How long a surplus worker may idle before exiting.
    pub max_worker_idle: Duration,
    /// Alternative services to advertise on non-HTTP/2 responses.
    pub alt_svcs: Vec<AltSvc>,
    /// `ma=` parameter for the `Alt-Svc` header.
    pub alt_svc_max_age: Option<u32>,
    /// How long an idle session (no streams) waits for the next frame.
    pub keepalive: Duration,
    /// Read/wait budget while streams exist.
    pub timeout: Duration,
    /// ConnIO buffers output up to this size before passing it on.
    pub flush_threshold: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            enabled: true,
            max_streams: 100,
            max_header_list_size: 16 * 1024,
            initial_window_size: 64 * 1024,
            stream_max_mem: 64 * 1024,
            min_workers: 4,
            max_workers: 32,
            max_worker_idle: Duration::from_secs(10),
            alt_svcs: Vec::new(),
            alt_svc_max_age: None,
            keepalive: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            flush_threshold: 4 * 1024,
        }
    }
}

/// A partial configuration where unset fields fall through to a base
/// config on merge, the way per-virtual-server directives overlay the
/// server-wide ones.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverlay {
    /// See [`Config::enabled`].
    pub enabled: Option<bool>,
    /// See [`Config::max_streams`].
    pub max_streams: Option<u32>,
    /// See [`Config::max_header_list_size`].
    pub max_header_list_size: Option<usize>,
    /// See [`Config::initial_window_size`].
    pub initial_window_size: Option<u32>,
    /// See [`Config::stream_max_mem`].
    pub stream_max_mem: Option<usize>,
    /// See [`Config::alt_svcs`].
    pub alt_svcs: Option<Vec<AltSvc>>,
    /// See [`Config::alt_svc_max_age`].
    pub alt_svc_max_age: Option<u32>,
}

impl ConfigOverlay {
    /// Produces a complete config, taking set fields from `self` and the
    /// rest from `base`.
    pub fn merge(&self, base: &Config) -> Config {
        Config {
            enabled: self.enabled.unwrap_or(base.enabled),
            max_streams: self.max_streams.unwrap_or(base.max_streams),
            max_header_list_size: self
                .max_header_list_size
                .unwrap_or(base.max_header_list_size),
            initial_window_size: self
                .initial_window_size
                .unwrap_or(base.initial_window_size),
            stream_max_mem: self.stream_max_mem.unwrap_or(base.stream_max_mem),
            alt_svcs: self
                .alt_svcs
                .clone()
                .unwrap_or_else(|| base.alt_svcs.clone()),
            alt_svc_max_age: self.alt_svc_max_age.or(base.alt_svc_max_age),
            ..base.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_merge_prefers_set_fields() {
        let base = Config::default();
        let overlay = ConfigOverlay {
            max_streams: Some(8),
            stream_max_mem: Some(4096),
            ..ConfigOverlay::default()
        };
        let merged = overlay.merge(&base);
        assert_eq!(merged.max_streams, 8);
        assert_eq!(merged.stream_max_mem, 4096);
        assert_eq!(merged.max_header_list_size, base.max_header_list_size);
        assert!(merged.enabled);
    }
}
