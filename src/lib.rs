#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # weft
//!
//! An embeddable HTTP/2 **server engine**: it turns one client
//! connection into many concurrent request/response exchanges, each
//! served by the embedding host's ordinary HTTP/1.1 request machinery
//! on a worker thread, while the connection thread multiplexes frames
//! in both directions.
//!
//! weft is not a server. The pieces a full server owns — accepting
//! sockets, TLS and ALPN, configuration directives, the actual request
//! handlers — stay with the host. What weft owns is the hard middle:
//!
//! - the **session**, a frame-driven state machine per connection,
//! - the **multiplexer**, the thread-safe bridge carrying stream bodies
//!   between the session thread and the workers, with per-stream
//!   backpressure,
//! - the **worker pool**, sized dynamically between configured bounds,
//! - the **task**, which replays each stream as an HTTP/1.1 exchange
//!   against the host.
//!
//! ## Hosting
//!
//! Implement [`Host`] (parse request bytes, produce response bytes —
//! usually by handing both to an existing HTTP/1.1 stack), build an
//! [`Engine`] at process start, and call
//! [`Engine::serve_connection`] with each accepted HTTP/2 transport:
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//!
//! struct MyHost;
//!
//! impl weft::Host for MyHost {
//!     fn process_connection(&self, conn: &mut dyn weft::SubConn) -> std::io::Result<()> {
//!         let mut request = Vec::new();
//!         let mut buf = [0u8; 8192];
//!         loop {
//!             let n = conn.read(&mut buf)?;
//!             if n == 0 {
//!                 break;
//!             }
//!             request.extend_from_slice(&buf[..n]);
//!         }
//!         conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi")
//!     }
//! }
//!
//! let engine = weft::Engine::new(weft::Config::default(), Arc::new(MyHost));
//! let listener = std::net::TcpListener::bind("127.0.0.1:8443").unwrap();
//! for stream in listener.incoming() {
//!     let stream = stream.unwrap();
//!     let engine = Arc::clone(&engine);
//!     std::thread::spawn(move || {
//!         let _ = engine.serve_connection(stream);
//!     });
//! }
//! ```

mod alt_svc;
mod codec;
mod config;
mod conn_io;
mod engine;
mod error;
mod frame;
mod hpack;
mod mplx;
mod session;
mod stream;
mod task;
mod workers;

pub use crate::alt_svc::{decorate as alt_svc_decorate, AltSvc};
pub use crate::config::{Config, ConfigOverlay};
pub use crate::conn_io::Transport;
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::frame::{Reason, StreamId};
pub use crate::session::UpgradeRequest;
pub use crate::stream::{RequestHead, ResponseHead};
pub use crate::task::{Host, SubConn};
