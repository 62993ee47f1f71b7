//! Buffered byte I/O between the session and its transport.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::trace;

use crate::error::{Error, Result};

/// The byte transport a session runs over.
///
/// The session thread is the only caller. Reads come in two flavors
/// because the session alternates between blocking (idle, keepalive
/// bounded) and non-blocking (busy) reads.
pub trait Transport: Send {
    /// Blocking read, bounded by `timeout` when given. `Ok(0)` means the
    /// peer closed the connection orderly.
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize>;

    /// Non-blocking read; `ErrorKind::WouldBlock` when no bytes are
    /// available.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some bytes, blocking until at least one is accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flush anything the transport itself buffers.
    fn flush(&mut self) -> io::Result<()>;

    /// Shut the transport down for writing; used at end-of-connection.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        self.set_read_timeout(timeout)?;
        Read::read(self, buf)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.set_nonblocking(true)?;
        let res = Read::read(self, buf);
        self.set_nonblocking(false)?;
        res
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Write)
    }
}

/// The initial read size, and the unit the read buffer grows by.
const READ_CHUNK: usize = 16 * 1024;

/// Output written before the connection counts as warmed up; while
/// warming, every write passes through promptly so TLS record sizes can
/// ramp.
const WARMUP_SIZE: u64 = 64 * 1024;

/// How long buffered output may sit before `consider_flush` pushes it
/// out anyway.
const COOLDOWN: Duration = Duration::from_millis(10);

/// Buffered I/O over the session transport: coalesces frame writes up to
/// a flush threshold and feeds inbound bytes to the codec.
#[derive(Debug)]
pub(crate) struct ConnIo<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
    scratch: Box<[u8]>,
    flush_threshold: usize,
    bytes_read: u64,
    bytes_written: u64,
    last_write: Option<Instant>,
    eoc: bool,
}

/// How a session read should wait for bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Park on the transport, up to the given timeout.
    Block(Duration),
    /// Only take what is already there.
    NonBlock,
}

impl<T: Transport> ConnIo<T> {
    pub(crate) fn new(io: T, flush_threshold: usize) -> ConnIo<T> {
        ConnIo {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
            flush_threshold,
            bytes_read: 0,
            bytes_written: 0,
            last_write: None,
            eoc: false,
        }
    }

    /// Pulls one chunk off the transport into the read buffer.
    ///
    /// Returns the byte count, `Again` when a non-blocking read found
    /// nothing, `Timeup` when a blocking read hit its deadline, and
    /// `Eof` on orderly close.
    pub(crate) fn fill(&mut self, mode: ReadMode) -> Result<usize> {
        let n = match mode {
            ReadMode::Block(timeout) => self.io.read(&mut self.scratch, Some(timeout)),
            ReadMode::NonBlock => self.io.try_read(&mut self.scratch),
        };
        match n {
            Ok(0) => Err(Error::new_eof()),
            Ok(n) => {
                trace!("read {} bytes", n);
                self.bytes_read += n as u64;
                self.read_buf.extend_from_slice(&self.scratch[..n]);
                Ok(n)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The bytes read so far and not yet consumed by the codec.
    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// The output accumulator the codec encodes frames into.
    pub(crate) fn write_buf(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    pub(crate) fn is_buffered(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Flushes when enough has accumulated, the connection is still
    /// warming up, or buffered bytes have been sitting past the
    /// cooldown.
    pub(crate) fn consider_flush(&mut self) -> Result<()> {
        if !self.is_buffered() {
            return Ok(());
        }
        let should = self.write_buf.len() >= self.flush_threshold
            || self.bytes_written < WARMUP_SIZE
            || self
                .last_write
                .map(|at| at.elapsed() >= COOLDOWN)
                .unwrap_or(true);
        if should {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Writes all buffered output to the transport.
    ///
    /// On `WouldBlock` the remaining bytes stay buffered and `Again` is
    /// returned so the session loop can retry.
    pub(crate) fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.io.write(&self.write_buf) {
                Ok(0) => {
                    return Err(Error::new_io(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    trace!("flushed {} bytes", n);
                    self.bytes_written += n as u64;
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Error::new_again());
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.last_write = Some(Instant::now());
        self.io.flush().map_err(Error::new_io)?;
        if self.eoc {
            self.io.shutdown().map_err(Error::new_io)?;
        }
        Ok(())
    }

    /// Marks end-of-connection: once the buffer drains, the transport is
    /// shut down and the session can be torn down.
    pub(crate) fn write_eoc(&mut self) {
        self.eoc = true;
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written + self.write_buf.len() as u64
    }

    #[cfg(test)]
    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }
}
