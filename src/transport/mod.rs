//! Byte-stream transports a `Device` can be built on: TCP sockets and
//! serial lines. Grounded in `raffber-comsrv/comsrv/src/transport/tcp.rs`
//! and `transport/serial/mod.rs`, collapsed into a single `Transport` trait
//! since this crate only ever drives a transport through the same
//! write-then-read-frame sequence regardless of which kind it is.

pub mod serial;
pub mod tcp;

use crate::error::Error;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout, Duration, Instant};

pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// A connected byte-stream transport. All methods are cancel-safe in the
/// sense that a timed-out call leaves the transport in a state where the
/// caller should drop and reconnect rather than retry the same read.
#[async_trait]
pub trait Transport: Send {
    async fn write_all(&mut self, buf: &[u8]) -> crate::error::Result<()>;

    async fn read_exact(&mut self, buf: &mut [u8]) -> crate::error::Result<()>;

    /// Reads bytes until the line falls idle for `idle_gap`, bounded by an
    /// overall `budget`. Used by RTU framing (plain serial, or RTU-over-TCP),
    /// which has no length header to read ahead of time.
    async fn read_available_until_idle(
        &mut self,
        idle_gap: Duration,
        budget: Duration,
    ) -> crate::error::Result<Vec<u8>>;

    async fn close(&mut self);
}

/// Shared read-until-idle loop used by both transports: polls every 10ms,
/// accumulating bytes, until the line has been silent for `idle_gap` or
/// `budget` elapses. At least one byte must arrive before the deadline or
/// the call times out, per §4.2.
pub(crate) async fn read_until_idle<R: tokio::io::AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    device_id: &str,
    idle_gap: Duration,
    budget: Duration,
) -> crate::error::Result<Vec<u8>> {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + budget;
    let mut buf = Vec::new();
    let mut last_byte_at: Option<Instant> = None;
    let mut chunk = [0u8; 256];

    loop {
        if Instant::now() >= deadline {
            if buf.is_empty() {
                return Err(Error::timeout(device_id));
            }
            return Ok(buf);
        }
        match timeout(POLL_INTERVAL, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Err(Error::io(device_id, std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")));
                }
                return Ok(buf);
            }
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                last_byte_at = Some(Instant::now());
            }
            Ok(Err(e)) => return Err(Error::io(device_id, e)),
            Err(_) => {
                if let Some(t) = last_byte_at {
                    if t.elapsed() >= idle_gap && !buf.is_empty() {
                        return Ok(buf);
                    }
                } else {
                    sleep(Duration::from_millis(0)).await;
                }
            }
        }
    }
}
