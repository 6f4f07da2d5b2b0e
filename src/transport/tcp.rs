//! TCP transport, covering both plain Modbus TCP (MBAP framing) and
//! Modbus RTU-over-TCP gateways (raw RTU framing carried over a socket).
//!
//! Grounded in `raffber-comsrv/comsrv/src/transport/tcp.rs::connect_tcp_stream`.

use super::{read_until_idle, Transport};
use crate::error::Error;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

pub struct TcpTransport {
    device_id: String,
    stream: TcpStream,
}

impl TcpTransport {
    /// Resolves `ip:port` (a literal address or a hostname — `device_id`
    /// still keys on the literal string the caller passed, so `127.0.0.1`
    /// and `localhost` are distinct devices even when they resolve to the
    /// same host), connects with `connect_timeout` as the deadline, and
    /// disables Nagle's algorithm since Modbus request/response pairs are
    /// small and latency-sensitive.
    pub async fn connect(
        device_id: &str,
        ip: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> crate::error::Result<Self> {
        let lookup = async {
            tokio::net::lookup_host((ip, port))
                .await
                .map_err(|e| Error::config(format!("cannot resolve {}:{}: {}", ip, port, e)))?
                .next()
                .ok_or_else(|| Error::config(format!("no address found for {}:{}", ip, port)))
        };
        let resolved = timeout(connect_timeout, lookup).await.map_err(|_| Error::timeout(device_id))?;
        let addr = resolved?;
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(device_id))?
            .map_err(|e| Error::io(device_id, e))?;
        stream.set_nodelay(true).map_err(|e| Error::io(device_id, e))?;
        Ok(TcpTransport { device_id: device_id.to_string(), stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_all(&mut self, buf: &[u8]) -> crate::error::Result<()> {
        self.stream
            .write_all(buf)
            .await
            .map_err(|e| Error::io(&self.device_id, e))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> crate::error::Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map_err(|e| Error::io(&self.device_id, e))?;
        Ok(())
    }

    /// Used by the TCP_RTU device kind: raw RTU framing carried over a TCP
    /// socket, with no MBAP length header to read ahead of time.
    async fn read_available_until_idle(
        &mut self,
        idle_gap: Duration,
        budget: Duration,
    ) -> crate::error::Result<Vec<u8>> {
        read_until_idle(&mut self.stream, &self.device_id, idle_gap, budget).await
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
