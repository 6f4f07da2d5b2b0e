//! Serial (RS-232/RS-485) transport for Modbus RTU.
//!
//! Grounded in `raffber-comsrv/comsrv/src/transport/serial/mod.rs::open_serial_port`,
//! using the modern `tokio_serial` builder API rather than the deprecated
//! `SerialPortSettings` struct seen elsewhere in the corpus.

use super::{read_until_idle, Transport};
use crate::error::Error;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;
use tokio_serial::SerialStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(s: StopBits) -> Self {
        match s {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(d: DataBits) -> Self {
        match d {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

pub struct SerialTransport {
    device_id: String,
    port: SerialStream,
}

impl SerialTransport {
    pub async fn open(
        device_id: &str,
        port_name: &str,
        baud: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> crate::error::Result<Self> {
        let port = tokio_serial::new(port_name, baud)
            .data_bits(data_bits.into())
            .stop_bits(stop_bits.into())
            .parity(parity.into())
            .open_native_async()
            .map_err(|e| Error::io(device_id, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(SerialTransport { device_id: device_id.to_string(), port })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, buf: &[u8]) -> crate::error::Result<()> {
        self.port
            .write_all(buf)
            .await
            .map_err(|e| Error::io(&self.device_id, e))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> crate::error::Result<()> {
        self.port
            .read_exact(buf)
            .await
            .map_err(|e| Error::io(&self.device_id, e))?;
        Ok(())
    }

    /// Polls for more bytes every 10ms until the line has been silent for
    /// `idle_gap`, bounded overall by `budget`. RTU has no length header,
    /// so this is how a response frame's end is detected.
    async fn read_available_until_idle(
        &mut self,
        idle_gap: Duration,
        budget: Duration,
    ) -> crate::error::Result<Vec<u8>> {
        read_until_idle(&mut self.port, &self.device_id, idle_gap, budget).await
    }

    async fn close(&mut self) {
        // tokio_serial::SerialStream has no explicit close; dropping the
        // handle releases the file descriptor.
    }
}
