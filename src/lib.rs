//! Client-side Modbus master: a pool of TCP and RS-232/RS-485 devices with
//! supervised connection lifecycle (heartbeat, auto-reconnect,
//! persistent-device retry) behind a uniform request API.
//!
//! The crate never touches logging configuration itself — it only emits
//! through the `log` facade; wire up `env_logger` or any other backend in
//! the application.

pub mod client;
pub mod codec;
pub mod device;
pub mod error;
pub mod events;
mod iotask;
pub mod transport;

pub use client::Client;
pub use device::{ConnectionState, Device, DeviceConfig, DeviceKind, HeartbeatStrategy};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use transport::serial::{DataBits, Parity, StopBits};
