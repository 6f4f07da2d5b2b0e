//! The per-device state machine: binds one `Transport` to one codec
//! framing variant, serializes all I/O through an `IoTask` actor, and
//! implements the single-shot refresh-and-retry policy on transient
//! failure.
//!
//! Grounded in `raffber-comsrv/comsrv/src/modbus.rs::Handler::handle` and
//! `comsrv/src/transport/tcp.rs::Handler::handle` for the retry loop shape,
//! and `comsrv/src/iotask.rs` for the actor primitive (see `crate::iotask`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::codec::{self, function_codes};
use crate::error::Error;
use crate::iotask::{IoHandler, IoTask};
use crate::transport::serial::{DataBits, Parity, SerialTransport, StopBits};
use crate::transport::{TcpTransport, Transport};

/// Connection state, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closing,
}

/// Which framing and physical layer a device uses. TCP_RTU uses RTU
/// framing (no MBAP) carried over a plain TCP socket — common for
/// Ethernet-to-serial gateways that don't speak true Modbus TCP.
#[derive(Debug, Clone)]
pub enum DeviceKind {
    Tcp { ip: String, port: u16 },
    Rtu { port_name: String, baud: u32, data_bits: DataBits, stop_bits: StopBits, parity: Parity },
    TcpRtu { ip: String, port: u16 },
}

/// Immutable descriptor identifying and parameterizing a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub timeout_ms: u64,
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind, timeout_ms: u64) -> crate::error::Result<Self> {
        if timeout_ms == 0 {
            return Err(Error::config("timeout_ms must be >= 1"));
        }
        match &kind {
            DeviceKind::Tcp { ip, .. } | DeviceKind::TcpRtu { ip, .. } if ip.is_empty() => {
                return Err(Error::config("ip must not be empty"));
            }
            DeviceKind::Rtu { port_name, .. } if port_name.is_empty() => {
                return Err(Error::config("port_name must not be empty"));
            }
            _ => {}
        }
        Ok(DeviceConfig { kind, timeout_ms })
    }

    /// Canonical registry key per §3: `"TCP:<ip>:<port>"`, `"RTU:<port>"`,
    /// or `"TCP_RTU:<ip>:<port>"`.
    pub fn device_id(&self) -> String {
        match &self.kind {
            DeviceKind::Tcp { ip, port } => format!("TCP:{}:{}", ip, port),
            DeviceKind::Rtu { port_name, .. } => format!("RTU:{}", port_name),
            DeviceKind::TcpRtu { ip, port } => format!("TCP_RTU:{}:{}", ip, port),
        }
    }
}

/// A caller-supplied probe invoked during heartbeat. The default strategy
/// reads one holding register at address 0 of slave 1, per §4.3.
#[async_trait]
pub trait HeartbeatStrategy: Send + Sync {
    async fn probe(&self, device: &Device) -> crate::error::Result<()>;
}

pub(crate) struct DefaultHeartbeat;

#[async_trait]
impl HeartbeatStrategy for DefaultHeartbeat {
    async fn probe(&self, device: &Device) -> crate::error::Result<()> {
        device.send(1, function_codes::READ_HOLDING_REGISTERS, 0, 1).await.map(|_| ())
    }
}

enum DeviceMsg {
    Connect,
    Disconnect,
    Refresh,
    SendRaw(Vec<u8>),
}

enum DeviceReply {
    Ack,
    Response(Vec<u8>),
}

struct DeviceHandler {
    device_id: String,
    config: DeviceConfig,
    transport: Option<Box<dyn Transport>>,
    state: Arc<Mutex<ConnectionState>>,
    timeout_ms: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl DeviceHandler {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("device state mutex poisoned") = state;
    }

    fn get_state(&self) -> ConnectionState {
        *self.state.lock().expect("device state mutex poisoned")
    }

    async fn open_transport(&self) -> crate::error::Result<Box<dyn Transport>> {
        match &self.config.kind {
            DeviceKind::Tcp { ip, port } | DeviceKind::TcpRtu { ip, port } => {
                let t = TcpTransport::connect(&self.device_id, ip, *port, self.timeout()).await?;
                Ok(Box::new(t))
            }
            DeviceKind::Rtu { port_name, baud, data_bits, stop_bits, parity } => {
                let t = SerialTransport::open(&self.device_id, port_name, *baud, *data_bits, *stop_bits, *parity).await?;
                Ok(Box::new(t))
            }
        }
    }

    async fn do_connect(&mut self) -> crate::error::Result<()> {
        if self.get_state() == ConnectionState::Connected {
            return Ok(());
        }
        let transport = self.open_transport().await?;
        self.transport = Some(transport);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn do_disconnect(&mut self) {
        self.set_state(ConnectionState::Closing);
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn is_tcp_framed(&self) -> bool {
        matches!(self.config.kind, DeviceKind::Tcp { .. })
    }

    /// One attempt at writing `bytes` and reading back the matching
    /// response, with no retry. `bytes` must already be a complete,
    /// correctly-framed request built by `codec`.
    async fn try_send(&mut self, bytes: &[u8]) -> crate::error::Result<Vec<u8>> {
        let tcp_framed = self.is_tcp_framed();
        let timeout = self.timeout();
        let device_id = self.device_id.clone();
        let transport = self.transport.as_mut().ok_or_else(|| Error::not_connected(&device_id))?;
        transport.write_all(bytes).await?;

        if tcp_framed {
            let sent_tid = u16::from_be_bytes([bytes[0], bytes[1]]);
            let read_response = async {
                let mut header = [0u8; codec::tcp::MBAP_HEADER_LEN];
                transport.read_exact(&mut header).await?;
                let parsed = codec::tcp::parse_header(&device_id, &header)?;
                if parsed.transaction_id != sent_tid {
                    return Err(Error::protocol(
                        &device_id,
                        format!("transaction id mismatch: sent {}, got {}", sent_tid, parsed.transaction_id),
                    ));
                }
                let pdu_len = (parsed.length - 1) as usize;
                let mut pdu = vec![0u8; pdu_len];
                transport.read_exact(&mut pdu).await?;
                let mut full = header.to_vec();
                full.extend_from_slice(&pdu);
                Ok(full)
            };
            // The transport's own read calls have no deadline; the request's
            // configured timeout bounds the whole response read here, per
            // §4.2's "per-read deadline".
            match tokio::time::timeout(timeout, read_response).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(&device_id)),
            }
        } else {
            let idle_gap = Duration::from_millis(10).max(timeout / 20);
            let budget = timeout * 2;
            let frame = transport.read_available_until_idle(idle_gap, budget).await?;
            if !codec::crc::validate(&frame) {
                return Err(Error::protocol(&device_id, "RTU CRC mismatch"));
            }
            Ok(frame)
        }
    }

    /// Implements §4.3 step 4: timeouts propagate directly; any other
    /// I/O or protocol failure gets exactly one refresh-and-retry.
    async fn send_with_retry(&mut self, bytes: Vec<u8>) -> crate::error::Result<Vec<u8>> {
        if self.get_state() != ConnectionState::Connected {
            return Err(Error::not_connected(&self.device_id));
        }
        match self.try_send(&bytes).await {
            Ok(resp) => Ok(resp),
            Err(e) if !e.should_retry() => {
                *self.last_error.lock().expect("last_error mutex poisoned") = Some(e.clone());
                Err(e)
            }
            Err(first_err) => {
                self.do_disconnect().await;
                if let Err(reconnect_err) = self.do_connect().await {
                    *self.last_error.lock().expect("last_error mutex poisoned") = Some(reconnect_err.clone());
                    return Err(reconnect_err);
                }
                match self.try_send(&bytes).await {
                    Ok(resp) => Ok(resp),
                    Err(second_err) => {
                        *self.last_error.lock().expect("last_error mutex poisoned") = Some(second_err.clone());
                        log::warn!(
                            "device {} failed twice (first: {}, retry: {})",
                            self.device_id, first_err, second_err
                        );
                        Err(second_err)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl IoHandler for DeviceHandler {
    type Request = DeviceMsg;
    type Response = DeviceReply;

    async fn handle(&mut self, req: Self::Request) -> crate::error::Result<Self::Response> {
        match req {
            DeviceMsg::Connect => {
                self.do_connect().await?;
                Ok(DeviceReply::Ack)
            }
            DeviceMsg::Disconnect => {
                self.do_disconnect().await;
                Ok(DeviceReply::Ack)
            }
            DeviceMsg::Refresh => {
                self.do_disconnect().await;
                self.do_connect().await?;
                Ok(DeviceReply::Ack)
            }
            DeviceMsg::SendRaw(bytes) => Ok(DeviceReply::Response(self.send_with_retry(bytes).await?)),
        }
    }

    async fn disconnect(&mut self) {
        self.do_disconnect().await;
    }
}

/// A supervised connection to one Modbus device. Cheap to clone: every
/// clone shares the same underlying actor task, state, and configuration.
#[derive(Clone)]
pub struct Device {
    config: Arc<DeviceConfig>,
    device_id: Arc<str>,
    actor: IoTask<DeviceHandler>,
    state: Arc<Mutex<ConnectionState>>,
    timeout_ms: Arc<AtomicU64>,
    heartbeat_enabled: Arc<AtomicBool>,
    heartbeat_strategy: Arc<Mutex<Arc<dyn HeartbeatStrategy>>>,
    last_error: Arc<Mutex<Option<Error>>>,
    runtime: Handle,
}

impl Device {
    /// Constructs a Device in the DISCONNECTED state. Does not open the
    /// transport; call `connect` to do that.
    pub(crate) fn new(config: DeviceConfig) -> Self {
        let device_id: Arc<str> = Arc::from(config.device_id());
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let timeout_ms = Arc::new(AtomicU64::new(config.timeout_ms));
        let last_error = Arc::new(Mutex::new(None));
        let handler = DeviceHandler {
            device_id: device_id.to_string(),
            config: config.clone(),
            transport: None,
            state: state.clone(),
            timeout_ms: timeout_ms.clone(),
            last_error: last_error.clone(),
        };
        Device {
            config: Arc::new(config),
            device_id,
            actor: IoTask::new(handler),
            state,
            timeout_ms,
            heartbeat_enabled: Arc::new(AtomicBool::new(true)),
            heartbeat_strategy: Arc::new(Mutex::new(Arc::new(DefaultHeartbeat))),
            last_error,
            runtime: Handle::current(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock().expect("device state mutex poisoned") == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("device state mutex poisoned")
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled.load(Ordering::Relaxed)
    }

    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.heartbeat_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn heartbeat_strategy(&self) -> Arc<dyn HeartbeatStrategy> {
        self.heartbeat_strategy.lock().expect("heartbeat strategy mutex poisoned").clone()
    }

    pub fn set_heartbeat_strategy(&self, strategy: Arc<dyn HeartbeatStrategy>) {
        *self.heartbeat_strategy.lock().expect("heartbeat strategy mutex poisoned") = strategy;
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().expect("last_error mutex poisoned").clone()
    }

    pub(crate) async fn connect(&self) -> crate::error::Result<()> {
        match self.actor.request(DeviceMsg::Connect).await? {
            DeviceReply::Ack => Ok(()),
            DeviceReply::Response(_) => unreachable!("Connect always replies Ack"),
        }
    }

    pub async fn disconnect(&self) -> crate::error::Result<()> {
        match self.actor.request(DeviceMsg::Disconnect).await? {
            DeviceReply::Ack => Ok(()),
            DeviceReply::Response(_) => unreachable!("Disconnect always replies Ack"),
        }
    }

    /// Closes and reopens the transport, per §4.3's `refresh()` transition.
    pub async fn refresh(&self) -> crate::error::Result<()> {
        match self.actor.request(DeviceMsg::Refresh).await? {
            DeviceReply::Ack => Ok(()),
            DeviceReply::Response(_) => unreachable!("Refresh always replies Ack"),
        }
    }

    /// Writes `bytes` (a fully-framed request) and returns the raw
    /// response, unmodified, including any Modbus exception byte.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> crate::error::Result<Vec<u8>> {
        match self.actor.request(DeviceMsg::SendRaw(bytes)).await? {
            DeviceReply::Response(resp) => Ok(resp),
            DeviceReply::Ack => unreachable!("SendRaw always replies Response"),
        }
    }

    /// Builds a request frame for `(slave, fc, addr, qty)` using the
    /// framing variant implied by this device's `DeviceKind`, then calls
    /// `send_raw`.
    pub async fn send(&self, slave: u8, fc: u8, addr: u16, qty: u16) -> crate::error::Result<Vec<u8>> {
        let bytes = match &self.config.kind {
            DeviceKind::Tcp { .. } => codec::tcp::build_request(slave, fc, addr, qty).0,
            DeviceKind::Rtu { .. } | DeviceKind::TcpRtu { .. } => codec::rtu::build_request(slave, fc, addr, qty),
        };
        self.send_raw(bytes).await
    }

    pub async fn write_single_register(&self, slave: u8, addr: u16, value: u16) -> crate::error::Result<Vec<u8>> {
        let mut pdu = vec![function_codes::WRITE_SINGLE_REGISTER];
        pdu.extend_from_slice(&addr.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        self.send_pdu(slave, pdu).await
    }

    pub async fn write_single_coil(&self, slave: u8, addr: u16, value: bool) -> crate::error::Result<Vec<u8>> {
        let mut pdu = vec![function_codes::WRITE_SINGLE_COIL];
        pdu.extend_from_slice(&addr.to_be_bytes());
        pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        self.send_pdu(slave, pdu).await
    }

    pub async fn write_multiple_registers(&self, slave: u8, addr: u16, values: &[u16]) -> crate::error::Result<Vec<u8>> {
        let mut pdu = vec![function_codes::WRITE_MULTIPLE_REGISTERS];
        pdu.extend_from_slice(&addr.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for v in values {
            pdu.extend_from_slice(&v.to_be_bytes());
        }
        self.send_pdu(slave, pdu).await
    }

    pub async fn write_multiple_coils(&self, slave: u8, addr: u16, values: &[bool]) -> crate::error::Result<Vec<u8>> {
        let mut pdu = vec![function_codes::WRITE_MULTIPLE_COILS];
        pdu.extend_from_slice(&addr.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        let byte_count = (values.len() + 7) / 8;
        pdu.push(byte_count as u8);
        let mut packed = vec![0u8; byte_count];
        for (i, v) in values.iter().enumerate() {
            if *v {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        pdu.extend_from_slice(&packed);
        self.send_pdu(slave, pdu).await
    }

    async fn send_pdu(&self, slave: u8, pdu: Vec<u8>) -> crate::error::Result<Vec<u8>> {
        let bytes = match &self.config.kind {
            DeviceKind::Tcp { .. } => codec::tcp::build_request_with_pdu(slave, &pdu)?.0,
            DeviceKind::Rtu { .. } | DeviceKind::TcpRtu { .. } => codec::rtu::build_request_with_pdu(slave, &pdu),
        };
        self.send_raw(bytes).await
    }

    /// Dispatches `send_raw` onto the ambient Tokio worker pool rather than
    /// the caller's own task, per §6's `send_raw_async`. The returned future
    /// resolves to the same `Result<Vec<u8>>` a synchronous call would —
    /// per §7, a panic or cancellation of the spawned task is folded into
    /// that single `Error`, not left as a separate `JoinError` layer the
    /// caller has to unwrap again.
    pub fn send_raw_async(
        &self,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = crate::error::Result<Vec<u8>>> {
        let device = self.clone();
        let task = self.runtime.spawn(async move { device.send_raw(bytes).await });
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(Error::internal(anyhow::anyhow!(join_err))),
            }
        }
    }

    /// Dispatches `send` onto the ambient Tokio worker pool, per §6's
    /// `send_async`. Same single-error-wrapping contract as `send_raw_async`.
    pub fn send_async(
        &self,
        slave: u8,
        fc: u8,
        addr: u16,
        qty: u16,
    ) -> impl std::future::Future<Output = crate::error::Result<Vec<u8>>> {
        let device = self.clone();
        let task = self.runtime.spawn(async move { device.send(slave, fc, addr, qty).await });
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(Error::internal(anyhow::anyhow!(join_err))),
            }
        }
    }

    /// Runs the current heartbeat strategy under the device's actor, so it
    /// is serialized with any other in-flight request exactly like §4.3
    /// requires.
    pub async fn ping(&self) -> crate::error::Result<()> {
        let strategy = self.heartbeat_strategy.lock().expect("heartbeat strategy mutex poisoned").clone();
        strategy.probe(self).await
    }
}
