//! In-process Modbus slave simulators for integration tests. Not part of
//! the library's public API — out of scope per spec (embedded test
//! simulators are an external collaborator), but useful enough to keep
//! local to the test suite.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Tracks every spawned task belonging to a simulator (the acceptor plus
/// one per accepted connection) so the whole thing can be torn down at
/// once. Aborting a parent task does not cascade to children it spawned,
/// so a simulator that wants to actually sever established connections
/// (not just stop accepting new ones) has to hold and abort their handles
/// itself.
#[derive(Clone, Default)]
struct ConnectionTracker {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }

    /// Aborts every tracked connection task, dropping the sockets they
    /// hold. Clears the list so a later `revive` starts from empty.
    fn abort_all(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// A Modbus TCP (MBAP) slave that answers FC 0x03 reads of 1 register with
/// a fixed value, echoing the request's transaction id and unit id.
pub struct MbapEchoServer {
    pub addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
    connections: ConnectionTracker,
}

impl MbapEchoServer {
    pub async fn start(register_value: u16) -> Self {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind simulator listener");
        let addr = listener.local_addr().expect("simulator local addr");
        let connections = ConnectionTracker::default();
        let accept_task = spawn_mbap_acceptor(listener, register_value, connections.clone());
        MbapEchoServer { addr, accept_task, connections }
    }

    /// Stops accepting new connections and severs every connection already
    /// established, so a `Device` holding one of them observes a broken
    /// transport on its next read or write.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.connections.abort_all();
    }
}

fn spawn_mbap_acceptor(listener: TcpListener, register_value: u16, connections: ConnectionTracker) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(x) => x,
                Err(_) => break,
            };
            let handle = tokio::spawn(serve_mbap_connection(socket, register_value));
            connections.track(handle);
        }
    })
}

async fn serve_mbap_connection(mut socket: TcpStream, register_value: u16) {
    loop {
        let mut header = [0u8; 7];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let tid = [header[0], header[1]];
        let len = u16::from_be_bytes([header[4], header[5]]);
        let unit = header[6];
        if len == 0 {
            return;
        }
        let mut pdu = vec![0u8; (len - 1) as usize];
        if socket.read_exact(&mut pdu).await.is_err() {
            return;
        }
        if pdu.first() != Some(&0x03) {
            continue;
        }
        let mut response = Vec::with_capacity(11);
        response.extend_from_slice(&tid);
        response.extend_from_slice(&[0, 0]);
        response.extend_from_slice(&5u16.to_be_bytes());
        response.push(unit);
        response.push(0x03);
        response.push(2);
        response.extend_from_slice(&register_value.to_be_bytes());
        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// A raw RTU slave carried over a TCP socket (simulating the TCP_RTU
/// device kind, or a Modbus gateway). Answers FC 0x03 reads of 1 register.
pub struct RtuOverTcpEchoServer {
    pub addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
    connections: ConnectionTracker,
}

impl RtuOverTcpEchoServer {
    pub async fn start(register_value: u16) -> Self {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind simulator listener");
        let addr = listener.local_addr().expect("simulator local addr");
        let connections = ConnectionTracker::default();
        let connections_for_acceptor = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => break,
                };
                let handle = tokio::spawn(serve_rtu_connection(socket, register_value));
                connections_for_acceptor.track(handle);
            }
        });
        RtuOverTcpEchoServer { addr, accept_task, connections }
    }

    pub fn stop(&self) {
        self.accept_task.abort();
        self.connections.abort_all();
    }
}

async fn serve_rtu_connection(mut socket: TcpStream, register_value: u16) {
    loop {
        // Fixed-size read-request frame: slave(1) fc(1) addr(2) qty(2) crc(2).
        let mut frame = [0u8; 8];
        if socket.read_exact(&mut frame).await.is_err() {
            return;
        }
        if frame[1] != 0x03 {
            continue;
        }
        let slave = frame[0];
        let mut response = vec![slave, 0x03, 0x02];
        response.extend_from_slice(&register_value.to_be_bytes());
        let crc = modbus_master::codec::crc::crc16(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// Accepts connections and never reads or writes anything, for exercising
/// timeouts against an unresponsive peer.
pub struct SilentServer {
    pub addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind silent listener");
        let addr = listener.local_addr().expect("silent local addr");
        let accept_task = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => held.push(socket),
                    Err(_) => break,
                }
            }
        });
        SilentServer { addr, accept_task }
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

/// A Modbus TCP slave that can be killed (stop listening for new
/// connections *and* sever every connection already established) and
/// revived (rebind the same port and resume answering) to simulate the
/// outage/restart cycle the persistent-reconnect scenario exercises.
/// Holding the original `SocketAddr` across a kill lets the test reconnect
/// to the exact same `device_id`. A `Device` holds one long-lived
/// connection for its lifetime and reuses it across pings, so killing only
/// the acceptor would leave that connection being served forever — `kill`
/// aborts the tracked per-connection tasks too, so the socket it's
/// actually talking to breaks.
pub struct FlappingMbapServer {
    pub addr: std::net::SocketAddr,
    register_value: u16,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    connections: ConnectionTracker,
}

impl FlappingMbapServer {
    pub async fn start(register_value: u16) -> Self {
        let _ = env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind flapping listener");
        let addr = listener.local_addr().expect("flapping local addr");
        let connections = ConnectionTracker::default();
        let accept_task = spawn_flapping_acceptor(listener, register_value, connections.clone());
        FlappingMbapServer {
            addr,
            register_value,
            accept_task: tokio::sync::Mutex::new(Some(accept_task)),
            connections,
        }
    }

    /// Stops accepting new connections and drops every connection already
    /// established, so any device's in-flight or next ping observes a
    /// broken transport. The OS also refuses new connect attempts against
    /// `addr` until `revive` is called.
    pub async fn kill(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        self.connections.abort_all();
    }

    /// Rebinds the same address and resumes answering reads.
    pub async fn revive(&self) {
        let listener = TcpListener::bind(self.addr).await.expect("rebind flapping listener");
        let task = spawn_flapping_acceptor(listener, self.register_value, self.connections.clone());
        *self.accept_task.lock().await = Some(task);
    }

    pub async fn stop(&self) {
        self.kill().await;
    }
}

fn spawn_flapping_acceptor(listener: TcpListener, register_value: u16, connections: ConnectionTracker) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(x) => x,
                Err(_) => break,
            };
            let handle = tokio::spawn(serve_mbap_connection(socket, register_value));
            connections.track(handle);
        }
    })
}
