mod support;

use modbus_master::device::{DeviceConfig, DeviceKind};
use modbus_master::Client;
use support::RtuOverTcpEchoServer;

fn tcp_rtu_config(addr: std::net::SocketAddr, timeout_ms: u64) -> DeviceConfig {
    DeviceConfig::new(DeviceKind::TcpRtu { ip: addr.ip().to_string(), port: addr.port() }, timeout_ms).unwrap()
}

#[tokio::test]
async fn reads_holding_register_over_rtu_framing() {
    let sim = RtuOverTcpEchoServer::start(1).await;
    let client = Client::new();
    let device = client.connect_device(tcp_rtu_config(sim.addr, 500)).await.unwrap();

    let response = device.send(1, 0x03, 0, 1).await.unwrap();

    // Slave | FC | ByteCount | Data(2) | CRC(2) — 7 bytes total, per §6.
    assert_eq!(response.len(), 7);
    assert_eq!(response[0], 1);
    assert_eq!(response[1], 0x03);
    assert_eq!(response[2], 2);
    assert_eq!(&response[3..5], &1u16.to_be_bytes());
    assert!(modbus_master::codec::crc::validate(&response));
    sim.stop();
}

#[tokio::test]
async fn device_id_distinguishes_tcp_rtu_from_plain_tcp() {
    let sim = RtuOverTcpEchoServer::start(1).await;
    let device_id = tcp_rtu_config(sim.addr, 500).device_id();
    assert!(device_id.starts_with("TCP_RTU:"));
    sim.stop();
}
