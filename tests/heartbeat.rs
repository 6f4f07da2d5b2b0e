mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modbus_master::device::{DeviceConfig, DeviceKind};
use modbus_master::{Client, EventKind};
use support::FlappingMbapServer;

fn tcp_config(addr: std::net::SocketAddr, timeout_ms: u64) -> DeviceConfig {
    DeviceConfig::new(DeviceKind::Tcp { ip: addr.ip().to_string(), port: addr.port() }, timeout_ms).unwrap()
}

/// Scenario 4: a persistent device survives an outage and is recovered once
/// the simulator comes back, then is actually evicted once unmarked and the
/// simulator goes down again. The supervisor's persistent retry backoff is a
/// fixed 10s per §4.5, so the wait budgets here are sized around that rather
/// than the shorter numbers in spec.md's illustrative scenario text.
#[tokio::test]
async fn persistent_device_survives_outage_and_recovers() {
    let sim = FlappingMbapServer::start(1).await;
    let client = Client::new();
    let device = client.connect_device(tcp_config(sim.addr, 300)).await.unwrap();
    let id = device.device_id().to_string();
    client.mark_persistent(&id);

    let recovered = Arc::new(AtomicUsize::new(0));
    let recovered2 = recovered.clone();
    client.subscribe(move |ev| {
        if ev.kind == EventKind::Recovered {
            recovered2.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.start_heartbeat(1);

    sim.kill().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.get_device(&id).is_some(), "persistent device must survive the outage");

    sim.revive().await;
    tokio::time::sleep(Duration::from_secs(13)).await;
    assert!(client.get_device(&id).unwrap().is_connected(), "device should reconnect once the simulator is back");
    assert!(recovered.load(Ordering::SeqCst) >= 1);

    client.unmark_persistent(&id);
    sim.kill().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client.get_device(&id).is_none(), "ephemeral device must be evicted after the next failed ping");

    client.stop_heartbeat();
}

/// Scenario 5: a device with heartbeat disabled is never probed, so an
/// outage never reaches the failure handler and never evicts it; re-enabling
/// makes the very next tick observe the failure and evict it immediately
/// (ephemeral devices are removed on the first failed refresh, no backoff).
#[tokio::test]
async fn disabling_heartbeat_protects_an_ephemeral_device_from_eviction() {
    let sim = FlappingMbapServer::start(1).await;
    let client = Client::new();
    let device = client.connect_device(tcp_config(sim.addr, 300)).await.unwrap();
    let id = device.device_id().to_string();
    device.set_heartbeat_enabled(false);

    client.start_heartbeat(1);
    sim.kill().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client.get_device(&id).is_some(), "heartbeat-disabled device must not be evicted");

    device.set_heartbeat_enabled(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client.get_device(&id).is_none(), "re-enabled heartbeat must evict the still-dead device");

    client.stop_heartbeat();
}

#[tokio::test]
async fn stop_heartbeat_is_idempotent_and_start_is_idempotent() {
    let client = Client::new();
    client.start_heartbeat(1);
    client.start_heartbeat(1); // second call is a no-op, does not replace the scheduler
    client.stop_heartbeat();
    client.stop_heartbeat(); // stopping twice must not panic
}
