//! The connection-pool supervisor: owns the device registry and the
//! persistent-device set, runs the periodic heartbeat scheduler, and
//! drives the failure handler's persistent-vs-ephemeral reconnect policy.
//!
//! Grounded in `raffber-comsrv/comsrv/src/inventory.rs` (registry shape)
//! and `comsrv/src/app.rs` (owning one registry per instrument kind,
//! collapsed here to a single registry since this crate's `Device` already
//! covers every `DeviceKind`), with the registry itself switched from the
//! teacher's `Mutex<HashMap>` to `DashMap`/`DashSet` per the concurrent
//! associative container called for in §9's redesign notes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;

use crate::device::{Device, DeviceConfig};
use crate::error::Error;
use crate::events::{Event, EventBus, EventKind};

const PERSISTENT_RETRY_BACKOFF: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Owns the device pool. Cheap to clone: every clone shares the same
/// registry, persistent set, and event bus.
#[derive(Clone)]
pub struct Client {
    registry: Arc<DashMap<String, Device>>,
    persistent: Arc<DashSet<String>>,
    events: Arc<EventBus>,
    heartbeat_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Client {
            registry: Arc::new(DashMap::new()),
            persistent: Arc::new(DashSet::new()),
            events: Arc::new(EventBus::new()),
            heartbeat_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(listener);
    }

    /// Connects (or reconnects) the device named by `config.device_id()`.
    /// The registry's `entry` API makes the check-or-register step atomic,
    /// so concurrent callers for the same id always converge on one
    /// `Device` (I1): at most one entry per id, ever.
    pub async fn connect_device(&self, config: DeviceConfig) -> crate::error::Result<Device> {
        let id = config.device_id();
        let (device, newly_registered) = match self.registry.entry(id.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let device = Device::new(config);
                e.insert(device.clone());
                (device, true)
            }
        };
        if device.is_connected() {
            return Ok(device);
        }
        device.refresh().await?;
        let kind = if newly_registered { EventKind::Connected } else { EventKind::Recovered };
        self.events.publish(Event::new(kind, id, Some(device.clone())));
        Ok(device)
    }

    /// Atomically removes `id` from both the registry and the persistent
    /// set, then disconnects the removed device. A no-op if `id` was not
    /// registered (R2).
    pub async fn disconnect_device(&self, id: &str) -> crate::error::Result<()> {
        self.persistent.remove(id);
        if let Some((_, device)) = self.registry.remove(id) {
            device.disconnect().await?;
            self.events.publish(Event::new(EventKind::Disconnected, id.to_string(), Some(device)));
        }
        Ok(())
    }

    /// Fans out to the ambient worker pool; a single config's failure to
    /// connect does not abort its siblings.
    pub async fn batch_connect(&self, configs: Vec<DeviceConfig>) -> Vec<crate::error::Result<Device>> {
        let tasks: Vec<_> = configs
            .into_iter()
            .map(|config| {
                let client = self.clone();
                tokio::spawn(async move { client.connect_device(config).await })
            })
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    log::error!("batch_connect task panicked: {}", join_err);
                    Err(Error::internal(anyhow::anyhow!(join_err)))
                }
            });
        }
        results
    }

    pub async fn batch_disconnect(&self, ids: Vec<String>) -> Vec<crate::error::Result<()>> {
        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let client = self.clone();
                tokio::spawn(async move { client.disconnect_device(&id).await })
            })
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    log::error!("batch_disconnect task panicked: {}", join_err);
                    Err(Error::internal(anyhow::anyhow!(join_err)))
                }
            });
        }
        results
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.registry.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot copy of every currently-connected device. Iteration
    /// tolerates concurrent registry mutation (DashMap's shard-local
    /// locking), per §3's Registry invariant.
    pub fn connected_devices(&self) -> Vec<Device> {
        self.registry
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|device| device.is_connected())
            .collect()
    }

    pub fn mark_persistent(&self, id: &str) {
        self.persistent.insert(id.to_string());
    }

    pub fn unmark_persistent(&self, id: &str) {
        self.persistent.remove(id);
    }

    pub fn is_persistent(&self, id: &str) -> bool {
        self.persistent.contains(id)
    }

    /// Idempotent: a second call while a scheduler is already running is a
    /// no-op.
    pub fn start_heartbeat(&self, interval_s: u64) {
        let mut guard = self.heartbeat_task.lock().expect("heartbeat mutex poisoned");
        if guard.is_some() {
            return;
        }
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
            loop {
                ticker.tick().await;
                for entry in client.registry.iter() {
                    let id = entry.key().clone();
                    let device = entry.value().clone();
                    if !device.heartbeat_enabled() {
                        continue;
                    }
                    let client = client.clone();
                    // Each device's ping is its own task so a slow or hung
                    // probe on one device never delays another's.
                    tokio::spawn(async move {
                        if let Err(e) = device.ping().await {
                            log::warn!("heartbeat ping failed for {}: {}", id, e);
                            client.events.publish(Event::new(EventKind::PingFailed, id.clone(), Some(device.clone())));
                            client.handle_ping_failure(id, device).await;
                        }
                    });
                }
            }
        });
        *guard = Some(handle);
    }

    /// Cancels the periodic scheduler. Pings and failure handlers already
    /// dispatched are allowed to run to completion; they become no-ops if
    /// their device has since left the registry.
    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().expect("heartbeat mutex poisoned").take() {
            handle.abort();
        }
    }

    /// §4.5's failure handler: alternates `refresh()` attempts with a 10s
    /// backoff for persistent devices, and a one-shot removal for
    /// ephemeral ones. Re-checks registry membership every iteration so a
    /// concurrent `disconnect_device` makes this a no-op rather than a
    /// race.
    async fn handle_ping_failure(&self, id: String, device: Device) {
        loop {
            if self.registry.get(&id).is_none() {
                return;
            }
            let is_persistent = self.persistent.contains(&id);
            match device.refresh().await {
                Ok(()) => {
                    self.events.publish(Event::new(EventKind::Recovered, id, Some(device)));
                    return;
                }
                Err(_) if !is_persistent => {
                    self.registry.remove(&id);
                    self.events.publish(Event::new(EventKind::Removed, id, Some(device)));
                    return;
                }
                Err(_) => {
                    tokio::time::sleep(PERSISTENT_RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Stops the heartbeat, disconnects every registered device, and
    /// returns once that settles or `SHUTDOWN_GRACE_PERIOD` elapses,
    /// whichever comes first. The ambient runtime is shared process-wide,
    /// so "forcibly cancelled" means shutdown stops waiting on stragglers,
    /// not that their tasks are killed out from under them.
    pub async fn shutdown(&self) {
        self.stop_heartbeat();
        let ids: Vec<String> = self.registry.iter().map(|entry| entry.key().clone()).collect();
        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, self.batch_disconnect(ids)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        log::warn!("error disconnecting device during shutdown: {}", e);
                    }
                }
            }
            Err(_) => {
                log::warn!("shutdown grace period elapsed with devices still disconnecting");
            }
        }
    }

    /// Number of registered devices, regardless of connection state.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}
