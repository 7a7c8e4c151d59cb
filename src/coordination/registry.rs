// =============================================================================
// Registry — this instance's record in the coordination store
// =============================================================================
//
// On start the registry grants a lease, writes the instance record under it,
// and keeps both alive: every heartbeat interval it beats the lease and
// rewrites the record with a fresh `last_heartbeat`. If the lease is lost
// (store restart, partition healed after expiry), it grants a new one and
// re-registers; it never gives up while the monitor is running. Peers learn
// about departures when the dead instance's lease expires, at most one TTL
// after its last beat.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::models::InstanceInfo;

use super::{CoordinationStore, LeaseId, WatchEvent};

/// Pause before retrying after a failed re-registration.
const REREGISTER_BACKOFF: Duration = Duration::from_secs(1);

pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    root: String,
    instance_id: String,
    hostname: String,
    lease_ttl_secs: i64,
    heartbeat_interval: Duration,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    lease: Arc<Mutex<Option<LeaseId>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        root: impl Into<String>,
        instance_id: impl Into<String>,
        lease_ttl_secs: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            store,
            root: root.into().trim_end_matches('/').to_string(),
            instance_id: instance_id.into(),
            hostname,
            lease_ttl_secs,
            heartbeat_interval,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            lease: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn instances_prefix(&self) -> String {
        format!("{}/instances/", self.root)
    }

    fn key(&self) -> String {
        format!("{}{}", self.instances_prefix(), self.instance_id)
    }

    fn record(&self) -> String {
        let info = InstanceInfo {
            instance_id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        };
        serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string())
    }

    async fn register(&self) -> Result<LeaseId> {
        let lease = self.store.grant_lease(self.lease_ttl_secs).await?;
        self.store
            .put_with_lease(&self.key(), &self.record(), lease)
            .await?;
        *self.lease.lock() = Some(lease);
        Ok(lease)
    }

    /// Register and start the heartbeat task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let lease = self.register().await?;
        info!(
            instance_id = %self.instance_id,
            lease,
            ttl_secs = self.lease_ttl_secs,
            "instance registered"
        );

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            registry.heartbeat_loop().await;
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn heartbeat_loop(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
            }

            let lease = self.lease.lock().unwrap_or(0);
            let beat = async {
                self.store.keep_alive(lease).await?;
                self.store
                    .put_with_lease(&self.key(), &self.record(), lease)
                    .await
            }
            .await;

            if let Err(e) = beat {
                warn!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "heartbeat failed, re-registering"
                );
                // The lease is gone; grant a fresh one and re-register. Keep
                // trying until it works or the monitor shuts down.
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = self.register() => match result {
                            Ok(lease) => {
                                info!(instance_id = %self.instance_id, lease, "re-registered");
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "re-registration failed, retrying");
                                tokio::time::sleep(REREGISTER_BACKOFF).await;
                            }
                        }
                    }
                }
            } else {
                debug!(instance_id = %self.instance_id, "heartbeat");
            }
        }
    }

    /// Revoke the lease, which atomically removes the instance record.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            if let Err(e) = self.store.revoke_lease(lease).await {
                warn!(instance_id = %self.instance_id, error = %e, "lease revoke failed");
            }
        }
        info!(instance_id = %self.instance_id, "instance deregistered");
    }

    /// Stream of live instance-ID sets: the current membership first, then a
    /// new set on every change under the prefix.
    pub async fn watch_instances(&self) -> Result<mpsc::Receiver<BTreeSet<String>>> {
        let prefix = self.instances_prefix();
        let mut events = self.store.watch_prefix(&prefix).await?;

        let mut current: BTreeSet<String> = self
            .store
            .get_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|(key, _)| {
                key.strip_prefix(&prefix).map(|id| id.to_string())
            })
            .collect();

        let (tx, rx) = mpsc::channel(16);
        let _ = tx.send(current.clone()).await;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                let changed = match &event {
                    WatchEvent::Put { key, .. } => key
                        .strip_prefix(&prefix)
                        .map(|id| current.insert(id.to_string()))
                        .unwrap_or(false),
                    WatchEvent::Delete { key } => key
                        .strip_prefix(&prefix)
                        .map(|id| current.remove(id))
                        .unwrap_or(false),
                };

                if changed && tx.send(current.clone()).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> Arc<Registry> {
        Arc::new(Registry::new(
            store,
            "/test",
            "node-1",
            2,
            Duration::from_millis(500),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn start_registers_and_stop_removes() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());

        reg.start().await.unwrap();
        let keys = store.get_prefix("/test/instances/").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0, "/test/instances/node-1");

        let info: InstanceInfo = serde_json::from_str(&keys[0].1).unwrap();
        assert_eq!(info.instance_id, "node-1");

        reg.stop().await;
        assert!(store.get_prefix("/test/instances/").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_record_alive_past_ttl() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        reg.start().await.unwrap();

        // Well past the 2 s lease TTL; heartbeats every 500 ms keep it alive.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get_prefix("/test/instances/").await.unwrap().len(), 1);

        reg.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_triggers_re_registration() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        reg.start().await.unwrap();

        // Simulate the store dropping our lease (e.g. healed partition after
        // expiry).
        for lease in store.active_leases() {
            store.revoke_lease(lease).await.unwrap();
        }
        assert!(store.get_prefix("/test/instances/").await.unwrap().is_empty());

        // Next heartbeat notices and re-registers.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get_prefix("/test/instances/").await.unwrap().len(), 1);

        reg.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watch_emits_current_set_then_changes() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        reg.start().await.unwrap();

        let mut watch = reg.watch_instances().await.unwrap();
        let first = watch.recv().await.unwrap();
        assert!(first.contains("node-1"));

        // A peer joins.
        let lease = store.grant_lease(60).await.unwrap();
        store
            .put_with_lease("/test/instances/node-2", "{}", lease)
            .await
            .unwrap();

        let next = watch.recv().await.unwrap();
        assert!(next.contains("node-1") && next.contains("node-2"));

        // The peer's lease disappears.
        store.revoke_lease(lease).await.unwrap();
        let last = watch.recv().await.unwrap();
        assert!(!last.contains("node-2"));

        reg.stop().await;
    }
}
