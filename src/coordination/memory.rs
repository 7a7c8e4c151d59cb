// =============================================================================
// In-memory coordination store
// =============================================================================
//
// Same contract as the etcd store, in-process: leases expire for real (on
// tokio time, so paused-clock tests control expiry), and watchers see puts,
// deletes, and lease-expiry deletes. Used by the test suite and by embedded
// single-process deployments that still want the registry machinery.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{MonitorError, Result};

use super::{CoordinationStore, LeaseId, WatchEvent};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    kv: BTreeMap<String, (String, LeaseId)>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn notify(&mut self, event: &WatchEvent) {
        let key = match event {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key.clone(),
        };
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            // Dropped receivers unregister themselves here.
            w.tx.try_send(event.clone()).is_ok() || !w.tx.is_closed()
        });
    }

    /// Remove expired leases and their keys, notifying watchers.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            self.drop_lease(lease);
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let doomed: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, (_, l))| *l == lease)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.kv.remove(&key);
            self.notify(&WatchEvent::Delete { key });
        }
    }
}

/// In-process coordination store with real lease expiry.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Must be created inside a tokio runtime; a background sweeper enforces
    /// lease TTLs.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let sweeper = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = sweeper.upgrade() else { return };
                inner.lock().sweep(Instant::now());
            }
        });
        Self { inner }
    }

    /// Leases currently alive. Diagnostic surface, also used by tests to
    /// simulate partitions.
    pub fn active_leases(&self) -> Vec<LeaseId> {
        let mut inner = self.inner.lock();
        inner.sweep(Instant::now());
        inner.leases.keys().copied().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(MonitorError::Semantic(format!(
                "lease ttl must be positive, got {ttl_secs}"
            )));
        }
        let ttl = Duration::from_secs(ttl_secs as u64);
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sweep(Instant::now());
        match inner.leases.get_mut(&lease) {
            Some(entry) => {
                entry.expires_at = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(MonitorError::transient(
                "keepalive",
                anyhow::anyhow!("lease {lease} expired"),
            )),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.inner.lock().drop_lease(lease);
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sweep(Instant::now());
        if !inner.leases.contains_key(&lease) {
            return Err(MonitorError::transient(
                "leased put",
                anyhow::anyhow!("lease {lease} expired"),
            ));
        }
        inner.kv.insert(key.to_string(), (value.to_string(), lease));
        inner.notify(&WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut inner = self.inner.lock();
        inner.sweep(Instant::now());
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put_with_lease("/t/instances/a", "{}", lease).await.unwrap();

        assert_eq!(store.get_prefix("/t/instances/").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.get_prefix("/t/instances/").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_extends_the_lease() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put_with_lease("/t/instances/a", "{}", lease).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            store.keep_alive(lease).await.unwrap();
        }
        assert_eq!(store.get_prefix("/t/instances/").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_on_expired_lease_fails() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.keep_alive(lease).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_sees_puts_and_lease_expiry_deletes() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/t/instances/").await.unwrap();

        let lease = store.grant_lease(1).await.unwrap();
        store.put_with_lease("/t/instances/a", "{}", lease).await.unwrap();

        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::Put {
                key: "/t/instances/a".into(),
                value: "{}".into()
            }
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::Delete {
                key: "/t/instances/a".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_removes_keys_atomically() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(60).await.unwrap();
        store.put_with_lease("/t/instances/a", "{}", lease).await.unwrap();
        store.put_with_lease("/t/instances/b", "{}", lease).await.unwrap();

        store.revoke_lease(lease).await.unwrap();
        assert!(store.get_prefix("/t/").await.unwrap().is_empty());
        assert!(store.active_leases().is_empty());
    }
}
