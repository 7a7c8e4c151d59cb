// =============================================================================
// etcd-backed coordination store
// =============================================================================

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{IoContext, MonitorError, Result};

use super::{CoordinationStore, LeaseId, WatchEvent};

/// Coordination store over an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured endpoints. A refusal here is fatal: the
    /// operator selected distributed mode, so running without coordination
    /// would double-assign every workload.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(|e| {
            MonitorError::Startup(format!(
                "cannot reach coordination store at {endpoints:?}: {e}"
            ))
        })?;
        debug!(?endpoints, "coordination store connected");
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl_secs, None)
            .await
            .transient("granting lease")?;
        Ok(lease.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .transient("opening keepalive stream")?;
        keeper.keep_alive().await.transient("sending keepalive")?;

        match stream.message().await.transient("reading keepalive ack")? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            Some(_) => Err(MonitorError::transient(
                "keepalive",
                anyhow::anyhow!("lease {lease} expired"),
            )),
            None => Err(MonitorError::transient(
                "keepalive",
                anyhow::anyhow!("keepalive stream closed"),
            )),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .transient("revoking lease")?;
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .transient("writing leased key")?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .transient("reading prefix")?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().transient("decoding key")?;
            let value = kv.value_str().transient("decoding value")?;
            pairs.push((key.to_string(), value.to_string()));
        }
        Ok(pairs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .transient("opening prefix watch")?;

        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Keep the watcher alive for the stream's lifetime.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            let converted = match event.event_type() {
                                EventType::Put => WatchEvent::Put {
                                    key: key.to_string(),
                                    value: kv.value_str().unwrap_or_default().to_string(),
                                },
                                EventType::Delete => WatchEvent::Delete {
                                    key: key.to_string(),
                                },
                            };
                            if tx.send(converted).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(prefix = %prefix, "watch stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "watch stream error");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
