// =============================================================================
// Coordinator — consistent-hash sharding of workloads over live instances
// =============================================================================
//
// Ownership of a workload ID is `instances[fnv1a(id) mod N]` over the sorted
// live-instance list. The list is replaced atomically whenever the registry's
// watch stream reports a membership change, and a single-slot token channel
// tells subscribers to recheck their work; consecutive changes may coalesce
// into one token, which is all a rescan needs.
// =============================================================================

use std::collections::BTreeSet;
use std::hash::Hasher;

use fnv::FnvHasher;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Decides which workloads this instance owns.
pub trait Sharder: Send + Sync {
    /// Whether this instance owns the given workload.
    fn owns(&self, workload: Uuid) -> bool;

    /// Filter a candidate list down to the owned subset.
    fn assigned_from(&self, workloads: &[Uuid]) -> Vec<Uuid> {
        workloads.iter().copied().filter(|w| self.owns(*w)).collect()
    }

    /// A receiver that yields one token per membership change. Tokens
    /// coalesce; receipt means "recheck your assignments now".
    fn subscribe(&self) -> mpsc::Receiver<()>;
}

/// Stable 64-bit FNV-1a over the workload key.
fn hash_key(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

pub struct Coordinator {
    self_id: String,
    /// Sorted live-instance IDs. Replaced wholesale on membership changes.
    instances: RwLock<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        Self {
            instances: RwLock::new(vec![self_id.clone()]),
            self_id,
            subscribers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Consume the registry's membership stream.
    pub fn start(self: &std::sync::Arc<Self>, mut watch: mpsc::Receiver<BTreeSet<String>>) {
        let coordinator = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let members = tokio::select! {
                    _ = coordinator.cancel.cancelled() => return,
                    members = watch.recv() => match members {
                        Some(members) => members,
                        None => return,
                    },
                };
                coordinator.set_instances(members);
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Replace the instance list. Signals subscribers only on a real change.
    pub fn set_instances(&self, members: BTreeSet<String>) {
        let sorted: Vec<String> = members.into_iter().collect();
        {
            let mut current = self.instances.write();
            if *current == sorted {
                return;
            }
            info!(
                instances = ?sorted,
                self_id = %self.self_id,
                "instance membership changed"
            );
            *current = sorted;
        }

        // Non-blocking token per subscriber; a full slot means a recheck is
        // already pending, which is enough.
        let subscribers = self.subscribers.lock();
        for tx in subscribers.iter() {
            if tx.try_send(()).is_err() {
                debug!("assignment-change token coalesced");
            }
        }
    }

    pub fn instances(&self) -> Vec<String> {
        self.instances.read().clone()
    }

    /// The instance that owns a workload key, or `None` while the membership
    /// set is empty.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        let instances = self.instances.read();
        match instances.len() {
            0 => None,
            1 => Some(instances[0].clone()),
            n => {
                let index = (hash_key(key) % n as u64) as usize;
                Some(instances[index].clone())
            }
        }
    }

    pub fn owns_key(&self, key: &str) -> bool {
        self.owner_of(key).as_deref() == Some(self.self_id.as_str())
    }
}

impl Sharder for Coordinator {
    fn owns(&self, workload: Uuid) -> bool {
        self.owns_key(&workload.to_string())
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Sharder stub for single-instance mode: owns everything, never signals.
pub struct SingleInstance {
    // Held so subscribers' receivers stay open for the monitor's lifetime.
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl SingleInstance {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SingleInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl Sharder for SingleInstance {
    fn owns(&self, _workload: Uuid) -> bool {
        true
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn coordinator(self_id: &str, ids: &[&str]) -> Coordinator {
        let c = Coordinator::new(self_id);
        c.set_instances(members(ids));
        c
    }

    #[test]
    fn exactly_one_instance_owns_each_workload() {
        let ids = ["a", "b", "c"];
        let coordinators: Vec<Coordinator> =
            ids.iter().map(|id| coordinator(id, &ids)).collect();

        for _ in 0..300 {
            let workload = Uuid::new_v4();
            let owners = coordinators.iter().filter(|c| c.owns(workload)).count();
            assert_eq!(owners, 1, "workload {workload} owned by {owners} instances");
        }
    }

    #[test]
    fn ownership_is_evenly_distributed() {
        let ids = ["a", "b", "c"];
        let coordinators: Vec<Coordinator> =
            ids.iter().map(|id| coordinator(id, &ids)).collect();

        let mut counts = [0usize; 3];
        for _ in 0..300 {
            let workload = Uuid::new_v4();
            for (i, c) in coordinators.iter().enumerate() {
                if c.owns(workload) {
                    counts[i] += 1;
                }
            }
        }

        for (i, count) in counts.iter().enumerate() {
            assert!(
                (70..=130).contains(count),
                "instance {} owns {} of 300",
                ids[i],
                count
            );
        }
    }

    #[test]
    fn ownership_follows_hash_mod_membership() {
        let c = coordinator("a", &["a", "b"]);
        let expected_index = (hash_key("bot-xyz") % 2) as usize;
        let expected = ["a", "b"][expected_index];
        assert_eq!(c.owner_of("bot-xyz").as_deref(), Some(expected));

        // Adding an instance re-evaluates against the sorted triple.
        c.set_instances(members(&["a", "b", "c"]));
        let expected_index = (hash_key("bot-xyz") % 3) as usize;
        let expected = ["a", "b", "c"][expected_index];
        assert_eq!(c.owner_of("bot-xyz").as_deref(), Some(expected));
    }

    #[test]
    fn membership_change_remains_a_partition() {
        // Ownership stays a partition across a membership change, and the
        // reassigned fraction matches the modulus model (roughly 3/4 when
        // going from three to four instances).
        let before = coordinator("a", &["a", "b", "c"]);
        let after = coordinator("a", &["a", "b", "c", "d"]);

        let keys: Vec<String> = (0..400).map(|i| format!("workload-{i}")).collect();
        let moved = keys
            .iter()
            .filter(|k| before.owner_of(k) != after.owner_of(k))
            .count();

        assert!(moved > 0, "membership change must move some workloads");
        let fraction = moved as f64 / keys.len() as f64;
        assert!(
            (0.45..=0.95).contains(&fraction),
            "moved fraction {fraction} out of expected band"
        );
    }

    #[test]
    fn empty_membership_owns_nothing() {
        let c = Coordinator::new("a");
        c.set_instances(BTreeSet::new());
        assert_eq!(c.owner_of("anything"), None);
        assert!(!c.owns(Uuid::new_v4()));
    }

    #[test]
    fn singleton_owns_everything_without_hashing() {
        let c = coordinator("only", &["only"]);
        for _ in 0..10 {
            assert!(c.owns(Uuid::new_v4()));
        }
    }

    #[test]
    fn assigned_from_filters_to_owned() {
        let ids = ["a", "b", "c"];
        let coordinators: Vec<Coordinator> =
            ids.iter().map(|id| coordinator(id, &ids)).collect();

        let workloads: Vec<Uuid> = (0..90).map(|_| Uuid::new_v4()).collect();
        let total: usize = coordinators
            .iter()
            .map(|c| c.assigned_from(&workloads).len())
            .sum();
        assert_eq!(total, workloads.len());
    }

    #[tokio::test]
    async fn change_tokens_are_single_slot() {
        let c = Coordinator::new("a");
        let mut rx = c.subscribe();

        // Several changes before the subscriber drains: they coalesce.
        c.set_instances(members(&["a", "b"]));
        c.set_instances(members(&["a", "b", "c"]));
        c.set_instances(members(&["a"]));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // An unchanged set emits nothing.
        c.set_instances(members(&["a"]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_instance_stub_owns_all() {
        let stub = SingleInstance::new();
        let mut rx = stub.subscribe();
        assert!(stub.owns(Uuid::new_v4()));
        assert!(rx.try_recv().is_err());
    }
}
