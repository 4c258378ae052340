use super::telemetry::{GpuId, GpuState};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Owned copy of the fleet view, keyed by GPU identifier.
pub type ClusterState = BTreeMap<GpuId, GpuState>;

#[derive(Debug, Clone)]
struct Entry {
    state: GpuState,
    last_seen: Instant,
}

/// Latest known state per GPU, shared by ingestion, scheduling and the dashboard.
///
/// A single coarse lock guards the map. Readers always receive an owned copy,
/// so no lock is held by callers once a snapshot method returns.
#[derive(Debug, Default)]
pub struct ClusterStateStore {
    entries: RwLock<HashMap<GpuId, Entry>>,
}

impl ClusterStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the entry for `gpu_id` (last write wins).
    pub async fn update(&self, gpu_id: GpuId, state: GpuState) {
        let entry = Entry {
            state,
            last_seen: Instant::now(),
        };
        self.entries.write().await.insert(gpu_id, entry);
    }

    /// Every known GPU, stale or not.
    pub async fn snapshot(&self) -> ClusterState {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    /// GPUs that reported within `stale_after`; `None` keeps every entry.
    pub async fn fresh_snapshot(&self, stale_after: Option<Duration>) -> ClusterState {
        let Some(stale_after) = stale_after else {
            return self.snapshot().await;
        };

        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() <= stale_after)
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
