use super::cluster::{ClusterState, ClusterStateStore};
use super::signals::CarbonIntensity;
use super::telemetry::GpuId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Composite fleet view pushed to dashboard observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub cluster_state: ClusterState,
    pub carbon_intensity: f64,
    pub anomalies: BTreeMap<GpuId, bool>,
    pub throttling: BTreeMap<GpuId, bool>,
}

impl DashboardSnapshot {
    pub fn new(cluster_state: ClusterState, carbon_intensity: f64, temperature_threshold_c: u32) -> Self {
        let anomalies = cluster_state
            .iter()
            .map(|(id, state)| (id.clone(), state.is_anomalous(temperature_threshold_c)))
            .collect();
        let throttling = cluster_state
            .iter()
            .map(|(id, state)| (id.clone(), state.is_throttling()))
            .collect();
        Self {
            cluster_state,
            carbon_intensity,
            anomalies,
            throttling,
        }
    }
}

/// Everything needed to build a snapshot on demand.
#[derive(Clone)]
pub struct DashboardSource {
    cluster: Arc<ClusterStateStore>,
    carbon: Arc<dyn CarbonIntensity>,
    temperature_threshold_c: u32,
}

impl DashboardSource {
    pub fn new(
        cluster: Arc<ClusterStateStore>,
        carbon: Arc<dyn CarbonIntensity>,
        temperature_threshold_c: u32,
    ) -> Self {
        Self {
            cluster,
            carbon,
            temperature_threshold_c,
        }
    }

    pub async fn snapshot(&self) -> DashboardSnapshot {
        let cluster_state = self.cluster.snapshot().await;
        DashboardSnapshot::new(
            cluster_state,
            self.carbon.current(),
            self.temperature_threshold_c,
        )
    }
}

/// Push channel to a single observer.
pub trait SnapshotSink: Send {
    fn push(
        &mut self,
        snapshot: &DashboardSnapshot,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishEnd {
    Disconnected,
    Shutdown,
}

/// Pushes a fresh snapshot to one observer every `interval`.
///
/// A failed or timed-out push ends publishing for this observer only.
pub async fn publish<S: SnapshotSink>(
    mut sink: S,
    source: DashboardSource,
    interval: Duration,
    send_timeout: Duration,
    shutdown: CancellationToken,
) -> PublishEnd {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                sink.close().await;
                return PublishEnd::Shutdown;
            }
            _ = ticker.tick() => {}
        }

        let snapshot = source.snapshot().await;
        match tokio::time::timeout(send_timeout, sink.push(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::info!("Dashboard observer disconnected: {}", e);
                return PublishEnd::Disconnected;
            }
            Err(_) => {
                tracing::warn!(
                    "Dashboard observer too slow (>{}s), dropping it",
                    send_timeout.as_secs_f32()
                );
                return PublishEnd::Disconnected;
            }
        }
    }
}
