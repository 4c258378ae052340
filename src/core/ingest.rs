use super::cluster::ClusterStateStore;
use super::error::DecodeError;
use super::signals::AnomalyDetector;
use super::store::TelemetrySink;
use super::telemetry::DecodedTelemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Turns raw telemetry messages into durable rows and cluster state.
///
/// Messages are independent: no ordering across GPUs, no deduplication.
pub struct Ingestor<S, D> {
    cluster: Arc<ClusterStateStore>,
    sink: Arc<S>,
    detector: Option<Arc<D>>,
}

impl<S, D> Clone for Ingestor<S, D> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            sink: Arc::clone(&self.sink),
            detector: self.detector.clone(),
        }
    }
}

impl<S, D> Ingestor<S, D>
where
    S: TelemetrySink + 'static,
    D: AnomalyDetector + 'static,
{
    pub fn new(cluster: Arc<ClusterStateStore>, sink: Arc<S>, detector: Option<Arc<D>>) -> Self {
        Self {
            cluster,
            sink,
            detector,
        }
    }

    /// Handles one message received on `subject`, waiting for the durable write.
    pub async fn ingest(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Result<DecodedTelemetry, DecodeError> {
        let telemetry = self.observe(subject, payload).await?;
        self.persist(telemetry.clone(), Utc::now()).await;
        Ok(telemetry)
    }

    /// Applies the message to cluster state now and persists it in the
    /// background.
    ///
    /// Callers must invoke this in arrival order: the state update happens
    /// before returning, so a slow write never lets an older sample replace
    /// a newer one.
    pub async fn ingest_detached(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Result<JoinHandle<()>, DecodeError> {
        let received_at = Utc::now();
        let telemetry = self.observe(subject, payload).await?;
        let ingestor = self.clone();
        Ok(tokio::spawn(async move {
            ingestor.persist(telemetry, received_at).await;
        }))
    }

    /// Decodes the message and records it as the GPU's latest state.
    ///
    /// A malformed message is logged and dropped.
    pub async fn observe(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Result<DecodedTelemetry, DecodeError> {
        let telemetry = match DecodedTelemetry::decode(subject, payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Dropping telemetry on {}: {}", subject, e);
                return Err(e);
            }
        };

        self.cluster
            .update(telemetry.gpu_id.clone(), telemetry.state())
            .await;
        tracing::debug!("Ingested telemetry for {}", telemetry.gpu_id);
        Ok(telemetry)
    }

    /// Appends the sample to the durable store and starts the anomaly check.
    /// A failed write is logged only.
    pub async fn persist(&self, telemetry: DecodedTelemetry, received_at: DateTime<Utc>) {
        if let Err(e) = self.sink.append(&telemetry, received_at).await {
            tracing::error!(
                "Failed to persist telemetry for {}: {}",
                telemetry.gpu_id,
                e
            );
        }

        if let Some(detector) = &self.detector {
            let detector = Arc::clone(detector);
            tokio::spawn(async move {
                match detector.check(&telemetry).await {
                    Ok(true) => tracing::warn!(
                        gpu = %telemetry.gpu_id,
                        temperature_c = telemetry.sample.temperature_c,
                        memory_used_mb = telemetry.sample.memory_used_mb,
                        "Anomaly detected on {}",
                        telemetry.gpu_id
                    ),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Anomaly check failed for {}: {}", telemetry.gpu_id, e),
                }
            });
        }
    }
}
