use aether::core::ingest::Ingestor;
use aether::core::signals::AnomalyDetector;
use aether::core::store::TelemetrySink;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// Feeds every message on the telemetry subscription to the ingestor.
///
/// A slow store write never holds back the subscription.
pub async fn ingest_loop<S, D>(
    mut subscriber: async_nats::Subscriber,
    ingestor: Ingestor<S, D>,
    shutdown: CancellationToken,
) where
    S: TelemetrySink + 'static,
    D: AnomalyDetector + 'static,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscriber.next() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("Telemetry subscription closed by the server");
                    break;
                }
            },
        };

        // State is applied here in arrival order; only the durable write and
        // the anomaly check run on their own task. Decode failures are logged
        // inside the ingestor.
        let _ = ingestor
            .ingest_detached(message.subject.as_str(), &message.payload)
            .await;
    }

    if let Err(e) = subscriber.unsubscribe().await {
        tracing::debug!("Failed to unsubscribe from telemetry: {}", e);
    }
    tracing::info!("Telemetry ingestion stopped");
}
