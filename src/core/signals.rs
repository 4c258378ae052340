//! Pluggable signal providers: grid carbon intensity and per-sample anomaly checks.

use super::telemetry::{DecodedTelemetry, GpuState};
use crate::config::{AnomalyConfig, CarbonConfig, CarbonMode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Source of the grid carbon-intensity signal in gCO2eq/kWh.
pub trait CarbonIntensity: Send + Sync {
    fn current(&self) -> f64;
}

/// Uniform random intensity in `[0, 600)`, standing in for a grid data feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockCarbonIntensity;

impl CarbonIntensity for MockCarbonIntensity {
    fn current(&self) -> f64 {
        rand::rng().random_range(0..600) as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedCarbonIntensity(pub f64);

impl CarbonIntensity for FixedCarbonIntensity {
    fn current(&self) -> f64 {
        self.0
    }
}

pub fn carbon_from_config(config: &CarbonConfig) -> Arc<dyn CarbonIntensity> {
    match config.mode {
        CarbonMode::Mock => Arc::new(MockCarbonIntensity),
        CarbonMode::Fixed => Arc::new(FixedCarbonIntensity(config.value)),
    }
}

pub trait AnomalyDetector: Send + Sync {
    fn check(
        &self,
        telemetry: &DecodedTelemetry,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

/// Flags samples at or above a temperature threshold, or reporting throttling.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdDetector {
    pub temperature_threshold_c: u32,
}

impl AnomalyDetector for ThresholdDetector {
    async fn check(&self, telemetry: &DecodedTelemetry) -> anyhow::Result<bool> {
        Ok(GpuState::from(&telemetry.sample).is_anomalous(self.temperature_threshold_c))
    }
}

#[derive(Debug, Serialize)]
struct AnomalyRequest {
    gpu_temp: u32,
    gpu_mem_used: u64,
}

#[derive(Debug, Deserialize)]
struct AnomalyResponse {
    is_anomaly: bool,
}

/// Remote anomaly model reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAnomalyDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpAnomalyDetector {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        super::install_crypto_provider();
        let client = reqwest::Client::builder()
            .user_agent(format!("aether/{}/anomaly", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.trim().to_string(),
        })
    }
}

impl AnomalyDetector for HttpAnomalyDetector {
    async fn check(&self, telemetry: &DecodedTelemetry) -> anyhow::Result<bool> {
        let body = AnomalyRequest {
            gpu_temp: telemetry.sample.temperature_c,
            gpu_mem_used: telemetry.sample.memory_used_mb,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let verdict: AnomalyResponse = resp.json().await?;
        Ok(verdict.is_anomaly)
    }
}

/// The detector selected by configuration.
#[derive(Debug, Clone)]
pub enum Detector {
    Threshold(ThresholdDetector),
    Remote(HttpAnomalyDetector),
}

impl Detector {
    pub fn from_config(config: &AnomalyConfig) -> anyhow::Result<Self> {
        Ok(match config.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Self::Remote(HttpAnomalyDetector::new(
                url,
                Duration::from_secs(config.timeout_secs.max(1)),
            )?),
            _ => Self::Threshold(ThresholdDetector {
                temperature_threshold_c: config.temperature_threshold_c,
            }),
        })
    }
}

impl AnomalyDetector for Detector {
    async fn check(&self, telemetry: &DecodedTelemetry) -> anyhow::Result<bool> {
        match self {
            Self::Threshold(detector) => detector.check(telemetry).await,
            Self::Remote(detector) => detector.check(telemetry).await,
        }
    }
}
