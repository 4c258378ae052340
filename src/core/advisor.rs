//! Request/response client for the external placement advisor.
//!
//! The advisor receives one job and the GPUs it may be placed on and answers
//! with a single best GPU or a rejection. Two response encodings are accepted:
//!
//! - `{"best_gpu_id": "gpu-1"}` to accept, `{"best_gpu_id": null, "reason": ".."}` to reject
//! - `{"is_good_placement": true|false, "reason": ".."}`, which is only
//!   unambiguous when exactly one candidate was offered

use super::cluster::ClusterState;
use super::error::AdvisorError;
use super::job::{Job, JobType};
use super::telemetry::{GpuId, GpuState};
use crate::config::AdvisorConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::time::Duration;

/// A GPU offered to the advisor for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub gpu_id: GpuId,
    pub gpu_temp: u32,
    pub gpu_mem_used: u64,
    pub utilization_gpu: u32,
    pub power_draw_w: f64,
    /// Comma-joined reasons; empty when the GPU is not throttling
    pub throttling_reasons: String,
}

impl Candidate {
    pub fn new(gpu_id: GpuId, state: &GpuState) -> Self {
        let throttling_reasons = if state.is_throttling() {
            state.throttling_reasons.join(",")
        } else {
            String::new()
        };
        Self {
            gpu_id,
            gpu_temp: state.temp,
            gpu_mem_used: state.mem_used,
            utilization_gpu: state.utilization,
            power_draw_w: state.power_draw_w,
            throttling_reasons,
        }
    }
}

/// Body of one placement decision request.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub candidates: Vec<Candidate>,
    pub job_type: JobType,
    pub carbon_intensity: f64,
}

impl DecisionRequest {
    /// Builds the candidate set from a freshly taken cluster snapshot.
    pub fn new(job: &Job, snapshot: &ClusterState, carbon_intensity: f64) -> Self {
        let candidates = snapshot
            .iter()
            .map(|(gpu_id, state)| Candidate::new(gpu_id.clone(), state))
            .collect();
        Self {
            candidates,
            job_type: job.job_type,
            carbon_intensity,
        }
    }

    pub fn offers(&self, gpu_id: &str) -> bool {
        self.candidates.iter().any(|c| c.gpu_id == gpu_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept { gpu_id: GpuId },
    Reject { reason: Option<String> },
}

/// Seam for the placement decision so the scheduler can run against fakes.
pub trait PlacementAdvisor: Send + Sync {
    fn decide(
        &self,
        request: &DecisionRequest,
    ) -> impl Future<Output = Result<Verdict, AdvisorError>> + Send;
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct AdvisorResponse {
    #[serde(default, deserialize_with = "present")]
    best_gpu_id: Option<Option<String>>,
    #[serde(default)]
    is_good_placement: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
}

impl AdvisorResponse {
    fn into_verdict(self, request: &DecisionRequest) -> Result<Verdict, AdvisorError> {
        match (self.best_gpu_id, self.is_good_placement) {
            (Some(Some(gpu_id)), _) => {
                let gpu_id = gpu_id.trim();
                if gpu_id.is_empty() {
                    return Err(AdvisorError::Protocol("empty best_gpu_id".to_string()));
                }
                Ok(Verdict::Accept {
                    gpu_id: gpu_id.to_string(),
                })
            }
            (Some(None), _) | (None, Some(false)) => Ok(Verdict::Reject {
                reason: self.reason,
            }),
            (None, Some(true)) => match request.candidates.as_slice() {
                [only] => Ok(Verdict::Accept {
                    gpu_id: only.gpu_id.clone(),
                }),
                candidates => Err(AdvisorError::Protocol(format!(
                    "is_good_placement without a gpu id is ambiguous for {} candidates",
                    candidates.len()
                ))),
            },
            (None, None) => Err(AdvisorError::Protocol(
                "response carries neither best_gpu_id nor is_good_placement".to_string(),
            )),
        }
    }
}

/// HTTP client for the advisor service. Performs no retries.
#[derive(Debug, Clone)]
pub struct HttpAdvisor {
    client: reqwest::Client,
    url: String,
}

impl HttpAdvisor {
    pub fn new(config: &AdvisorConfig) -> anyhow::Result<Self> {
        crate::core::install_crypto_provider();

        let client = reqwest::Client::builder()
            .user_agent(format!("aether/{}/advisor", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim().to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PlacementAdvisor for HttpAdvisor {
    async fn decide(&self, request: &DecisionRequest) -> Result<Verdict, AdvisorError> {
        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| AdvisorError::Unreachable(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| AdvisorError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(AdvisorError::Protocol(format!(
                "HTTP {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let response: AdvisorResponse = serde_json::from_slice(&body)
            .map_err(|e| AdvisorError::Protocol(format!("undecodable response: {e}")))?;
        response.into_verdict(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    type Received = Arc<Mutex<Vec<Value>>>;

    #[derive(Clone)]
    struct AdvisorStub {
        received: Received,
        status: StatusCode,
        reply: String,
        delay: Duration,
    }

    async fn advise(State(stub): State<AdvisorStub>, Json(body): Json<Value>) -> (StatusCode, String) {
        stub.received.lock().unwrap().push(body);
        tokio::time::sleep(stub.delay).await;
        (stub.status, stub.reply.clone())
    }

    async fn start_advisor(status: StatusCode, reply: &str, delay: Duration) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(vec![]));
        let stub = AdvisorStub {
            received: Arc::clone(&received),
            status,
            reply: reply.to_string(),
            delay,
        };

        let app = Router::new().route("/predict", post(advise)).with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/predict"), received)
    }

    fn advisor(url: String, timeout_secs: u64) -> HttpAdvisor {
        HttpAdvisor::new(&AdvisorConfig { url, timeout_secs }).unwrap()
    }

    fn gpu(temp: u32) -> GpuState {
        GpuState {
            temp,
            mem_used: 1024,
            utilization: 30,
            power_draw_w: 120.5,
            throttling_reasons: vec![],
        }
    }

    fn request(gpus: &[(&str, u32)]) -> DecisionRequest {
        let snapshot: ClusterState = gpus
            .iter()
            .map(|(id, temp)| (id.to_string(), gpu(*temp)))
            .collect();
        DecisionRequest::new(&Job::new("job-1", JobType::Training), &snapshot, 250.0)
    }

    #[tokio::test]
    async fn test_accept_best_gpu() {
        let (url, received) =
            start_advisor(StatusCode::OK, r#"{"best_gpu_id":"gpu-1"}"#, Duration::ZERO).await;
        let req = request(&[("gpu-0", 60), ("gpu-1", 95)]);

        let verdict = advisor(url, 5).decide(&req).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Accept {
                gpu_id: "gpu-1".to_string()
            }
        );

        let body = received.lock().unwrap()[0].clone();
        assert_eq!(body["job_type"], "training");
        assert_eq!(body["candidates"].as_array().unwrap().len(), 2);
        assert_eq!(body["candidates"][1]["gpu_id"], "gpu-1");
        assert_eq!(body["candidates"][1]["gpu_temp"], 95);
        assert_eq!(body["candidates"][0]["throttling_reasons"], "");
    }

    #[tokio::test]
    async fn test_null_best_gpu_is_rejection() {
        let (url, _) = start_advisor(
            StatusCode::OK,
            r#"{"best_gpu_id":null,"reason":"fleet too hot"}"#,
            Duration::ZERO,
        )
        .await;

        let verdict = advisor(url, 5).decide(&request(&[("gpu-0", 60)])).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Reject {
                reason: Some("fleet too hot".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_binary_verdict() {
        let (url, _) =
            start_advisor(StatusCode::OK, r#"{"is_good_placement":true}"#, Duration::ZERO).await;
        let client = advisor(url, 5);

        let verdict = client.decide(&request(&[("gpu-0", 60)])).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Accept {
                gpu_id: "gpu-0".to_string()
            }
        );

        let err = client
            .decide(&request(&[("gpu-0", 60), ("gpu-1", 70)]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_undecodable_response_is_protocol_error() {
        let (url, _) = start_advisor(StatusCode::OK, "not json", Duration::ZERO).await;
        let err = advisor(url, 5).decide(&request(&[("gpu-0", 60)])).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Protocol(_)));

        let (url, _) = start_advisor(StatusCode::OK, "{}", Duration::ZERO).await;
        let err = advisor(url, 5).decide(&request(&[("gpu-0", 60)])).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_protocol_error() {
        let (url, _) =
            start_advisor(StatusCode::INTERNAL_SERVER_ERROR, "boom", Duration::ZERO).await;
        let err = advisor(url, 5).decide(&request(&[("gpu-0", 60)])).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Protocol(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = advisor(format!("http://{addr}/predict"), 2)
            .decide(&request(&[("gpu-0", 60)]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_slow_advisor_times_out_as_unreachable() {
        let (url, _) = start_advisor(
            StatusCode::OK,
            r#"{"best_gpu_id":"gpu-0"}"#,
            Duration::from_secs(3),
        )
        .await;

        let err = advisor(url, 1).decide(&request(&[("gpu-0", 60)])).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Unreachable(_)));
    }

    #[test]
    fn test_candidate_reports_throttling() {
        let mut state = gpu(91);
        state.throttling_reasons = vec!["thermal".to_string(), "power".to_string()];
        let candidate = Candidate::new("gpu-0".to_string(), &state);
        assert_eq!(candidate.throttling_reasons, "thermal,power");
    }
}
