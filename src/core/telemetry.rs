use super::error::DecodeError;
use serde::{Deserialize, Deserializer, Serialize};

pub type GpuId = String;

/// One point-in-time measurement set reported by a GPU agent.
///
/// `temperature_c`, `memory_used_mb` and `memory_total_mb` are mandatory;
/// everything else defaults when an agent does not report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuTelemetrySample {
    /// Falls back to the last segment of the telemetry subject when absent.
    #[serde(default)]
    pub gpu_id: Option<GpuId>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    pub temperature_c: u32,
    #[serde(default)]
    pub utilization_gpu: u32,
    #[serde(default)]
    pub utilization_memory: u32,
    #[serde(default)]
    pub power_draw_w: f64,
    #[serde(default)]
    pub clock_core_mhz: Option<u32>,
    #[serde(default)]
    pub clock_memory_mhz: Option<u32>,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    #[serde(default)]
    pub performance_state: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub throttling_reasons: Vec<String>,
}

/// Agents report throttling either as a single label or as a list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(reason) => vec![reason],
        OneOrMany::Many(reasons) => reasons,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// A decoded sample bound to the GPU it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTelemetry {
    pub gpu_id: GpuId,
    pub sample: GpuTelemetrySample,
}

impl DecodedTelemetry {
    /// Decodes a raw message received on `subject`.
    pub fn decode(subject: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let sample: GpuTelemetrySample = serde_json::from_slice(payload)?;

        let gpu_id = sample
            .gpu_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or_else(|| {
                subject
                    .rsplit('.')
                    .next()
                    .map(str::trim)
                    .filter(|id| !id.is_empty() && *id != "*" && *id != subject)
            })
            .map(str::to_string)
            .ok_or_else(|| DecodeError::MissingGpuId {
                subject: subject.to_string(),
            })?;

        Ok(Self { gpu_id, sample })
    }

    pub fn state(&self) -> GpuState {
        GpuState::from(&self.sample)
    }
}

/// The scheduling- and display-relevant subset of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuState {
    #[serde(rename = "gpu_temp")]
    pub temp: u32,
    #[serde(rename = "gpu_mem_used")]
    pub mem_used: u64,
    #[serde(rename = "utilization_gpu")]
    pub utilization: u32,
    pub power_draw_w: f64,
    pub throttling_reasons: Vec<String>,
}

impl GpuState {
    /// Labels such as `"none"` or an empty list rendered as `"[]"` mean
    /// the GPU is not throttling.
    pub fn is_throttling(&self) -> bool {
        self.throttling_reasons.iter().any(|reason| {
            let reason = reason.trim();
            !reason.is_empty() && !reason.eq_ignore_ascii_case("none") && reason != "[]"
        })
    }

    pub fn is_anomalous(&self, temperature_threshold_c: u32) -> bool {
        self.temp >= temperature_threshold_c || self.is_throttling()
    }
}

impl From<&GpuTelemetrySample> for GpuState {
    fn from(sample: &GpuTelemetrySample) -> Self {
        Self {
            temp: sample.temperature_c,
            mem_used: sample.memory_used_mb,
            utilization: sample.utilization_gpu,
            power_draw_w: sample.power_draw_w,
            throttling_reasons: sample.throttling_reasons.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_agent_payload() {
        let payload = br#"{"gpu_name":"Mock GPU","temperature_c":45,"memory_used_mb":256,"memory_total_mb":24564}"#;
        let decoded = DecodedTelemetry::decode("aether.telemetry.gpu-0", payload).unwrap();

        assert_eq!(decoded.gpu_id, "gpu-0");
        assert_eq!(decoded.sample.temperature_c, 45);
        assert_eq!(decoded.sample.utilization_gpu, 0);
        assert!(decoded.sample.throttling_reasons.is_empty());
    }

    #[test]
    fn test_payload_gpu_id_wins_over_subject() {
        let payload = br#"{"gpu_id":"gpu-7","temperature_c":50,"memory_used_mb":1,"memory_total_mb":2}"#;
        let decoded = DecodedTelemetry::decode("aether.telemetry.gpu-0", payload).unwrap();
        assert_eq!(decoded.gpu_id, "gpu-7");
    }

    #[test]
    fn test_throttling_as_label_or_list() {
        let single = br#"{"temperature_c":91,"memory_used_mb":1,"memory_total_mb":2,"throttling_reasons":"thermal"}"#;
        let decoded = DecodedTelemetry::decode("t.gpu-0", single).unwrap();
        assert_eq!(decoded.sample.throttling_reasons, vec!["thermal".to_string()]);
        assert!(decoded.state().is_throttling());

        let list = br#"{"temperature_c":40,"memory_used_mb":1,"memory_total_mb":2,"throttling_reasons":["power","thermal"]}"#;
        let decoded = DecodedTelemetry::decode("t.gpu-0", list).unwrap();
        assert_eq!(decoded.sample.throttling_reasons.len(), 2);
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let payload = br#"{"gpu_id":"gpu-0","memory_used_mb":1,"memory_total_mb":2}"#;
        let err = DecodedTelemetry::decode("t.gpu-0", payload).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_missing_gpu_id_is_rejected() {
        let payload = br#"{"temperature_c":40,"memory_used_mb":1,"memory_total_mb":2}"#;
        let err = DecodedTelemetry::decode("telemetry", payload).unwrap_err();
        assert!(matches!(err, DecodeError::MissingGpuId { .. }));
    }

    #[test]
    fn test_not_throttling_labels() {
        let mut state = GpuState {
            temp: 60,
            mem_used: 0,
            utilization: 0,
            power_draw_w: 0.0,
            throttling_reasons: vec!["None".to_string(), "[]".to_string(), " ".to_string()],
        };
        assert!(!state.is_throttling());
        assert!(!state.is_anomalous(85));

        state.temp = 85;
        assert!(state.is_anomalous(85));
    }

    #[test]
    fn test_state_wire_names_match_dashboard() {
        let payload = br#"{"temperature_c":91,"utilization_gpu":77,"power_draw_w":250.5,"memory_used_mb":4096,"memory_total_mb":8192}"#;
        let state = DecodedTelemetry::decode("aether.telemetry.gpu-0", payload)
            .unwrap()
            .state();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["gpu_temp"], 91);
        assert_eq!(json["gpu_mem_used"], 4096);
        assert_eq!(json["utilization_gpu"], 77);
        assert_eq!(json["power_draw_w"], 250.5);
        assert!(json.get("temp").is_none());
        assert!(json.get("mem_used").is_none());
    }
}
