use super::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobType {
    Training,
    Inference,
}

impl JobType {
    pub fn variants() -> String {
        JobType::iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Raw job descriptor as submitted by a caller.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SubmitRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Placement attempts that ended in an advisor error
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub submitted_at: Option<SystemTime>,
}

impl Job {
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            attempts: 0,
            submitted_at: Some(SystemTime::now()),
        }
    }
}

impl TryFrom<SubmitRequest> for Job {
    type Error = ValidationError;

    fn try_from(request: SubmitRequest) -> Result<Self, Self::Error> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }

        let job_type = request
            .job_type
            .trim()
            .to_lowercase()
            .parse::<JobType>()
            .map_err(|_| ValidationError::UnknownType(request.job_type.clone(), JobType::variants()))?;

        Ok(Job::new(id, job_type))
    }
}
