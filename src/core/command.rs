//! Outbound commands: placements for the dispatch collaborator and idle-period
//! signals for power management, published on the telemetry transport.

use super::error::CommandError;
use super::job::{Job, JobType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementCommand {
    pub job_id: String,
    pub job_type: JobType,
    pub gpu_id: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleSignal {
    pub pending_jobs: usize,
    pub issued_at: DateTime<Utc>,
}

pub trait CommandSink: Send + Sync {
    fn dispatch(
        &self,
        command: &PlacementCommand,
    ) -> impl Future<Output = Result<(), CommandError>> + Send;

    fn signal_idle(&self, signal: &IdleSignal)
        -> impl Future<Output = Result<(), CommandError>> + Send;
}

/// Subject layout on the transport, rooted at a configurable prefix.
#[derive(Debug, Clone)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('.').to_string(),
        }
    }

    /// Wildcard matching every per-GPU telemetry subject.
    pub fn telemetry(&self) -> String {
        format!("{}.telemetry.*", self.prefix)
    }

    pub fn command(&self, gpu_id: &str) -> String {
        format!("{}.command.{gpu_id}", self.prefix)
    }

    pub fn idle(&self) -> String {
        format!("{}.power.idle", self.prefix)
    }
}

impl PlacementCommand {
    pub fn new(job: &Job, gpu_id: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            gpu_id: gpu_id.to_string(),
            issued_at: Utc::now(),
        }
    }
}

/// Publishes commands as JSON on a NATS connection.
#[derive(Debug, Clone)]
pub struct NatsCommandSink {
    client: async_nats::Client,
    subjects: Subjects,
}

impl NatsCommandSink {
    pub fn new(client: async_nats::Client, subjects: Subjects) -> Self {
        Self { client, subjects }
    }

    async fn publish<T: Serialize>(&self, subject: String, payload: &T) -> Result<(), CommandError> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| CommandError::Publish {
                subject,
                reason: e.to_string(),
            })
    }
}

impl CommandSink for NatsCommandSink {
    async fn dispatch(&self, command: &PlacementCommand) -> Result<(), CommandError> {
        self.publish(self.subjects.command(&command.gpu_id), command)
            .await
    }

    async fn signal_idle(&self, signal: &IdleSignal) -> Result<(), CommandError> {
        self.publish(self.subjects.idle(), signal).await
    }
}
