//! The scheduling loop: drains the job queue once per tick, asks the placement
//! advisor about each job against a fresh cluster snapshot, and dispatches,
//! re-queues or dead-letters according to the verdict.
//!
//! The queue lock and the cluster-state lock are never held together, and no
//! lock is held across the advisor call.

use super::advisor::{DecisionRequest, PlacementAdvisor, Verdict};
use super::cluster::ClusterStateStore;
use super::command::{CommandSink, IdleSignal, PlacementCommand};
use super::error::AdvisorError;
use super::job::Job;
use super::queue::JobQueue;
use super::signals::CarbonIntensity;
use crate::config::SchedulerConfig;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueReason {
    /// No fresh GPU to offer; the advisor was not consulted
    NoCandidates,
    Rejected(Option<String>),
    AdvisorFailed(String),
    DispatchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dispatched { job_id: String, gpu_id: String },
    Requeued { job_id: String, reason: RequeueReason },
    DeadLettered { job_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    Idle,
    Processed(Vec<Outcome>),
}

pub struct Scheduler<A, C> {
    cluster: Arc<ClusterStateStore>,
    queue: Arc<JobQueue>,
    advisor: A,
    commands: C,
    carbon: Arc<dyn CarbonIntensity>,
    config: SchedulerConfig,
    idle: bool,
}

/// Never dispatch to a GPU that was not part of the request.
fn verify(request: &DecisionRequest, verdict: Verdict) -> Result<Verdict, AdvisorError> {
    match verdict {
        Verdict::Accept { gpu_id } if !request.offers(&gpu_id) => {
            Err(AdvisorError::UnverifiedPlacement { gpu_id })
        }
        verdict => Ok(verdict),
    }
}

impl<A, C> Scheduler<A, C>
where
    A: PlacementAdvisor,
    C: CommandSink,
{
    pub fn new(
        cluster: Arc<ClusterStateStore>,
        queue: Arc<JobQueue>,
        advisor: A,
        commands: C,
        carbon: Arc<dyn CarbonIntensity>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cluster,
            queue,
            advisor,
            commands,
            carbon,
            config,
            idle: false,
        }
    }

    /// Ticks on a fixed interval until `shutdown` is cancelled.
    ///
    /// A tick that has started always runs to completion, so a dequeued job
    /// is re-queued or retired before the loop exits.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Scheduler started (tick={}s, batch_size={}, max_attempts={})",
            self.config.tick().as_secs(),
            self.config.batch_size.max(1),
            self.config.max_attempts
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutdown requested");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.tick().await;
        }
    }

    pub async fn tick(&mut self) -> TickReport {
        // Fixed up front so a job re-queued during this tick is not decided twice.
        let budget = self.queue.len().await.min(self.config.batch_size.max(1));

        if budget == 0 {
            self.signal_idle().await;
            return TickReport::Idle;
        }
        self.idle = false;

        let mut outcomes = Vec::with_capacity(budget);
        for _ in 0..budget {
            // Another consumer may have drained the queue since `len`.
            let Some(job) = self.queue.try_dequeue().await else {
                break;
            };
            outcomes.push(self.place(job).await);
        }

        TickReport::Processed(outcomes)
    }

    async fn signal_idle(&mut self) {
        if !self.idle {
            tracing::info!("No jobs in queue, signalling idle period");
            self.idle = true;
        } else {
            tracing::debug!("Queue still empty");
        }

        let signal = IdleSignal {
            pending_jobs: 0,
            issued_at: Utc::now(),
        };
        if let Err(e) = self.commands.signal_idle(&signal).await {
            tracing::warn!("Failed to emit idle signal: {}", e);
        }
    }

    async fn place(&self, mut job: Job) -> Outcome {
        let snapshot = self
            .cluster
            .fresh_snapshot(self.config.stale_after())
            .await;

        if snapshot.is_empty() {
            tracing::warn!("No GPUs available for job {}, re-queuing", job.id);
            return self.requeue(job, RequeueReason::NoCandidates).await;
        }

        let request = DecisionRequest::new(&job, &snapshot, self.carbon.current());
        tracing::debug!(
            "Asking advisor about job {} ({}) with {} candidate(s)",
            job.id,
            job.job_type,
            request.candidates.len()
        );

        let verdict = self
            .advisor
            .decide(&request)
            .await
            .and_then(|verdict| verify(&request, verdict));

        match verdict {
            Ok(Verdict::Accept { gpu_id }) => {
                let command = PlacementCommand::new(&job, &gpu_id);
                match self.commands.dispatch(&command).await {
                    Ok(()) => {
                        self.queue.retire(&job.id).await;
                        tracing::info!("Dispatched job {} to {}", job.id, gpu_id);
                        Outcome::Dispatched {
                            job_id: job.id,
                            gpu_id,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dispatch of job {} to {} failed: {}", job.id, gpu_id, e);
                        self.requeue(job, RequeueReason::DispatchFailed(e.to_string()))
                            .await
                    }
                }
            }
            Ok(Verdict::Reject { reason }) => {
                tracing::info!(
                    "Advisor declined job {}{}, re-queuing",
                    job.id,
                    reason
                        .as_deref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                );
                self.requeue(job, RequeueReason::Rejected(reason)).await
            }
            Err(e) => {
                job.attempts += 1;
                match self.config.max_attempts() {
                    Some(max) if job.attempts >= max => {
                        tracing::error!(
                            "Job {} dead-lettered after {} failed attempts: {}",
                            job.id,
                            job.attempts,
                            e
                        );
                        let job_id = job.id.clone();
                        let reason = e.to_string();
                        self.queue.dead_letter(job, reason.clone()).await;
                        Outcome::DeadLettered { job_id, reason }
                    }
                    _ => {
                        tracing::warn!(
                            "Placement of job {} failed (attempt {}): {}. Re-queuing.",
                            job.id,
                            job.attempts,
                            e
                        );
                        self.requeue(job, RequeueReason::AdvisorFailed(e.to_string()))
                            .await
                    }
                }
            }
        }
    }

    async fn requeue(&self, job: Job, reason: RequeueReason) -> Outcome {
        let job_id = job.id.clone();
        self.queue.requeue(job).await;
        Outcome::Requeued { job_id, reason }
    }
}
