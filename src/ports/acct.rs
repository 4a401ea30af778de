//! Accounting sink port.
//!
//! Best-effort: the controller reports lifecycle events and moves on.
//! Implementations must not propagate failures; they log and swallow.

use async_trait::async_trait;

use crate::state::{JobRecord, StepRecord};

#[async_trait]
pub trait AccountingSink: Send + Sync {
    async fn job_start(&self, job: &JobRecord);
    async fn job_end(&self, job: &JobRecord);
    async fn step_start(&self, step: &StepRecord);
    async fn step_end(&self, step: &StepRecord);
    async fn node_down(&self, node: &str, reason: &str);
}

/// Default sink: structured log lines only.
pub struct LogAccounting;

#[async_trait]
impl AccountingSink for LogAccounting {
    async fn job_start(&self, job: &JobRecord) {
        tracing::debug!(job_id = job.job_id, user = job.user_id, "acct: job start");
    }

    async fn job_end(&self, job: &JobRecord) {
        tracing::debug!(
            job_id = job.job_id,
            exit_code = job.exit_code,
            "acct: job end"
        );
    }

    async fn step_start(&self, step: &StepRecord) {
        tracing::debug!(
            job_id = step.job_id,
            step_id = step.step_id,
            "acct: step start"
        );
    }

    async fn step_end(&self, step: &StepRecord) {
        tracing::debug!(
            job_id = step.job_id,
            step_id = step.step_id,
            exit_code = step.exit_code,
            "acct: step end"
        );
    }

    async fn node_down(&self, node: &str, reason: &str) {
        tracing::debug!(node, reason, "acct: node down");
    }
}
