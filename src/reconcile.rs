//! Completion reconciliation: epilog, step, batch, and prolog completions
//! reported by node daemons, plus the requeue-versus-terminate decision.
//!
//! Everything here runs under job write + node write locks taken by the
//! calling handler. Outbound traffic goes through the agent queue.

use chrono::{DateTime, Utc};

use crate::agent::{AgentPayload, AgentQueue};
use crate::config::ClusterConfig;
use crate::error::{Result, SchedError};
use crate::state::{
    JobBase, JobStore, NodeStore, PendReason, BATCH_SCRIPT_STEP,
};
use crate::telemetry::DiagStats;

pub const REASON_BATCH_FAIL: &str = "batch job complete failure";
pub const REASON_EPILOG_FAIL: &str = "epilog complete failure";
pub const REASON_PROLOG_FAIL: &str = "prolog failure";

/// Outcome of folding in one epilog-complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogOutcome {
    /// Completing cleared on this message (last epilog in).
    pub job_done: bool,
    /// The scheduler should be kicked (a node came free).
    pub run_scheduler: bool,
}

/// Folds in one per-node epilog completion. A non-zero return code drains
/// the reporting node and, when the job's details permit, arms a requeue
/// that fires once the last epilog lands.
pub fn epilog_complete(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    job_id: u32,
    node_name: &str,
    rc: i32,
    now: DateTime<Utc>,
) -> Result<EpilogOutcome> {
    // Unknown node is a hard error; unknown job just means the record was
    // already purged.
    let node = nodes.get_mut(node_name)?;
    node.epilog_complete(job_id);
    let node_freed = node.running_jobs.is_empty() && node.completing_jobs.is_empty();

    let Some(job) = jobs.find_mut(job_id) else {
        tracing::warn!(job_id, node = node_name, "epilog for unknown job");
        return Ok(EpilogOutcome {
            job_done: false,
            run_scheduler: node_freed,
        });
    };

    if rc != 0 {
        tracing::error!(job_id, node = node_name, rc, "epilog error");
        if job.details.requeue {
            job.set_requeue_flag(true);
        }
        nodes.get_mut(node_name)?.drain(REASON_EPILOG_FAIL);
    }

    let job = jobs.get_mut(job_id)?;
    let job_done = job.epilog_done();
    if job_done {
        finish_requeue_if_armed(jobs, config, job_id, now)?;
    }

    Ok(EpilogOutcome {
        job_done,
        run_scheduler: job_done || node_freed,
    })
}

/// Applies an armed requeue flag once cleanup is finished, honoring the
/// restart budget for exit-driven requeues. Admin requeues pass for free.
fn finish_requeue_if_armed(
    jobs: &mut JobStore,
    config: &ClusterConfig,
    job_id: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = jobs.get_mut(job_id)?;
    if !job.has_requeue_flag() {
        return Ok(());
    }
    let admin = job.details.admin_requeue;
    if !admin && job.restart_cnt >= config.max_restarts {
        tracing::info!(
            job_id,
            restarts = job.restart_cnt,
            "restart budget exhausted, leaving job terminal"
        );
        job.set_requeue_flag(false);
        return Ok(());
    }
    if !admin && job.details.hold_on_exit && job.exit_code.unwrap_or(0) != 0 {
        job.set_requeue_flag(false);
        job.details.held = true;
        tracing::info!(job_id, "held on exit code instead of requeue");
        return Ok(());
    }
    let reason = match job.base() {
        JobBase::NodeFail => PendReason::NodeFailRequeue,
        _ => PendReason::JobExitRequeue,
    };
    job.requeue(reason, now)?;
    if admin {
        // The admin path does not consume the budget.
        job.restart_cnt = job.restart_cnt.saturating_sub(1);
        job.details.admin_requeue = false;
    }
    tracing::info!(job_id, restart_cnt = job.restart_cnt, "job requeued");
    Ok(())
}

/// Result of one step-complete range message. `finished` carries the
/// removed record once the last range lands, for accounting.
#[derive(Debug)]
pub struct StepOutcome {
    pub nodes_remaining: usize,
    pub step_rc: i32,
    pub finished: Option<crate::state::StepRecord>,
}

/// Folds one `[first..=last]` step completion range in. Duplicate ranges
/// surface as `AlreadyDone` and change nothing. When the last range lands,
/// the step record is removed from its job.
pub fn step_partial_complete(
    jobs: &mut JobStore,
    job_id: u32,
    step_id: u32,
    range_first: u32,
    range_last: u32,
    rc: i32,
) -> Result<StepOutcome> {
    let job = jobs.get_mut(job_id)?;
    let Some(step) = job.steps.get_mut(&step_id) else {
        // A retired id means the step already finalized; replayed ranges
        // from the fan-in tree are acknowledged as no-ops.
        if step_id != BATCH_SCRIPT_STEP && step_id < job.step_ids.peek() {
            return Err(SchedError::AlreadyDone);
        }
        return Err(SchedError::InvalidStepId { job_id, step_id });
    };
    let remaining = step.complete_range(range_first as usize, range_last as usize, rc)?;
    let step_rc = step.exit_code;
    let finished = if remaining == 0 {
        tracing::info!(job_id, step_id, rc = step_rc, "step complete");
        job.steps.remove(&step_id)
    } else {
        None
    };
    Ok(StepOutcome {
        nodes_remaining: remaining,
        step_rc,
        finished,
    })
}

/// Marks a job's allocation finished: terminal state, Completing set, and
/// kill/terminate traffic queued for every allocated node. The epilog
/// completions that follow drive the rest.
#[allow(clippy::too_many_arguments)]
pub fn job_complete(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    diag: &DiagStats,
    job_id: u32,
    requeue: bool,
    rc: i32,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = jobs.get_mut(job_id)?;

    if job.is_finished() {
        return Err(SchedError::AlreadyDone);
    }

    if job.is_pending() {
        // Never started: no nodes to clean up, terminal immediately.
        job.finish(JobBase::Cancelled, rc, now)?;
        job.clear_completing();
        return Ok(());
    }

    let to = if requeue {
        JobBase::NodeFail
    } else if rc == 0 {
        JobBase::Complete
    } else {
        JobBase::Failed
    };
    job.finish(to, rc, now)?;
    if requeue && job.details.requeue {
        job.set_requeue_flag(true);
    }
    if rc == 0 {
        DiagStats::bump(&diag.jobs_completed);
    } else {
        DiagStats::bump(&diag.jobs_failed);
    }

    release_allocation(jobs, nodes, config, agent, job_id);
    Ok(())
}

/// User- or admin-initiated cancellation: Cancelled base state, Completing
/// set, kill traffic queued.
pub fn cancel_job(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    job_id: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = jobs.get_mut(job_id)?;
    if job.is_finished() {
        return Err(SchedError::AlreadyDone);
    }
    if job.is_pending() {
        job.finish(JobBase::Cancelled, 0, now)?;
        job.clear_completing();
        return Ok(());
    }
    job.finish(JobBase::Cancelled, 0, now)?;
    release_allocation(jobs, nodes, config, agent, job_id);
    Ok(())
}

/// Moves every allocated node into Completing and queues the kill message
/// fan-out for the job.
fn release_allocation(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    job_id: u32,
) {
    let names = match jobs.find(job_id).and_then(|j| j.node_bitmap.as_ref()) {
        Some(bitmap) => nodes.names_of(bitmap),
        None => Vec::new(),
    };
    for name in &names {
        if let Some(node) = nodes.find_mut(name) {
            node.begin_completing(job_id);
        }
    }
    for target in crate::sched::dispatch_targets(config, nodes, &names) {
        agent.send(target, AgentPayload::KillJob { job_id, signal: 9 });
    }
}

/// Batch-complete handling. The daemon's verdict decides between the
/// transient set (neutralized), the logged-only set, and everything else,
/// which drains the reporting node.
#[allow(clippy::too_many_arguments)]
pub fn batch_complete(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    diag: &DiagStats,
    job_id: u32,
    node_name: &str,
    script_rc: i32,
    daemon_rc: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    // A requeued batch job may have restarted elsewhere (wrong host) or
    // still be waiting to (pending, batch host cleared); either way the
    // stale completion is discarded.
    if let Some(job) = jobs.find(job_id) {
        match &job.batch_host {
            Some(host) if host != node_name => {
                tracing::error!(
                    job_id,
                    reported = node_name,
                    batch_host = %host,
                    "batch completion from wrong node ignored"
                );
                return Err(SchedError::AlreadyDone);
            }
            None if job.is_pending() => {
                tracing::info!(job_id, node = node_name, "stale batch completion ignored");
                return Ok(());
            }
            _ => {}
        }
    }

    let mut requeue = false;

    let transient = [
        SchedError::AlreadyDone.wire_code(),
        SchedError::CredentialRevoked.wire_code(),
        SchedError::ReservationNotUsable.wire_code(),
    ];
    let logged_only = [
        SchedError::CommError(String::new()).wire_code(),
        SchedError::UserIdMissing.wire_code(),
        SchedError::UidNotFound.wire_code(),
        SchedError::GidNotFound.wire_code(),
        SchedError::InvalidAcctFreq.wire_code(),
    ];

    if daemon_rc != 0 {
        if transient.contains(&daemon_rc) {
            tracing::info!(job_id, node = node_name, daemon_rc, "transient batch error");
            if daemon_rc == SchedError::ReservationNotUsable.wire_code() {
                // One more chance to run.
                requeue = jobs
                    .find(job_id)
                    .map(|j| j.restart_cnt == 0)
                    .unwrap_or(false);
            }
        } else if logged_only.contains(&daemon_rc) {
            tracing::error!(job_id, node = node_name, daemon_rc, "batch launch error");
        } else {
            tracing::error!(
                job_id,
                node = node_name,
                daemon_rc,
                "draining node on batch completion failure"
            );
            nodes.get_mut(node_name)?.drain(REASON_BATCH_FAIL);
            if script_rc != 0 {
                if let Some(job) = jobs.find(job_id) {
                    if job.details.requeue {
                        requeue = true;
                    }
                }
            }
        }
    }
    match job_complete(
        jobs, nodes, config, agent, diag, job_id, requeue, script_rc, now,
    ) {
        Ok(()) | Err(SchedError::AlreadyDone) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Per-node prolog completion. Failure drains the node and fails the job
/// over to a requeue-eligible state.
pub fn prolog_complete(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    diag: &DiagStats,
    job_id: u32,
    node_name: &str,
    rc: i32,
    now: DateTime<Utc>,
) -> Result<()> {
    if rc != 0 {
        tracing::error!(job_id, node = node_name, rc, "prolog failed");
        nodes.get_mut(node_name)?.drain(REASON_PROLOG_FAIL);
        return job_complete(jobs, nodes, config, agent, diag, job_id, true, rc, now);
    }
    let job = jobs.get_mut(job_id)?;
    job.prolog_done()?;
    if !job.is_configuring() {
        tracing::debug!(job_id, "all prologs done, job configured");
    }
    Ok(())
}

/// Times out running jobs past their deadline: Timeout base state,
/// Completing set, kill traffic queued. Returns how many expired.
pub fn expire_time_limits(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    diag: &DiagStats,
    now: DateTime<Utc>,
) -> u32 {
    let expired: Vec<u32> = jobs
        .iter()
        .filter(|j| j.is_running())
        .filter(|j| j.deadline().map(|d| d <= now).unwrap_or(false))
        .map(|j| j.job_id)
        .collect();

    let mut count = 0;
    for job_id in expired {
        let Some(job) = jobs.find_mut(job_id) else {
            continue;
        };
        tracing::info!(job_id, "time limit exhausted");
        if job.finish(JobBase::Timeout, 0, now).is_err() {
            continue;
        }
        DiagStats::bump(&diag.jobs_failed);
        let names = match &job.node_bitmap {
            Some(bm) => nodes.names_of(bm),
            None => Vec::new(),
        };
        for name in &names {
            if let Some(node) = nodes.find_mut(name) {
                node.begin_completing(job_id);
            }
        }
        for target in crate::sched::dispatch_targets(config, nodes, &names) {
            agent.send(target, AgentPayload::KillJob { job_id, signal: 9 });
        }
        count += 1;
    }
    count
}

/// Admin or user requeue RPC. Pending jobs are refused; running jobs are
/// terminated with the requeue flag armed; finished jobs flip straight
/// back to Pending.
#[allow(clippy::too_many_arguments)]
pub fn requeue_job(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    diag: &DiagStats,
    job_id: u32,
    hold: bool,
    admin: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = jobs.get_mut(job_id)?;
    if job.is_pending() {
        return Err(SchedError::Disabled);
    }
    if job.batch_script.is_none() {
        // Only batch jobs restart from a script.
        return Err(SchedError::Disabled);
    }

    if job.is_finished() {
        if job.is_completing() {
            job.set_requeue_flag(true);
            job.details.admin_requeue = admin;
            job.details.held = hold;
            return Ok(());
        }
        job.requeue(PendReason::JobExitRequeue, now)?;
        if admin {
            job.restart_cnt = job.restart_cnt.saturating_sub(1);
        }
        job.details.held = hold;
        DiagStats::bump(&diag.jobs_requeued);
        return Ok(());
    }

    // Running or suspended: terminate first, requeue when cleanup ends.
    job.details.admin_requeue = admin;
    job.details.held = hold;
    job_complete(jobs, nodes, config, agent, diag, job_id, true, 0, now)?;
    let job = jobs.get_mut(job_id)?;
    job.set_requeue_flag(true);
    DiagStats::bump(&diag.jobs_requeued);
    Ok(())
}
