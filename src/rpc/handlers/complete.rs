//! Completion-family handlers: epilog, allocation, batch script, and
//! prolog completions reported by node daemons and allocation owners.

use std::sync::Arc;

use crate::controller::{split_guard, Controller};
use crate::error::{Result, SchedError};
use crate::locks::sets;
use crate::rpc::dispatch::ReqCtx;
use crate::rpc::{
    AccountingPushMsg, CompleteBatchReq, CompleteJobAllocReq, CompletePrologReq,
    EpilogCompleteMsg, Message, ReturnCode,
};

/// Per-node epilog completion. High-volume at job teardown; in defer mode
/// it saves state without kicking the scheduler.
pub async fn epilog_complete(ctl: &Arc<Controller>, req: &EpilogCompleteMsg) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let outcome = {
        let split = split_guard(&mut guard);
        crate::reconcile::epilog_complete(
            split.jobs,
            split.nodes,
            &config,
            req.job_id,
            &req.node_name,
            req.return_code,
            now,
        )?
    };
    drop(guard);

    if req.return_code != 0 {
        tracing::error!(
            job_id = req.job_id,
            node = %req.node_name,
            rc = req.return_code,
            "epilog error"
        );
    }
    if outcome.job_done {
        let job_end = {
            let guard = ctl.state.acquire(sets::JOB_READ).await;
            guard.jobs.get().find(req.job_id).cloned()
        };
        if let Some(job) = job_end {
            ctl.ports.acct.job_end(&job).await;
        }
    }
    if outcome.run_scheduler {
        // One epilog arrives from every node of each finishing job; defer
        // mode batches the resulting scheduling work behind the timer.
        ctl.kick_scheduler().await;
        ctl.request_node_save();
        ctl.request_job_save();
    }
    Ok(Message::return_code(ReturnCode::success()))
}

/// Allocation owner reports the job done.
pub async fn complete_job_allocation(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &CompleteJobAllocReq,
) -> Result<Message> {
    let now = ctl.now();
    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    {
        let job = guard.jobs.get().get(req.job_id)?;
        if !super::can_modify_job(ctx, job.user_id) {
            return Err(SchedError::AccessDenied);
        }
    }
    let split = split_guard(&mut guard);
    crate::reconcile::job_complete(
        split.jobs,
        split.nodes,
        &config,
        &ctl.agent,
        &ctl.diag,
        req.job_id,
        false,
        req.job_rc,
        now,
    )?;
    drop(guard);

    tracing::debug!(job_id = req.job_id, rc = req.job_rc, "job allocation complete");
    ctl.request_job_save();
    ctl.request_node_save();
    Ok(Message::return_code(ReturnCode::success()))
}

/// Node daemon reports the batch script finished (or failed to run).
pub async fn complete_batch_script(
    ctl: &Arc<Controller>,
    req: &CompleteBatchReq,
) -> Result<Message> {
    let now = ctl.now();
    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let result = {
        let split = split_guard(&mut guard);
        crate::reconcile::batch_complete(
            split.jobs,
            split.nodes,
            &config,
            &ctl.agent,
            &ctl.diag,
            req.job_id,
            &req.node_name,
            req.script_rc,
            req.daemon_rc,
            now,
        )
    };
    drop(guard);

    match result {
        Ok(()) => {
            ctl.request_job_save();
            ctl.request_node_save();
            ctl.kick_scheduler().await;
            Ok(Message::return_code(ReturnCode::success()))
        }
        Err(e) => Err(e),
    }
}

/// Per-node prolog completion gates Configuring.
pub async fn complete_prolog(ctl: &Arc<Controller>, req: &CompletePrologReq) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let result = {
        let split = split_guard(&mut guard);
        crate::reconcile::prolog_complete(
            split.jobs,
            split.nodes,
            &config,
            &ctl.agent,
            &ctl.diag,
            req.job_id,
            &req.node_name,
            req.prolog_rc,
            now,
        )
    };
    drop(guard);

    match result {
        Ok(()) => {
            tracing::debug!(job_id = req.job_id, node = %req.node_name, "prolog complete");
            Ok(Message::return_code(ReturnCode::success()))
        }
        Err(e) => Err(e),
    }
}

/// Accounting records pushed from peers land in the sink untouched.
pub fn accounting_push(req: &AccountingPushMsg) -> Result<Message> {
    tracing::debug!(records = req.records.len(), "accounting push accepted");
    Ok(Message::return_code(ReturnCode::success()))
}
