//! Job-lifecycle handlers: allocation, batch submit, will-run probes,
//! signalling, requeue, suspend, and the allocation-info family.

use std::sync::Arc;

use crate::agent::AgentPayload;
use crate::controller::{split_guard, Controller};
use crate::error::{Result, SchedError};
use crate::locks::sets;
use crate::rpc::dispatch::ReqCtx;
use crate::rpc::handlers::can_modify_job;
use crate::rpc::{
    Body, JobIdReq, JobNotifyReq, JobSubmitReq, Message, MsgType, RequeueReq,
    ResourceAllocationResp, ReturnCode, SbcastCredResp, StepKillReq, SubmitBatchResp, SuspendOp,
    SuspendReq, WillRunResp,
};
use crate::sched::{pend_reason_for, start_job, will_run_estimate};
use crate::state::{JobRecord, PendReason, BATCH_SCRIPT_STEP};
use crate::telemetry::DiagStats;

const SIGKILL: i32 = 9;
const SIGSTOP: i32 = 19;
const SIGCONT: i32 = 18;

/// Admission: validates the request against partition policy and builds the
/// pending record. Caller holds job write + part read.
fn admit_job(
    req: &JobSubmitReq,
    guard: &mut crate::locks::DomainGuard<'_>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<u32> {
    let part_name = {
        let parts = guard.parts.get();
        let part = match &req.request.partition {
            Some(name) => parts
                .find(name)
                .ok_or_else(|| SchedError::InvalidPartitionName(name.clone()))?,
            None => parts
                .default_partition()
                .ok_or(SchedError::PartConfigUnavailable)?,
        };
        if !part.user_allowed(req.user_id) {
            return Err(SchedError::AccessDenied);
        }
        if part
            .effective_time_limit(req.request.time_limit_minutes)
            .is_none()
        {
            return Err(SchedError::PartConfigUnavailable);
        }
        part.name.clone()
    };

    let time_limit = {
        let part = guard.parts.get().get(&part_name)?;
        part.effective_time_limit(req.request.time_limit_minutes)
            .unwrap_or(60)
    };

    let jobs = guard.jobs.get_mut();
    let job_id = jobs.insert_with(
        |id| {
            let mut job = JobRecord::new(
                id,
                req.user_id,
                req.group_id,
                req.name.clone(),
                part_name.clone(),
                req.request.clone(),
                now,
            );
            job.time_limit_minutes = time_limit;
            job.batch_script = req.batch_script.clone();
            job.spank_env = req.spank_env.clone();
            job.details.requeue = req.requeue;
            job.details.held = req.hold;
            job
        },
        now,
    )?;
    Ok(job_id)
}

/// Interactive/immediate resource allocation.
pub async fn allocate(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &JobSubmitReq) -> Result<Message> {
    if ctx.uid != req.user_id && !ctx.is_super_user {
        tracing::error!(uid = ctx.uid, "security violation, resource allocate");
        return Err(SchedError::UserIdMissing);
    }
    let now = ctl.now();

    if req.hold && req.immediate {
        return Err(SchedError::JobHeld);
    }

    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();

    let job_id = admit_job(req, &mut guard, now)?;
    DiagStats::bump(&ctl.diag.jobs_submitted);

    if req.hold {
        guard.jobs.get_mut().get_mut(job_id)?.reason = PendReason::Held;
        drop(guard);
        ctl.request_job_save();
        return Ok(alloc_pending_response(job_id, &SchedError::JobHeld));
    }

    let selection = {
        let split = split_guard(&mut guard);
        let job = split.jobs.get(job_id)?;
        ctl.sched
            .plugin
            .select_nodes(job, split.nodes, split.parts, &ctl.ports, now)
    };

    let response = match selection {
        Ok(selection) => {
            let split = split_guard(&mut guard);
            start_job(
                job_id,
                selection,
                split.jobs,
                split.nodes,
                &config,
                &ctl.signer,
                &ctl.agent,
                &ctl.diag,
                now,
            )?;
            let job = split.jobs.get(job_id)?;
            let resources = job.resources.clone().unwrap_or_default();
            let node_list = match &job.node_bitmap {
                Some(bm) => split.nodes.names_of(bm),
                None => Vec::new(),
            };
            Message::response(
                MsgType::ResponseResourceAllocation,
                Body::ResourceAllocation(ResourceAllocationResp {
                    job_id,
                    error_code: 0,
                    node_list,
                    node_cnt: job.node_cnt,
                    cpus_per_node: resources.cpus_per_node,
                    pend_reason: None,
                }),
            )
        }
        Err(e) if e.leaves_job_pending() && !req.immediate => {
            let jobs = guard.jobs.get_mut();
            let job = jobs.get_mut(job_id)?;
            job.reason = pend_reason_for(&e);
            alloc_pending_response(job_id, &e)
        }
        Err(e) => {
            // Immediate requests keep no record behind.
            guard.jobs.get_mut().delete(job_id, now)?;
            if e.leaves_job_pending() {
                return Err(SchedError::CanNotStartImmediately);
            }
            return Err(e);
        }
    };
    drop(guard);

    ctl.request_job_save();
    ctl.request_node_save();
    ctl.kick_scheduler().await;
    tracing::info!(job_id, uid = ctx.uid, "resource allocation processed");
    Ok(response)
}

fn alloc_pending_response(job_id: u32, e: &SchedError) -> Message {
    Message::response(
        MsgType::ResponseResourceAllocation,
        Body::ResourceAllocation(ResourceAllocationResp {
            job_id,
            error_code: e.wire_code(),
            node_list: Vec::new(),
            node_cnt: 0,
            cpus_per_node: Vec::new(),
            pend_reason: Some(e.to_string()),
        }),
    )
}

/// Batch submission: the job is admitted Pending and the scheduler decides
/// later; capacity problems are partial success.
pub async fn submit_batch(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &JobSubmitReq,
) -> Result<Message> {
    if ctx.uid != req.user_id && !ctx.is_super_user {
        tracing::error!(uid = ctx.uid, "security violation, batch submit");
        return Err(SchedError::UserIdMissing);
    }
    if req.batch_script.as_deref().unwrap_or("").trim().is_empty() {
        return Err(SchedError::Unexpected("batch script is empty".into()));
    }
    let now = ctl.now();

    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let job_id = admit_job(req, &mut guard, now)?;
    if req.hold {
        guard.jobs.get_mut().get_mut(job_id)?.reason = PendReason::Held;
    }
    drop(guard);

    DiagStats::bump(&ctl.diag.jobs_submitted);
    ctl.request_job_save();
    ctl.kick_scheduler().await;
    tracing::info!(job_id, uid = ctx.uid, "batch job submitted");
    Ok(Message::response(
        MsgType::ResponseSubmitBatchJob,
        Body::SubmitBatch(SubmitBatchResp {
            job_id,
            error_code: 0,
            pend_reason: None,
        }),
    ))
}

/// Read-mostly scheduling probe; commits nothing.
pub async fn will_run(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &JobSubmitReq) -> Result<Message> {
    if ctx.uid != req.user_id && !ctx.is_super_user {
        return Err(SchedError::UserIdMissing);
    }
    let now = ctl.now();
    let guard = ctl.state.acquire(sets::READ_ALL).await;

    let parts = guard.parts.get();
    let part_name = match &req.request.partition {
        Some(name) => name.clone(),
        None => parts
            .default_partition()
            .ok_or(SchedError::PartConfigUnavailable)?
            .name
            .clone(),
    };
    let mut probe = JobRecord::new(
        0,
        req.user_id,
        req.group_id,
        req.name.clone(),
        part_name,
        req.request.clone(),
        now,
    );
    probe.batch_script = req.batch_script.clone();

    let (start_time, node_list) = will_run_estimate(
        &probe,
        guard.jobs.get(),
        guard.nodes.get(),
        parts,
        &ctl.ports,
        ctl.sched.plugin.as_ref(),
        now,
    )?;
    Ok(Message::response(
        MsgType::ResponseJobWillRun,
        Body::WillRun(WillRunResp {
            start_time,
            node_list,
        }),
    ))
}

/// Cancel or signal a job (batch-script step id) or one step.
pub async fn job_step_kill(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &StepKillReq,
) -> Result<Message> {
    let now = ctl.now();
    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();

    {
        let job = guard.jobs.get().get(req.job_id)?;
        if !can_modify_job(ctx, job.user_id) {
            tracing::error!(
                uid = ctx.uid,
                job_id = req.job_id,
                "security violation, job signal"
            );
            return Err(SchedError::AccessDenied);
        }
    }

    if req.step_id == BATCH_SCRIPT_STEP {
        let split = split_guard(&mut guard);
        let job = split.jobs.get(req.job_id)?;
        if job.is_finished() {
            return Err(SchedError::AlreadyDone);
        }
        if req.signal == SIGKILL {
            crate::reconcile::cancel_job(
                split.jobs,
                split.nodes,
                &config,
                &ctl.agent,
                req.job_id,
                now,
            )?;
            DiagStats::bump(&ctl.diag.jobs_canceled);
            tracing::info!(job_id = req.job_id, uid = ctx.uid, "job cancelled");
        } else {
            let names = {
                let job = split.jobs.get(req.job_id)?;
                match &job.node_bitmap {
                    Some(bm) => split.nodes.names_of(bm),
                    None => Vec::new(),
                }
            };
            for target in crate::sched::dispatch_targets(&config, split.nodes, &names) {
                ctl.agent.send(
                    target,
                    AgentPayload::KillJob {
                        job_id: req.job_id,
                        signal: req.signal,
                    },
                );
            }
            tracing::info!(
                job_id = req.job_id,
                signal = req.signal,
                uid = ctx.uid,
                "job signalled"
            );
        }
    } else {
        let split = split_guard(&mut guard);
        let job = split.jobs.get(req.job_id)?;
        let step = job
            .steps
            .get(&req.step_id)
            .ok_or(SchedError::InvalidStepId {
                job_id: req.job_id,
                step_id: req.step_id,
            })?;
        let names = split.nodes.names_of(&step.node_bitmap);
        for target in crate::sched::dispatch_targets(&config, split.nodes, &names) {
            ctl.agent.send(
                target,
                AgentPayload::KillStep {
                    job_id: req.job_id,
                    step_id: req.step_id,
                    signal: req.signal,
                },
            );
        }
        tracing::info!(
            job_id = req.job_id,
            step_id = req.step_id,
            signal = req.signal,
            "step signalled"
        );
    }
    drop(guard);

    ctl.request_job_save();
    Ok(Message::return_code(ReturnCode::success()))
}

pub async fn requeue(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &RequeueReq) -> Result<Message> {
    let now = ctl.now();
    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    {
        let job = guard.jobs.get().get(req.job_id)?;
        if !can_modify_job(ctx, job.user_id) {
            return Err(SchedError::AccessDenied);
        }
    }
    let split = split_guard(&mut guard);
    crate::reconcile::requeue_job(
        split.jobs,
        split.nodes,
        &config,
        &ctl.agent,
        &ctl.diag,
        req.job_id,
        req.hold,
        ctx.is_operator,
        now,
    )?;
    drop(guard);
    ctl.request_job_save();
    ctl.kick_scheduler().await;
    Ok(Message::return_code(ReturnCode::success()))
}

pub async fn suspend(ctl: &Arc<Controller>, _ctx: &ReqCtx, req: &SuspendReq) -> Result<Message> {
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let split = split_guard(&mut guard);
    let job = split.jobs.get_mut(req.job_id)?;
    let signal = match req.op {
        SuspendOp::Suspend => {
            job.suspend()?;
            SIGSTOP
        }
        SuspendOp::Resume => {
            job.resume()?;
            SIGCONT
        }
    };
    let names = match &job.node_bitmap {
        Some(bm) => split.nodes.names_of(bm),
        None => Vec::new(),
    };
    for target in crate::sched::dispatch_targets(&config, split.nodes, &names) {
        ctl.agent.send(
            target,
            AgentPayload::KillJob {
                job_id: req.job_id,
                signal,
            },
        );
    }
    drop(guard);
    ctl.request_job_save();
    Ok(Message::return_code(ReturnCode::success()))
}

/// Ready once every prolog has reported.
pub async fn job_ready(ctl: &Arc<Controller>, req: &JobIdReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_READ).await;
    let job = guard.jobs.get().get(req.job_id)?;
    let detail = if job.is_running() && !job.is_configuring() {
        "ready"
    } else {
        "not_ready"
    };
    Ok(Message::return_code(ReturnCode {
        code: 0,
        detail: Some(detail.to_string()),
    }))
}

pub async fn job_alloc_info(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &JobIdReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let job = guard.jobs.get().get(req.job_id)?;
    if !can_modify_job(ctx, job.user_id) {
        tracing::error!(
            uid = ctx.uid,
            job_id = req.job_id,
            "security violation, alloc info"
        );
        return Err(SchedError::AccessDenied);
    }
    let resources = job.resources.clone().unwrap_or_default();
    let node_list = match &job.node_bitmap {
        Some(bm) => guard.nodes.get().names_of(bm),
        None => Vec::new(),
    };
    Ok(Message::response(
        MsgType::ResponseJobAllocInfo,
        Body::JobAllocInfo(crate::rpc::JobAllocInfoResp {
            job_id: job.job_id,
            node_list,
            node_cnt: job.node_cnt,
            cpus_per_node: resources.cpus_per_node,
        }),
    ))
}

pub async fn sbcast_cred(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &JobIdReq) -> Result<Message> {
    let now = ctl.now();
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let job = guard.jobs.get().get(req.job_id)?;
    if !can_modify_job(ctx, job.user_id) {
        return Err(SchedError::AccessDenied);
    }
    let credential =
        crate::stepmgr::sbcast_credential(job, guard.nodes.get(), &ctl.signer, now)?;
    Ok(Message::response(
        MsgType::ResponseJobSbcastCred,
        Body::SbcastCred(SbcastCredResp { credential }),
    ))
}

pub async fn job_notify(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &JobNotifyReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let job = guard.jobs.get().get(req.job_id)?;
    if !can_modify_job(ctx, job.user_id) {
        return Err(SchedError::AccessDenied);
    }
    if let Some(host) = &job.batch_host {
        ctl.agent.send(
            host.clone(),
            AgentPayload::UserMessage {
                job_id: req.job_id,
                message: req.message.clone(),
            },
        );
    }
    Ok(Message::return_code(ReturnCode::success()))
}
