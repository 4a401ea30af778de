//! Step handlers: creation, completion fan-in, and step info.

use std::sync::Arc;

use crate::controller::{split_guard, Controller};
use crate::error::{Result, SchedError};
use crate::locks::{sets, LockLevel, LockSet};
use crate::rpc::dispatch::ReqCtx;
use crate::rpc::handlers::can_modify_job;
use crate::rpc::{
    Body, JobIdReq, Message, MsgType, ReturnCode, StepCompleteReq, StepCreateReq, StepCreateResp,
    StepInfoItem, StepInfoResp,
};
use crate::state::BATCH_SCRIPT_STEP;

/// Creates a step against a running job and returns its credential.
pub async fn step_create(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &StepCreateReq,
) -> Result<Message> {
    if ctx.uid != req.user_id && !ctx.is_super_user {
        tracing::error!(uid = ctx.uid, run_as = req.user_id, "security violation, step create");
        return Err(SchedError::UserIdMissing);
    }
    let now = ctl.now();
    // Write jobs, read nodes.
    let lockset = LockSet::new(
        LockLevel::None,
        LockLevel::Write,
        LockLevel::Read,
        LockLevel::None,
    );
    let mut guard = ctl.state.acquire(lockset).await;

    let step_id =
        crate::stepmgr::create_step(guard.jobs.get_mut(), guard.nodes.get(), &ctl.signer, req, now)?;

    let response = {
        let jobs = guard.jobs.get();
        let job = jobs.get(req.job_id)?;
        let step = job.steps.get(&step_id).ok_or(SchedError::InvalidStepId {
            job_id: req.job_id,
            step_id,
        })?;
        ctl.ports.acct.step_start(step).await;
        Message::response(
            MsgType::ResponseJobStepCreate,
            Body::StepCreateResp(StepCreateResp {
                job_id: req.job_id,
                step_id,
                node_list: guard.nodes.get().names_of(&step.node_bitmap),
                tasks_per_node: step.layout.tasks_per_node.clone(),
                port_range: step.port_range,
                credential: step.credential.clone(),
            }),
        )
    };
    drop(guard);
    ctl.request_job_save();
    Ok(response)
}

/// Step completion carries a contiguous node range from the fan-in tree.
pub async fn step_complete(
    ctl: &Arc<Controller>,
    _ctx: &ReqCtx,
    req: &StepCompleteReq,
) -> Result<Message> {
    let now = ctl.now();
    let _permit = ctl.throttle.start().await;
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();

    if req.step_id == BATCH_SCRIPT_STEP {
        // The batch script exiting ends the whole allocation.
        let split = split_guard(&mut guard);
        crate::reconcile::job_complete(
            split.jobs,
            split.nodes,
            &config,
            &ctl.agent,
            &ctl.diag,
            req.job_id,
            false,
            req.step_rc,
            now,
        )?;
        drop(guard);
        ctl.request_job_save();
        return Ok(Message::return_code(ReturnCode::success()));
    }

    let outcome = {
        let split = split_guard(&mut guard);
        crate::reconcile::step_partial_complete(
            split.jobs,
            req.job_id,
            req.step_id,
            req.range_first,
            req.range_last,
            req.step_rc,
        )?
    };
    drop(guard);

    if let Some(step) = &outcome.finished {
        ctl.ports.acct.step_end(step).await;
    }
    ctl.request_job_save();
    Ok(Message::return_code(ReturnCode::success()))
}

pub async fn step_info(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &JobIdReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let job = guard.jobs.get().get(req.job_id)?;
    let config = guard.config_snapshot();
    if !can_modify_job(ctx, job.user_id)
        && config.private_data & crate::config::private_data::JOBS != 0
    {
        return Err(SchedError::AccessDenied);
    }
    let steps = job
        .steps
        .values()
        .map(|s| StepInfoItem {
            job_id: s.job_id,
            step_id: s.step_id,
            name: s.name.clone(),
            node_list: guard.nodes.get().names_of(&s.node_bitmap),
            task_cnt: s.layout.task_cnt,
            start_time: s.start_time,
        })
        .collect();
    Ok(Message::response(
        MsgType::ResponseJobStepInfo,
        Body::StepInfo(StepInfoResp { steps }),
    ))
}
