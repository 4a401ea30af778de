//! Info-query handlers. Dumps honor the privacy mask and short-circuit
//! with `NoChangeInData` when the caller's view is already current.

use std::sync::Arc;

use crate::config::private_data;
use crate::controller::Controller;
use crate::error::{Result, SchedError};
use crate::locks::sets;
use crate::rpc::dispatch::ReqCtx;
use crate::rpc::handlers::can_view;
use crate::rpc::{
    Body, BuildInfoResp, FrontEndInfoItem, FrontEndInfoResp, InfoReq, JobIdReq, JobInfoItem,
    JobInfoResp, Message, MsgType, NodeInfoItem, NodeInfoResp, PartitionInfoItem,
    PartitionInfoResp, PriorityFactorsReq, PriorityFactorsResp, ReservationInfoItem,
    ReservationInfoResp, ReturnCode, StatsInfoResp, UserInfoReq,
};
use crate::state::{JobRecord, NodeStore};

fn job_item(job: &JobRecord, nodes: &NodeStore) -> JobInfoItem {
    JobInfoItem {
        job_id: job.job_id,
        name: job.name.clone(),
        user_id: job.user_id,
        partition: job.partition.clone(),
        state: job.base().to_string(),
        state_flags: job.flags().bits(),
        reason: format!("{:?}", job.reason),
        node_list: match &job.node_bitmap {
            Some(bm) => nodes.names_of(bm),
            None => Vec::new(),
        },
        node_cnt: job.node_cnt,
        submit_time: job.submit_time,
        start_time: job.start_time,
        end_time: job.end_time,
        restart_cnt: job.restart_cnt,
    }
}

pub async fn job_info(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &InfoReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let config = guard.config_snapshot();
    let jobs = guard.jobs.get();
    if let Some(seen) = req.last_update {
        if jobs.last_update <= seen {
            return Err(SchedError::NoChangeInData);
        }
    }
    let nodes = guard.nodes.get();
    let items: Vec<JobInfoItem> = jobs
        .iter()
        .filter(|j| can_view(ctx, config.private_data, private_data::JOBS, Some(j.user_id)))
        .map(|j| job_item(j, nodes))
        .collect();
    Ok(Message::response(
        MsgType::ResponseJobInfo,
        Body::JobInfo(JobInfoResp {
            last_update: jobs.last_update,
            jobs: items,
        }),
    ))
}

pub async fn job_info_single(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &JobIdReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let config = guard.config_snapshot();
    let jobs = guard.jobs.get();
    let job = jobs.get(req.job_id)?;
    if !can_view(ctx, config.private_data, private_data::JOBS, Some(job.user_id)) {
        return Err(SchedError::AccessDenied);
    }
    Ok(Message::response(
        MsgType::ResponseJobInfo,
        Body::JobInfo(JobInfoResp {
            last_update: jobs.last_update,
            jobs: vec![job_item(job, guard.nodes.get())],
        }),
    ))
}

pub async fn job_user_info(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &UserInfoReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_NODE_READ).await;
    let config = guard.config_snapshot();
    let jobs = guard.jobs.get();
    let nodes = guard.nodes.get();
    let items: Vec<JobInfoItem> = jobs
        .ids_for_user(req.user_id)
        .iter()
        .filter_map(|&id| jobs.find(id))
        .filter(|j| can_view(ctx, config.private_data, private_data::JOBS, Some(j.user_id)))
        .map(|j| job_item(j, nodes))
        .collect();
    Ok(Message::response(
        MsgType::ResponseJobInfo,
        Body::JobInfo(JobInfoResp {
            last_update: jobs.last_update,
            jobs: items,
        }),
    ))
}

pub async fn node_info(ctl: &Arc<Controller>, ctx: &ReqCtx, req: &InfoReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::NODE_READ).await;
    let config = guard.config_snapshot();
    if !can_view(ctx, config.private_data, private_data::NODES, None) {
        return Err(SchedError::AccessDenied);
    }
    let nodes = guard.nodes.get();
    if let Some(seen) = req.last_update {
        if nodes.last_update <= seen {
            return Err(SchedError::NoChangeInData);
        }
    }
    let items: Vec<NodeInfoItem> = nodes
        .iter()
        .map(|n| NodeInfoItem {
            name: n.name.clone(),
            state: n.base().to_string(),
            state_flags: n.flags().bits(),
            cpus: n.topology.cpus,
            real_memory_mb: n.real_memory_mb,
            features: n.features.clone(),
            reason: n.reason.clone(),
            cpu_load: n.cpu_load,
        })
        .collect();
    Ok(Message::response(
        MsgType::ResponseNodeInfo,
        Body::NodeInfo(NodeInfoResp {
            last_update: nodes.last_update,
            nodes: items,
        }),
    ))
}

pub async fn partition_info(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &InfoReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::PART_READ).await;
    let config = guard.config_snapshot();
    if !can_view(ctx, config.private_data, private_data::PARTITIONS, None) {
        return Err(SchedError::AccessDenied);
    }
    let parts = guard.parts.get();
    if let Some(seen) = req.last_update {
        if parts.last_update <= seen {
            return Err(SchedError::NoChangeInData);
        }
    }
    let items: Vec<PartitionInfoItem> = parts
        .partitions()
        .map(|p| PartitionInfoItem {
            name: p.name.clone(),
            nodes: p.node_names.clone(),
            state: format!("{:?}", p.state),
            is_default: p.is_default,
            priority: p.priority,
            max_time_minutes: p.max_time_minutes,
        })
        .collect();
    Ok(Message::response(
        MsgType::ResponsePartitionInfo,
        Body::PartitionInfo(PartitionInfoResp {
            last_update: parts.last_update,
            partitions: items,
        }),
    ))
}

pub async fn reservation_info(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    req: &InfoReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::PART_READ).await;
    let config = guard.config_snapshot();
    let parts = guard.parts.get();
    if let Some(seen) = req.last_update {
        if parts.last_update <= seen {
            return Err(SchedError::NoChangeInData);
        }
    }
    let items: Vec<ReservationInfoItem> = parts
        .reservations()
        .filter(|r| {
            can_view(ctx, config.private_data, private_data::RESERVATIONS, None)
                || r.users.contains(&ctx.uid)
        })
        .map(|r| ReservationInfoItem {
            name: r.name.clone(),
            nodes: r.node_names.clone(),
            start_time: r.start_time,
            end_time: r.end_time,
            users: r.users.clone(),
        })
        .collect();
    Ok(Message::response(
        MsgType::ResponseReservationInfo,
        Body::ReservationInfo(ReservationInfoResp {
            last_update: parts.last_update,
            reservations: items,
        }),
    ))
}

pub async fn front_end_info(ctl: &Arc<Controller>) -> Result<Message> {
    let guard = ctl.state.acquire(sets::NODE_READ).await;
    let items: Vec<FrontEndInfoItem> = guard
        .nodes
        .get()
        .front_ends()
        .iter()
        .map(|fe| FrontEndInfoItem {
            name: fe.name.clone(),
            state: fe.base().to_string(),
            job_cnt: fe.job_cnt,
        })
        .collect();
    Ok(Message::response(
        MsgType::ResponseFrontEndInfo,
        Body::FrontEndInfo(FrontEndInfoResp { front_ends: items }),
    ))
}

pub async fn build_info(ctl: &Arc<Controller>, req: &InfoReq) -> Result<Message> {
    let guard = ctl.state.acquire(sets::CONFIG_READ).await;
    let config = guard.config_snapshot();
    if let Some(seen) = req.last_update {
        // The snapshot has no timestamps of its own; boot time bounds it.
        if ctl.boot_time <= seen {
            return Err(SchedError::NoChangeInData);
        }
    }
    Ok(Message::response(
        MsgType::ResponseBuildInfo,
        Body::BuildInfo(BuildInfoResp {
            cluster_name: config.cluster_name.clone(),
            protocol_version: crate::rpc::PROTOCOL_VERSION,
            last_update: ctl.boot_time,
            sched_defer: config.sched_defer,
            min_job_age_secs: config.min_job_age_secs,
            node_timeout_secs: config.node_timeout_secs,
            partitions: config.partitions.clone(),
        }),
    ))
}

pub async fn priority_factors(
    ctl: &Arc<Controller>,
    req: &PriorityFactorsReq,
) -> Result<Message> {
    let guard = ctl.state.acquire(sets::JOB_READ).await;
    let jobs = guard.jobs.get();
    let factors: Vec<_> = jobs
        .iter()
        .filter(|j| req.job_ids.is_empty() || req.job_ids.contains(&j.job_id))
        .filter(|j| j.is_pending())
        .map(|j| (j.job_id, ctl.ports.priority.factors(j, 0)))
        .collect();
    Ok(Message::response(
        MsgType::ResponsePriorityFactors,
        Body::PriorityFactors(PriorityFactorsResp { factors }),
    ))
}

pub fn stats_info(ctl: &Arc<Controller>) -> Result<Message> {
    let (by_type, by_user) = ctl.telemetry.dump();
    Ok(Message::response(
        MsgType::ResponseStatsInfo,
        Body::StatsInfo(StatsInfoResp {
            by_type,
            by_user,
            diag: ctl.diag.snapshot(),
        }),
    ))
}

pub fn stats_reset(ctl: &Arc<Controller>) -> Result<Message> {
    ctl.telemetry.reset();
    ctl.diag.reset();
    tracing::info!("telemetry reset");
    Ok(Message::return_code(ReturnCode::success()))
}
