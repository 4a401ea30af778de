//! Request dispatch: identity, authorization class, handler routing, and
//! telemetry.
//!
//! Every inbound message flows through [`dispatch`]: the caller's identity
//! is already verified by the auth port, the message type picks a handler
//! (each handler acquires its own declared lock subset), and the elapsed
//! time lands in the telemetry tables on the way out.

use std::sync::Arc;
use std::time::Instant;

use crate::config::debug_flags;
use crate::controller::Controller;
use crate::error::{Result, SchedError};
use crate::ports::AuthIdentity;
use crate::rpc::handlers;
use crate::rpc::{Body, Message, MsgType, ReturnCode};

/// Authorization classes, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Any authenticated caller; object-level checks happen in handlers.
    User,
    /// Operators may read everything and mutate jobs they do not own.
    Operator,
    /// Cluster administration.
    SuperUser,
    /// The node daemon identity (registration and completion traffic).
    NodeDaemon,
}

/// Caller context handed to every handler.
#[derive(Debug, Clone, Copy)]
pub struct ReqCtx {
    pub uid: u32,
    pub gid: u32,
    pub is_operator: bool,
    pub is_super_user: bool,
}

impl ReqCtx {
    pub async fn classify(ctl: &Controller, id: AuthIdentity) -> ReqCtx {
        let config = ctl.state.config_snapshot().await;
        ReqCtx {
            uid: id.uid,
            gid: id.gid,
            is_operator: config.is_operator(id.uid),
            is_super_user: config.is_super_user(id.uid),
        }
    }
}

/// Minimum role required to even reach a handler.
pub fn required_role(msg_type: MsgType) -> Role {
    use MsgType::*;
    match msg_type {
        RequestReconfigure | RequestShutdown | RequestTakeover | RequestSetDebugLevel
        | RequestSetDebugFlags | RequestSetSchedLogLevel | RequestRebootNodes
        | RequestUpdateNode | RequestCreatePartition | RequestUpdatePartition
        | RequestDeletePartition | RequestCreateReservation | RequestUpdateReservation
        | RequestDeleteReservation | RequestStatsReset => Role::SuperUser,

        MessageNodeRegistration | MessageEpilogComplete | RequestStepComplete
        | RequestCompleteBatchScript | RequestCompleteProlog | MessageAccountingPush => {
            Role::NodeDaemon
        }

        RequestSuspend => Role::Operator,

        _ => Role::User,
    }
}

fn role_satisfied(ctx: &ReqCtx, role: Role, daemon_ok: bool) -> bool {
    match role {
        Role::User => true,
        Role::Operator => ctx.is_operator,
        Role::SuperUser => ctx.is_super_user,
        Role::NodeDaemon => daemon_ok,
    }
}

/// Routes one request and produces its response message. Never panics the
/// connection: anything a handler cannot map lands as `Unexpected`.
pub async fn dispatch(ctl: &Arc<Controller>, identity: AuthIdentity, msg: Message) -> Message {
    let started = Instant::now();
    let msg_type = match msg.msg_type() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(code = msg.header.msg_type, "invalid RPC msg_type");
            return Message::return_code(ReturnCode::from_error(&e));
        }
    };

    if ctl.debug_flag_set(debug_flags::PROTOCOL) {
        tracing::info!(msg_type = ?msg_type, uid = identity.uid, "received opcode");
    }

    let ctx = ReqCtx::classify(ctl, identity).await;
    let config = ctl.state.config_snapshot().await;
    let daemon_ok = config.is_daemon_user(ctx.uid);

    // Forwarded requests fan out to the named node set; the per-node
    // results ride back on the response header.
    let ret_list = if msg.header.forward.is_active() {
        fan_out(ctl, &msg).await
    } else {
        Vec::new()
    };

    let mut response = if !role_satisfied(&ctx, required_role(msg_type), daemon_ok) {
        tracing::error!(
            uid = ctx.uid,
            msg_type = ?msg_type,
            "security violation, insufficient role"
        );
        let err = if required_role(msg_type) == Role::NodeDaemon {
            SchedError::UserIdMissing
        } else {
            SchedError::AccessDenied
        };
        Message::return_code(ReturnCode::from_error(&err))
    } else {
        match route(ctl, &ctx, msg_type, &msg.body).await {
            Ok(resp) => resp,
            Err(e) => {
                log_handler_error(msg_type, &e);
                Message::return_code(ReturnCode::from_error(&e))
            }
        }
    };

    response.header.ret_list = ret_list;
    ctl.telemetry
        .record(msg_type.code(), ctx.uid, started.elapsed());
    response
}

/// Delivers the forwarded message to each named node within the forward
/// timeout and aggregates a per-node return code.
async fn fan_out(ctl: &Arc<Controller>, msg: &Message) -> Vec<crate::rpc::ForwardResult> {
    use crate::agent::{AgentMsg, AgentPayload};

    let fwd = &msg.header.forward;
    let timeout = std::time::Duration::from_millis(fwd.timeout_ms.max(1000) as u64);
    let payload = match serde_json::to_vec(&msg.body) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "forward payload encode failed");
            return Vec::new();
        }
    };

    let sends = fwd.nodelist.iter().map(|node| {
        let relay = AgentMsg {
            target: node.clone(),
            payload: AgentPayload::Relay {
                msg_type: msg.header.msg_type,
                payload: payload.clone(),
            },
        };
        async move {
            let return_code = match tokio::time::timeout(timeout, ctl.transport.deliver(&relay))
                .await
            {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => e.wire_code(),
                Err(_) => SchedError::CommError("forward timeout".into()).wire_code(),
            };
            crate::rpc::ForwardResult {
                node: node.clone(),
                return_code,
            }
        }
    });
    futures::future::join_all(sends).await
}

fn log_handler_error(msg_type: MsgType, err: &SchedError) {
    match err {
        // Expected request-shaped outcomes stay quiet.
        SchedError::NoChangeInData | SchedError::AlreadyDone => {
            tracing::debug!(msg_type = ?msg_type, error = %err, "rpc result");
        }
        SchedError::Unexpected(_) | SchedError::Io(_) | SchedError::Codec(_) => {
            tracing::error!(msg_type = ?msg_type, error = %err, "rpc failed");
        }
        _ => {
            tracing::info!(msg_type = ?msg_type, error = %err, "rpc refused");
        }
    }
}

async fn route(
    ctl: &Arc<Controller>,
    ctx: &ReqCtx,
    msg_type: MsgType,
    body: &Body,
) -> Result<Message> {
    use MsgType::*;
    match (msg_type, body) {
        // 1001-series.
        (RequestPing, _) => handlers::admin::ping(),
        (RequestReconfigure, _) => handlers::admin::reconfigure(ctl).await,
        (RequestShutdown, Body::Shutdown(req)) => handlers::admin::shutdown(ctl, req).await,
        (RequestShutdown, _) => {
            handlers::admin::shutdown(ctl, &crate::rpc::ShutdownReq { immediate: false }).await
        }
        (RequestTakeover, _) => handlers::admin::takeover(ctl).await,
        (RequestSetDebugLevel, Body::SetDebugLevel(req)) => {
            handlers::admin::set_debug_level(req)
        }
        (RequestSetDebugFlags, Body::SetDebugFlags(req)) => {
            handlers::admin::set_debug_flags(ctl, req)
        }
        (RequestSetSchedLogLevel, Body::SetDebugLevel(req)) => {
            handlers::admin::set_schedlog_level(req)
        }
        (RequestRebootNodes, Body::RebootNodes(req)) => {
            handlers::node::reboot_nodes(ctl, req).await
        }
        (MessageNodeRegistration, Body::NodeRegistration(req)) => {
            handlers::node::node_registration(ctl, req).await
        }

        // 2001-series.
        (RequestJobInfo, Body::Info(req)) => handlers::info::job_info(ctl, ctx, req).await,
        (RequestJobInfoSingle, Body::JobId(req)) => {
            handlers::info::job_info_single(ctl, ctx, req).await
        }
        (RequestJobUserInfo, Body::UserInfo(req)) => {
            handlers::info::job_user_info(ctl, ctx, req).await
        }
        (RequestNodeInfo, Body::Info(req)) => handlers::info::node_info(ctl, ctx, req).await,
        (RequestPartitionInfo, Body::Info(req)) => {
            handlers::info::partition_info(ctl, ctx, req).await
        }
        (RequestReservationInfo, Body::Info(req)) => {
            handlers::info::reservation_info(ctl, ctx, req).await
        }
        (RequestBuildInfo, Body::Info(req)) => handlers::info::build_info(ctl, req).await,
        (RequestPriorityFactors, Body::PriorityFactorsReq(req)) => {
            handlers::info::priority_factors(ctl, req).await
        }
        (RequestFrontEndInfo, _) => handlers::info::front_end_info(ctl).await,
        (RequestStatsInfo, _) => handlers::info::stats_info(ctl),
        (RequestStatsReset, _) => handlers::info::stats_reset(ctl),

        // 3001-series.
        (RequestUpdateNode, Body::UpdateNode(req)) => {
            handlers::node::update_node(ctl, req).await
        }
        (RequestCreatePartition | RequestUpdatePartition, Body::PartitionDesc(req)) => {
            handlers::resv::update_partition(ctl, req).await
        }
        (RequestDeletePartition, Body::Name(req)) => {
            handlers::resv::delete_partition(ctl, req).await
        }
        (RequestCreateReservation, Body::ResvDesc(req)) => {
            handlers::resv::create_reservation(ctl, req).await
        }
        (RequestUpdateReservation, Body::ResvDesc(req)) => {
            handlers::resv::update_reservation(ctl, req).await
        }
        (RequestDeleteReservation, Body::Name(req)) => {
            handlers::resv::delete_reservation(ctl, req).await
        }

        // 4001-series.
        (RequestResourceAllocation, Body::JobSubmit(req)) => {
            handlers::job::allocate(ctl, ctx, req).await
        }
        (RequestSubmitBatchJob, Body::JobSubmit(req)) => {
            handlers::job::submit_batch(ctl, ctx, req).await
        }
        (RequestJobWillRun, Body::JobSubmit(req)) => {
            handlers::job::will_run(ctl, ctx, req).await
        }
        (RequestJobAllocInfo, Body::JobId(req)) => {
            handlers::job::job_alloc_info(ctl, ctx, req).await
        }
        (RequestJobReady, Body::JobId(req)) => handlers::job::job_ready(ctl, req).await,
        (RequestJobSbcastCred, Body::JobId(req)) => {
            handlers::job::sbcast_cred(ctl, ctx, req).await
        }
        (RequestKillJob, Body::StepKill(req)) => {
            handlers::job::job_step_kill(ctl, ctx, req).await
        }
        (RequestJobRequeue, Body::Requeue(req)) => handlers::job::requeue(ctl, ctx, req).await,

        // 5001-series.
        (RequestJobStepCreate, Body::StepCreate(req)) => {
            handlers::step::step_create(ctl, ctx, req).await
        }
        (RequestCancelJobStep, Body::StepKill(req)) => {
            handlers::job::job_step_kill(ctl, ctx, req).await
        }
        (RequestStepComplete, Body::StepComplete(req)) => {
            handlers::step::step_complete(ctl, ctx, req).await
        }
        (RequestCompleteJobAllocation, Body::CompleteJobAlloc(req)) => {
            handlers::complete::complete_job_allocation(ctl, ctx, req).await
        }
        (RequestCompleteBatchScript, Body::CompleteBatch(req)) => {
            handlers::complete::complete_batch_script(ctl, req).await
        }
        (RequestCompleteProlog, Body::CompleteProlog(req)) => {
            handlers::complete::complete_prolog(ctl, req).await
        }
        (RequestSuspend, Body::Suspend(req)) => handlers::job::suspend(ctl, ctx, req).await,
        (RequestJobStepInfo, Body::JobId(req)) => handlers::step::step_info(ctl, ctx, req).await,

        // 6001-series.
        (MessageEpilogComplete, Body::EpilogComplete(req)) => {
            handlers::complete::epilog_complete(ctl, req).await
        }

        // 7001-series.
        (RequestJobNotify, Body::JobNotify(req)) => {
            handlers::job::job_notify(ctl, ctx, req).await
        }

        // 10001-series.
        (MessageAccountingPush, Body::AccountingPush(req)) => {
            handlers::complete::accounting_push(req)
        }

        (t, _) => Err(SchedError::Unexpected(format!(
            "malformed body for msg_type {t:?}"
        ))),
    }
}
