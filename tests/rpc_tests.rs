//! Dispatcher behavior: authorization classes, privacy masks, telemetry,
//! cancellation fan-out, and the framed server end to end.


use grid_lite::agent::AgentPayload;
use grid_lite::config::private_data;
use grid_lite::error::SchedError;
use grid_lite::ports::TokenAuth;
use grid_lite::rpc::server::{RpcClient, RpcServer};
use grid_lite::rpc::{Body, InfoReq, JsonCodec, Message, MsgType, StepKillReq};
use grid_lite::state::{JobBase, BATCH_SCRIPT_STEP};
use test_harness::*;

/// Node-origin RPCs require the daemon identity.
#[tokio::test]
async fn node_rpcs_reject_ordinary_users() {
    let h = TestController::new(1, 4).await;
    let resp = h
        .rpc(
            USER_A,
            MsgType::MessageNodeRegistration,
            Body::NodeRegistration(registration("n1", 4)),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::UserIdMissing.wire_code());
}

/// Admin RPCs require super-user.
#[tokio::test]
async fn admin_rpcs_require_super_user() {
    let h = TestController::new(1, 4).await;
    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestRebootNodes,
            Body::RebootNodes(grid_lite::rpc::RebootNodesReq { node_names: vec![] }),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::AccessDenied.wire_code());

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestRebootNodes,
            Body::RebootNodes(grid_lite::rpc::RebootNodesReq { node_names: vec![] }),
        )
        .await;
    assert_rc_ok(&resp);
}

/// Cancelling a running job queues a kill for every allocated node and
/// bumps the cancel counter.
#[tokio::test]
async fn cancel_fans_out_and_counts() {
    let h = TestController::new(4, 8).await;
    h.register_all_nodes().await;
    let (job_id, nodes) = h.start_batch_job(USER_A, 3).await;
    h.clear_sent();

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestKillJob,
            Body::StepKill(StepKillReq {
                job_id,
                step_id: BATCH_SCRIPT_STEP,
                signal: 9,
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert_eq!(h.job_base(job_id).await, JobBase::Cancelled);
    assert!(h.job_is_completing(job_id).await);

    let sent = h.sent_messages();
    let kills = count_payloads(&sent, |p| {
        matches!(p, AgentPayload::KillJob { signal: 9, .. })
    });
    assert_eq!(kills, nodes.len());
    assert_eq!(h.ctl.diag.snapshot().jobs_canceled, 1);
}

/// A non-owner cannot signal someone else's job; an operator can.
#[tokio::test]
async fn job_signal_ownership() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;
    let (job_id, _) = h.start_batch_job(USER_A, 1).await;

    let kill = |uid| {
        let h = &h;
        async move {
            h.rpc(
                uid,
                MsgType::RequestKillJob,
                Body::StepKill(StepKillReq {
                    job_id,
                    step_id: BATCH_SCRIPT_STEP,
                    signal: 9,
                }),
            )
            .await
        }
    };
    let resp = kill(USER_B).await;
    assert_eq!(rc_of(&resp), SchedError::AccessDenied.wire_code());
    // 600 is configured as an operator.
    let resp = kill(600).await;
    assert_rc_ok(&resp);
}

/// With PRIVATE_DATA_JOBS set, a plain user sees exactly their own jobs.
#[tokio::test]
async fn privacy_mask_filters_job_dump() {
    let mut config = test_config(4, 8);
    config.private_data = private_data::JOBS;
    let h = TestController::with_config(config).await;
    h.register_all_nodes().await;

    let (job_a, _) = h.start_batch_job(USER_A, 1).await;
    let (job_b, _) = h.start_batch_job(USER_B, 1).await;

    let dump = |uid| {
        let h = &h;
        async move {
            let resp = h
                .rpc(uid, MsgType::RequestJobInfo, Body::Info(InfoReq::default()))
                .await;
            match resp.body {
                Body::JobInfo(r) => r.jobs.iter().map(|j| j.job_id).collect::<Vec<_>>(),
                other => panic!("unexpected response {other:?}"),
            }
        }
    };

    assert_eq!(dump(USER_A).await, vec![job_a]);
    assert_eq!(dump(USER_B).await, vec![job_b]);
    // Operators see everything.
    let all = dump(600).await;
    assert!(all.contains(&job_a) && all.contains(&job_b));
}

/// Telemetry accumulates per type and user; reset is super-user only.
#[tokio::test]
async fn telemetry_counts_and_reset() {
    let h = TestController::new(1, 4).await;
    for _ in 0..3 {
        h.rpc(USER_A, MsgType::RequestPing, Body::Empty).await;
    }
    h.rpc(USER_B, MsgType::RequestPing, Body::Empty).await;

    let resp = h.rpc(USER_A, MsgType::RequestStatsInfo, Body::Empty).await;
    match resp.body {
        Body::StatsInfo(ref stats) => {
            let ping = stats
                .by_type
                .iter()
                .find(|s| s.id == MsgType::RequestPing.code() as u32)
                .expect("ping slot");
            assert_eq!(ping.count, 3 + 1);
            let user_a = stats.by_user.iter().find(|s| s.id == USER_A).unwrap();
            assert!(user_a.count >= 3);
        }
        ref other => panic!("unexpected response {other:?}"),
    }

    let resp = h.rpc(USER_A, MsgType::RequestStatsReset, Body::Empty).await;
    assert_eq!(rc_of(&resp), SchedError::AccessDenied.wire_code());
    let resp = h.rpc(ADMIN_UID, MsgType::RequestStatsReset, Body::Empty).await;
    assert_rc_ok(&resp);
}

/// Info dumps short-circuit when the caller is current.
#[tokio::test]
async fn no_change_in_data_short_circuit() {
    let h = TestController::new(1, 4).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(USER_A, MsgType::RequestNodeInfo, Body::Info(InfoReq::default()))
        .await;
    let last_update = match resp.body {
        Body::NodeInfo(ref r) => r.last_update,
        ref other => panic!("unexpected response {other:?}"),
    };

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestNodeInfo,
            Body::Info(InfoReq {
                last_update: Some(last_update),
            }),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::NoChangeInData.wire_code());
}

/// Suspend/resume drives the Running ↔ Suspended cycle and refuses steps
/// while suspended.
#[tokio::test]
async fn suspend_resume_cycle() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;
    let (job_id, _) = h.start_batch_job(USER_A, 1).await;

    let op = |op| {
        let h = &h;
        async move {
            h.rpc(
                600, // operator
                MsgType::RequestSuspend,
                Body::Suspend(grid_lite::rpc::SuspendReq { job_id, op }),
            )
            .await
        }
    };
    assert_rc_ok(&op(grid_lite::rpc::SuspendOp::Suspend).await);
    assert_eq!(h.job_base(job_id).await, JobBase::Suspended);

    // A plain user cannot suspend.
    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSuspend,
            Body::Suspend(grid_lite::rpc::SuspendReq {
                job_id,
                op: grid_lite::rpc::SuspendOp::Resume,
            }),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::AccessDenied.wire_code());

    assert_rc_ok(&op(grid_lite::rpc::SuspendOp::Resume).await);
    assert_eq!(h.job_base(job_id).await, JobBase::Running);
}

/// Full wire roundtrip: framed TCP server, token auth, JSON codec.
#[tokio::test]
async fn framed_server_roundtrip() {
    let h = TestController::new(1, 4).await;
    let ctl = h.ctl.clone();

    let server = RpcServer::bind(ctl.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let bound = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let auth = TokenAuth::new("harness-key");
    let token = auth.make_token(USER_A, USER_A);
    let mut client = RpcClient::connect(bound, token).await.unwrap();

    let resp = client
        .call(&JsonCodec, &Message::request(MsgType::RequestPing, Body::Empty))
        .await
        .unwrap();
    assert_eq!(rc_of(&resp), 0);

    // A forged token is rejected per-message.
    let bad = TokenAuth::new("wrong-key").make_token(USER_A, USER_A);
    let mut client = RpcClient::connect(bound, bad).await.unwrap();
    let resp = client
        .call(&JsonCodec, &Message::request(MsgType::RequestPing, Body::Empty))
        .await
        .unwrap();
    assert_eq!(rc_of(&resp), SchedError::CredentialInvalid.wire_code());
}

/// Requeue resets a running batch job and survives an operator requeue
/// without spending the restart budget.
#[tokio::test]
async fn admin_requeue_preserves_budget() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;
    let (job_id, nodes) = h.start_batch_job(USER_A, 2).await;

    let resp = h
        .rpc(
            600, // operator
            MsgType::RequestJobRequeue,
            Body::Requeue(grid_lite::rpc::RequeueReq {
                job_id,
                hold: false,
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert!(h.job_is_completing(job_id).await);

    for node in &nodes {
        h.rpc(
            DAEMON_UID,
            MsgType::MessageEpilogComplete,
            Body::EpilogComplete(grid_lite::rpc::EpilogCompleteMsg {
                job_id,
                node_name: node.clone(),
                return_code: 0,
            }),
        )
        .await;
    }
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);
    let guard = h.ctl.state.acquire(grid_lite::locks::sets::JOB_READ).await;
    assert_eq!(guard.jobs.get().get(job_id).unwrap().restart_cnt, 0);
}
