//! End-to-end lifecycle scenarios: submit → run → complete, requeue on
//! epilog failure, and duplicate step-completion idempotence.


use grid_lite::agent::AgentPayload;
use grid_lite::error::SchedError;
use grid_lite::rpc::{
    Body, CompleteBatchReq, EpilogCompleteMsg, MsgType, StepCompleteReq, StepCreateReq,
};
use grid_lite::state::{JobBase, NodeBase};
use test_harness::*;

/// Full batch lifecycle over two of four nodes.
#[tokio::test]
async fn submit_run_complete_lifecycle() {
    let h = TestController::new(4, 8).await;
    h.register_all_nodes().await;

    // Submit and schedule.
    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit(batch_submit(USER_A, 2)),
        )
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => {
            assert_eq!(r.error_code, 0);
            r.job_id
        }
        ref other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);

    h.clear_sent();
    assert_eq!(h.ctl.run_schedule_pass().await, 1);
    assert_eq!(h.job_base(job_id).await, JobBase::Running);
    assert!(h.job_is_configuring(job_id).await);

    let nodes = h.job_node_names(job_id).await;
    assert_eq!(nodes.len(), 2);
    for name in &nodes {
        assert_ne!(h.node_base(name).await, NodeBase::Idle);
    }

    // Prolog launch went to both selected nodes, batch launch to the host.
    let sent = h.sent_messages();
    assert_eq!(
        count_payloads(&sent, |p| matches!(p, AgentPayload::PrologLaunch { .. })),
        2
    );
    assert_eq!(
        count_payloads(&sent, |p| matches!(p, AgentPayload::BatchLaunch { .. })),
        1
    );

    // Prolog completions clear Configuring.
    for node in &nodes {
        let resp = h
            .rpc(
                DAEMON_UID,
                MsgType::RequestCompleteProlog,
                Body::CompleteProlog(grid_lite::rpc::CompletePrologReq {
                    job_id,
                    node_name: node.clone(),
                    prolog_rc: 0,
                }),
            )
            .await;
        assert_rc_ok(&resp);
    }
    assert!(!h.job_is_configuring(job_id).await);

    // Batch completes cleanly; job terminal with Completing.
    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestCompleteBatchScript,
            Body::CompleteBatch(CompleteBatchReq {
                job_id,
                node_name: nodes[0].clone(),
                script_rc: 0,
                daemon_rc: 0,
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert_eq!(h.job_base(job_id).await, JobBase::Complete);
    assert!(h.job_is_completing(job_id).await);

    // Epilogs clear Completing and free the nodes.
    for node in &nodes {
        let resp = h
            .rpc(
                DAEMON_UID,
                MsgType::MessageEpilogComplete,
                Body::EpilogComplete(EpilogCompleteMsg {
                    job_id,
                    node_name: node.clone(),
                    return_code: 0,
                }),
            )
            .await;
        assert_rc_ok(&resp);
    }
    assert!(!h.job_is_completing(job_id).await);
    for name in &nodes {
        assert_eq!(h.node_base(name).await, NodeBase::Idle);
    }
}

/// An epilog failure on the batch host requeues a requeue-eligible job and
/// drains the node.
#[tokio::test]
async fn requeue_on_epilog_failure() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let mut submit = batch_submit(USER_A, 2);
    submit.requeue = true;
    let resp = h
        .rpc(USER_A, MsgType::RequestSubmitBatchJob, Body::JobSubmit(submit))
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        ref other => panic!("unexpected response {other:?}"),
    };
    h.ctl.run_schedule_pass().await;
    let nodes = h.job_node_names(job_id).await;
    assert_eq!(nodes.len(), 2);

    // Batch script fails on the host.
    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestCompleteBatchScript,
            Body::CompleteBatch(CompleteBatchReq {
                job_id,
                node_name: nodes[0].clone(),
                script_rc: 5,
                daemon_rc: 0,
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert!(h.job_is_completing(job_id).await);

    // Epilog on the host reports failure, the peer is clean.
    for (node, rc) in [(&nodes[0], 5), (&nodes[1], 0)] {
        let resp = h
            .rpc(
                DAEMON_UID,
                MsgType::MessageEpilogComplete,
                Body::EpilogComplete(EpilogCompleteMsg {
                    job_id,
                    node_name: node.clone(),
                    return_code: rc,
                }),
            )
            .await;
        assert_rc_ok(&resp);
    }

    // Requeued: Pending again with one restart consumed; the failing node
    // is drained.
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);
    assert!(!h.job_is_completing(job_id).await);
    {
        let guard = h.ctl.state.acquire(grid_lite::locks::sets::JOB_READ).await;
        assert_eq!(guard.jobs.get().get(job_id).unwrap().restart_cnt, 1);
    }
    assert!(h.node_drained(&nodes[0]).await);
    assert!(!h.node_drained(&nodes[1]).await);
}

/// Duplicate step-complete ranges are acknowledged as no-ops.
#[tokio::test]
async fn duplicate_step_complete_range() {
    let h = TestController::new(4, 8).await;
    h.register_all_nodes().await;
    let (job_id, _nodes) = h.start_batch_job(USER_A, 4).await;

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestJobStepCreate,
            Body::StepCreate(StepCreateReq {
                job_id,
                user_id: USER_A,
                name: "mpi".into(),
                node_cnt: 4,
                task_cnt: 4,
                cpus_per_task: 1,
                mem_per_node_mb: 0,
                want_ports: false,
            }),
        )
        .await;
    let step_id = match resp.body {
        Body::StepCreateResp(ref r) => {
            assert_eq!(r.node_list.len(), 4);
            r.step_id
        }
        ref other => panic!("unexpected response {other:?}"),
    };

    let complete = |first: u32, last: u32| StepCompleteReq {
        job_id,
        step_id,
        range_first: first,
        range_last: last,
        step_rc: 0,
    };

    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestStepComplete,
            Body::StepComplete(complete(0, 1)),
        )
        .await;
    assert_rc_ok(&resp);
    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestStepComplete,
            Body::StepComplete(complete(2, 3)),
        )
        .await;
    assert_rc_ok(&resp);

    // Step finalized; the replayed first range is AlreadyDone and changes
    // nothing.
    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestStepComplete,
            Body::StepComplete(complete(0, 1)),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::AlreadyDone.wire_code());
    assert_eq!(h.job_base(job_id).await, JobBase::Running);
}

/// A partially-complete step rejects a replayed range without losing the
/// outstanding nodes.
#[tokio::test]
async fn duplicate_range_before_finalize() {
    let h = TestController::new(4, 8).await;
    h.register_all_nodes().await;
    let (job_id, _nodes) = h.start_batch_job(USER_A, 4).await;

    h.rpc(
        USER_A,
        MsgType::RequestJobStepCreate,
        Body::StepCreate(StepCreateReq {
            job_id,
            user_id: USER_A,
            name: "s".into(),
            node_cnt: 4,
            task_cnt: 4,
            cpus_per_task: 1,
            mem_per_node_mb: 0,
            want_ports: false,
        }),
    )
    .await;

    let send = |first: u32, last: u32| {
        let h = &h;
        async move {
            h.rpc(
                DAEMON_UID,
                MsgType::RequestStepComplete,
                Body::StepComplete(StepCompleteReq {
                    job_id,
                    step_id: 0,
                    range_first: first,
                    range_last: last,
                    step_rc: 0,
                }),
            )
            .await
        }
    };

    assert_rc_ok(&send(0, 1).await);
    let dup = send(0, 1).await;
    assert_eq!(rc_of(&dup), SchedError::AlreadyDone.wire_code());

    // The step is still live with two nodes outstanding.
    let guard = h.ctl.state.acquire(grid_lite::locks::sets::JOB_READ).await;
    let job = guard.jobs.get().get(job_id).unwrap();
    assert_eq!(job.steps.get(&0).unwrap().nodes_remaining(), 2);
}

/// Batch completion from a node other than the batch host is discarded.
#[tokio::test]
async fn batch_complete_from_wrong_node() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;
    let (job_id, nodes) = h.start_batch_job(USER_A, 2).await;

    let wrong = nodes.iter().find(|n| *n != &nodes[0]).unwrap();
    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestCompleteBatchScript,
            Body::CompleteBatch(CompleteBatchReq {
                job_id,
                node_name: wrong.clone(),
                script_rc: 0,
                daemon_rc: 0,
            }),
        )
        .await;
    assert_ne!(rc_of(&resp), 0);
    // Job is untouched.
    assert_eq!(h.job_base(job_id).await, JobBase::Running);
}

/// A failing daemon verdict drains the reporting node.
#[tokio::test]
async fn batch_failure_drains_node() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;
    let (job_id, nodes) = h.start_batch_job(USER_A, 1).await;

    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestCompleteBatchScript,
            Body::CompleteBatch(CompleteBatchReq {
                job_id,
                node_name: nodes[0].clone(),
                script_rc: 1,
                daemon_rc: 9999, // not transient, not logged-only
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert!(h.node_drained(&nodes[0]).await);
    assert_eq!(h.job_base(job_id).await, JobBase::Failed);
}

/// Prolog failure drains the node and fails the job over.
#[tokio::test]
async fn prolog_failure_fails_job_over() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit(batch_submit(USER_A, 2)),
        )
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        ref other => panic!("unexpected response {other:?}"),
    };
    h.ctl.run_schedule_pass().await;
    let nodes = h.job_node_names(job_id).await;

    let resp = h
        .rpc(
            DAEMON_UID,
            MsgType::RequestCompleteProlog,
            Body::CompleteProlog(grid_lite::rpc::CompletePrologReq {
                job_id,
                node_name: nodes[0].clone(),
                prolog_rc: 1,
            }),
        )
        .await;
    assert_rc_ok(&resp);
    assert_eq!(h.job_base(job_id).await, JobBase::NodeFail);
    assert!(h.node_drained(&nodes[0]).await);
}
