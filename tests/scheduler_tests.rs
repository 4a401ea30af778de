//! Scheduling pipeline behavior: admission, ordering, filtering, defer
//! mode, and the will-run probe.


use grid_lite::error::SchedError;
use grid_lite::locks::sets;
use grid_lite::rpc::{Body, MsgType};
use grid_lite::state::{JobBase, PendReason};
use test_harness::*;

/// Immediate allocation on a full cluster fails fast and keeps no record.
#[tokio::test]
async fn immediate_allocate_without_capacity() {
    let h = TestController::new(1, 4).await;
    h.register_all_nodes().await;

    // Fill the single node completely.
    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestResourceAllocation,
            Body::JobSubmit(alloc_request(USER_A, 1, 4, true)),
        )
        .await;
    match resp.body {
        Body::ResourceAllocation(ref r) => {
            assert_eq!(r.error_code, 0);
            assert_eq!(r.node_cnt, 1);
        }
        ref other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(h.job_count().await, 1);

    // Second immediate request cannot start and leaves nothing behind.
    let resp = h
        .rpc(
            USER_B,
            MsgType::RequestResourceAllocation,
            Body::JobSubmit(alloc_request(USER_B, 1, 4, true)),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::CanNotStartImmediately.wire_code());
    assert_eq!(h.job_count().await, 1);
}

/// Non-immediate allocation without capacity is accepted Pending with a
/// reason code.
#[tokio::test]
async fn deferred_allocate_stays_pending() {
    let h = TestController::new(1, 4).await;
    h.register_all_nodes().await;

    h.rpc(
        USER_A,
        MsgType::RequestResourceAllocation,
        Body::JobSubmit(alloc_request(USER_A, 1, 4, true)),
    )
    .await;

    let resp = h
        .rpc(
            USER_B,
            MsgType::RequestResourceAllocation,
            Body::JobSubmit(alloc_request(USER_B, 1, 4, false)),
        )
        .await;
    let job_id = match resp.body {
        Body::ResourceAllocation(ref r) => {
            assert_ne!(r.error_code, 0);
            assert!(r.pend_reason.is_some());
            r.job_id
        }
        ref other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);
    {
        let guard = h.ctl.state.acquire(sets::JOB_READ).await;
        assert_eq!(
            guard.jobs.get().get(job_id).unwrap().reason,
            PendReason::Resources
        );
    }
}

/// Higher-priority partitions and ages win; ties break by age.
#[tokio::test]
async fn pending_jobs_start_in_priority_order() {
    let h = TestController::new(1, 4).await;
    h.register_all_nodes().await;

    // Two pending jobs on an idle single node; only one fits at a time.
    let first = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit({
                let mut s = batch_submit(USER_A, 1);
                s.request.min_cpus = 4;
                s
            }),
        )
        .await;
    let second = h
        .rpc(
            USER_B,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit({
                let mut s = batch_submit(USER_B, 1);
                s.request.min_cpus = 4;
                s
            }),
        )
        .await;
    let first_id = match first.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    let second_id = match second.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };

    // Equal priority: the older job starts first.
    assert_eq!(h.ctl.run_schedule_pass().await, 1);
    assert_eq!(h.job_base(first_id).await, JobBase::Running);
    assert_eq!(h.job_base(second_id).await, JobBase::Pending);
}

/// Held jobs are skipped by the pass and keep their reason.
#[tokio::test]
async fn held_jobs_do_not_schedule() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit({
                let mut s = batch_submit(USER_A, 1);
                s.hold = true;
                s
            }),
        )
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    assert_eq!(h.ctl.run_schedule_pass().await, 0);
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);
}

/// Feature constraints restrict candidate nodes.
#[tokio::test]
async fn feature_filter_restricts_selection() {
    let mut config = test_config(2, 8);
    config.nodes[1].features = vec!["gpu".into()];
    let h = TestController::with_config(config).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit({
                let mut s = batch_submit(USER_A, 1);
                s.request.features = vec!["gpu".into()];
                s
            }),
        )
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    h.ctl.run_schedule_pass().await;
    assert_eq!(h.job_node_names(job_id).await, vec!["n2".to_string()]);
}

/// Drained nodes never receive new work.
#[tokio::test]
async fn drained_node_excluded_from_selection() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestUpdateNode,
            Body::UpdateNode(grid_lite::rpc::UpdateNodeReq {
                node_names: vec!["n1".into()],
                update: grid_lite::rpc::NodeStateUpdate::Drain {
                    reason: "maintenance".into(),
                },
            }),
        )
        .await;
    assert_rc_ok(&resp);

    let (job_id, _) = h.start_batch_job(USER_A, 1).await;
    assert_eq!(h.job_node_names(job_id).await, vec!["n2".to_string()]);
}

/// Will-run probe commits nothing.
#[tokio::test]
async fn will_run_is_side_effect_free() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestJobWillRun,
            Body::JobSubmit(batch_submit(USER_A, 2)),
        )
        .await;
    match resp.body {
        Body::WillRun(ref r) => assert_eq!(r.node_list.len(), 2),
        ref other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(h.job_count().await, 0);
    for name in ["n1", "n2"] {
        assert_eq!(h.node_base(name).await, grid_lite::state::NodeBase::Idle);
    }
}

/// Defer mode swallows kicks; only the timer drives passes.
#[tokio::test]
async fn defer_mode_ignores_kicks() {
    let mut config = test_config(1, 4);
    config.sched_defer = true;
    let h = TestController::with_config(config).await;
    h.register_all_nodes().await;

    // kick_scheduler is a no-op in defer mode; the notify stays unset.
    h.ctl.kick_scheduler().await;
    let waited = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        h.ctl.sched.kicker.wait(),
    )
    .await;
    assert!(waited.is_err(), "kick fired despite defer mode");
}

/// A newly registered node wakes pending work.
#[tokio::test]
async fn registration_unblocks_pending_job() {
    let h = TestController::new(1, 4).await;

    // No nodes registered yet: submission stays pending.
    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestSubmitBatchJob,
            Body::JobSubmit(batch_submit(USER_A, 1)),
        )
        .await;
    let job_id = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    assert_eq!(h.ctl.run_schedule_pass().await, 0);
    assert_eq!(h.job_base(job_id).await, JobBase::Pending);

    h.register_all_nodes().await;
    assert_eq!(h.ctl.run_schedule_pass().await, 1);
    assert_eq!(h.job_base(job_id).await, JobBase::Running);
}
