//! Reservation manager behavior through the admin RPCs, and the gates it
//! imposes on scheduling.


use chrono::{Duration, Utc};
use grid_lite::error::SchedError;
use grid_lite::rpc::{Body, InfoReq, MsgType, NameReq, ResvDescReq};
use grid_lite::state::JobBase;
use test_harness::*;

fn resv(name: &str, nodes: &[&str], users: &[u32], start_h: i64, end_h: i64) -> ResvDescReq {
    let now = Utc::now();
    ResvDescReq {
        name: name.into(),
        node_names: nodes.iter().map(|s| s.to_string()).collect(),
        start_time: now + Duration::hours(start_h),
        end_time: now + Duration::hours(end_h),
        users: users.to_vec(),
        accounts: vec![],
        maint: false,
        exclusive: true,
    }
}

#[tokio::test]
async fn create_update_delete_cycle() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("weekly", &["n1"], &[USER_A], 0, 2)),
        )
        .await;
    match resp.body {
        Body::Name(ref n) => assert_eq!(n.name, "weekly"),
        ref other => panic!("unexpected response {other:?}"),
    }

    // Update grows the window.
    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestUpdateReservation,
            Body::ResvDesc(resv("weekly", &["n1"], &[USER_A], 0, 4)),
        )
        .await;
    assert_rc_ok(&resp);

    let resp = h
        .rpc(
            USER_A,
            MsgType::RequestReservationInfo,
            Body::Info(InfoReq::default()),
        )
        .await;
    match resp.body {
        Body::ReservationInfo(ref r) => {
            assert_eq!(r.reservations.len(), 1);
            assert_eq!(r.reservations[0].nodes, vec!["n1".to_string()]);
        }
        ref other => panic!("unexpected response {other:?}"),
    }

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestDeleteReservation,
            Body::Name(NameReq {
                name: "weekly".into(),
            }),
        )
        .await;
    assert_rc_ok(&resp);

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestDeleteReservation,
            Body::Name(NameReq {
                name: "weekly".into(),
            }),
        )
        .await;
    assert_ne!(rc_of(&resp), 0);
}

#[tokio::test]
async fn overlapping_users_rejected() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("a", &["n1"], &[USER_A, USER_B], 0, 3)),
        )
        .await;
    match resp.body {
        Body::Name(_) => {}
        ref other => panic!("unexpected response {other:?}"),
    }

    // Same node, overlapping window, crossing user sets.
    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("b", &["n1"], &[USER_B, 999], 1, 4)),
        )
        .await;
    assert_eq!(rc_of(&resp), SchedError::ReservationBusy.wire_code());

    // Disjoint users on the same node are fine.
    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("c", &["n1"], &[777], 1, 4)),
        )
        .await;
    match resp.body {
        Body::Name(_) => {}
        ref other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn past_reservation_needs_maint() {
    let h = TestController::new(1, 4).await;
    h.register_all_nodes().await;

    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("old", &["n1"], &[], -4, -2)),
        )
        .await;
    assert_ne!(rc_of(&resp), 0);

    let mut desc = resv("maintwin", &["n1"], &[], -4, -2);
    desc.maint = true;
    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(desc),
        )
        .await;
    match resp.body {
        Body::Name(_) => {}
        ref other => panic!("unexpected response {other:?}"),
    }
}

/// An active reservation blocks non-admitted users from its nodes; an
/// admitted user who requests it schedules inside it.
#[tokio::test]
async fn scheduler_honors_reservation_gates() {
    let h = TestController::new(2, 8).await;
    h.register_all_nodes().await;

    // n1 reserved for USER_B, active now.
    let resp = h
        .rpc(
            ADMIN_UID,
            MsgType::RequestCreateReservation,
            Body::ResvDesc(resv("hold", &["n1"], &[USER_B], -1, 4)),
        )
        .await;
    match resp.body {
        Body::Name(_) => {}
        ref other => panic!("unexpected response {other:?}"),
    }

    // USER_A lands on n2.
    let (job_a, _) = h.start_batch_job(USER_A, 1).await;
    assert_eq!(h.job_node_names(job_a).await, vec!["n2".to_string()]);

    // USER_B requests the reservation explicitly and lands on n1.
    let mut submit = batch_submit(USER_B, 1);
    submit.request.reservation = Some("hold".into());
    let resp = h
        .rpc(USER_B, MsgType::RequestSubmitBatchJob, Body::JobSubmit(submit))
        .await;
    let job_b = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    h.ctl.run_schedule_pass().await;
    assert_eq!(h.job_base(job_b).await, JobBase::Running);
    assert_eq!(h.job_node_names(job_b).await, vec!["n1".to_string()]);

    // USER_A cannot ride someone else's reservation.
    let mut submit = batch_submit(USER_A, 1);
    submit.request.reservation = Some("hold".into());
    let resp = h
        .rpc(USER_A, MsgType::RequestSubmitBatchJob, Body::JobSubmit(submit))
        .await;
    let job_c = match resp.body {
        Body::SubmitBatch(ref r) => r.job_id,
        _ => unreachable!(),
    };
    assert_eq!(h.ctl.run_schedule_pass().await, 0);
    assert_eq!(h.job_base(job_c).await, JobBase::Pending);
}
