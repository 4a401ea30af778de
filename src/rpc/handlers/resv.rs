//! Reservation and partition administration.

use std::sync::Arc;

use crate::config::PartitionDef;
use crate::controller::Controller;
use crate::error::{Result, SchedError};
use crate::locks::sets;
use crate::rpc::{Body, Message, MsgType, NameReq, ResvDescReq, ReturnCode};
use crate::state::{Partition, Reservation, ResvFlags};

fn build_reservation(
    req: &ResvDescReq,
    nodes: &crate::state::NodeStore,
) -> Result<Reservation> {
    let node_bitmap = nodes.bitmap_of(&req.node_names)?;
    Ok(Reservation {
        name: req.name.clone(),
        node_names: req.node_names.clone(),
        node_bitmap,
        start_time: req.start_time,
        end_time: req.end_time,
        users: req.users.clone(),
        accounts: req.accounts.clone(),
        flags: ResvFlags {
            maint: req.maint,
            exclusive: req.exclusive,
        },
    })
}

pub async fn create_reservation(ctl: &Arc<Controller>, req: &ResvDescReq) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::PART_WRITE).await;
    let resv = build_reservation(req, guard.nodes.get())?;
    guard.parts.get_mut().create_resv(resv, now)?;
    drop(guard);

    tracing::info!(name = %req.name, "reservation created");
    ctl.request_resv_save();
    Ok(Message::response(
        MsgType::ResponseCreateReservation,
        Body::Name(NameReq {
            name: req.name.clone(),
        }),
    ))
}

pub async fn update_reservation(ctl: &Arc<Controller>, req: &ResvDescReq) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::PART_WRITE).await;
    let resv = build_reservation(req, guard.nodes.get())?;
    guard.parts.get_mut().update_resv(resv, now)?;
    drop(guard);

    tracing::info!(name = %req.name, "reservation updated");
    ctl.request_resv_save();
    Ok(Message::return_code(ReturnCode::success()))
}

pub async fn delete_reservation(ctl: &Arc<Controller>, req: &NameReq) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::PART_WRITE).await;
    guard.parts.get_mut().delete_resv(&req.name, now)?;
    drop(guard);

    tracing::info!(name = %req.name, "reservation deleted");
    ctl.request_resv_save();
    ctl.kick_scheduler().await;
    Ok(Message::return_code(ReturnCode::success()))
}

/// Create-or-update for partitions; both RPCs land here, as the update
/// message is a full description.
pub async fn update_partition(ctl: &Arc<Controller>, req: &PartitionDef) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::PART_WRITE).await;
    let bitmap = guard.nodes.get().bitmap_of(&req.nodes)?;
    let part = Partition::from_def(req, bitmap);
    guard.parts.get_mut().insert(part, now);
    drop(guard);

    tracing::info!(name = %req.name, "partition updated");
    ctl.request_part_save();
    ctl.kick_scheduler().await;
    Ok(Message::return_code(ReturnCode::success()))
}

/// Deletes a partition after checking no live job still references it.
pub async fn delete_partition(ctl: &Arc<Controller>, req: &NameReq) -> Result<Message> {
    let now = ctl.now();
    // Job read is needed for the liveness check, so take both axes.
    let lockset = crate::locks::LockSet::new(
        crate::locks::LockLevel::Read,
        crate::locks::LockLevel::Read,
        crate::locks::LockLevel::None,
        crate::locks::LockLevel::Write,
    );
    let mut guard = ctl.state.acquire(lockset).await;
    {
        let jobs = guard.jobs.get();
        let live = jobs
            .ids_for_partition(&req.name)
            .iter()
            .filter_map(|&id| jobs.find(id))
            .any(|j| !j.is_completed());
        if live {
            return Err(SchedError::ResourceBusy);
        }
    }
    guard.parts.get_mut().delete(&req.name, now)?;
    drop(guard);

    tracing::info!(name = %req.name, "partition deleted");
    ctl.request_part_save();
    Ok(Message::return_code(ReturnCode::success()))
}
