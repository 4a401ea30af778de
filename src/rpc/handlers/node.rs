//! Node-origin and node-admin handlers: registration, state updates, and
//! reboot scheduling.

use std::sync::Arc;

use crate::controller::{split_guard, Controller};
use crate::error::Result;
use crate::locks::sets;
use crate::rpc::{
    Message, NodeRegistrationMsg, NodeStateUpdate, RebootNodesReq, ReturnCode, UpdateNodeReq,
};

/// Validates a node self-report and reconciles its job view.
pub async fn node_registration(
    ctl: &Arc<Controller>,
    req: &NodeRegistrationMsg,
) -> Result<Message> {
    let now = ctl.now();
    let mut guard = ctl.state.acquire(sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let outcome = {
        let split = split_guard(&mut guard);
        crate::health::register_node(split.jobs, split.nodes, &config, &ctl.agent, req, now)?
    };
    drop(guard);

    tracing::debug!(node = %req.node_name, newly_up = outcome.newly_up, "node registration");
    if outcome.newly_up {
        ctl.kick_scheduler().await;
        ctl.request_node_save();
    }
    Ok(Message::return_code(ReturnCode::success()))
}

/// Admin node state update: drain, resume, down.
pub async fn update_node(ctl: &Arc<Controller>, req: &UpdateNodeReq) -> Result<Message> {
    let mut guard = ctl.state.acquire(sets::NODE_WRITE).await;
    let nodes = guard.nodes.get_mut();
    // Validate all names before touching anything.
    for name in &req.node_names {
        nodes.get(name)?;
    }
    for name in &req.node_names {
        let node = nodes.get_mut(name)?;
        match &req.update {
            NodeStateUpdate::Drain { reason } => node.drain(reason),
            NodeStateUpdate::Down { reason } => node.set_down(reason),
            NodeStateUpdate::Resume => {
                node.undrain();
                node.set_maint(false);
            }
        }
    }
    drop(guard);

    if matches!(req.update, NodeStateUpdate::Resume) {
        ctl.kick_scheduler().await;
    }
    if matches!(req.update, NodeStateUpdate::Down { .. }) {
        for name in &req.node_names {
            ctl.ports.acct.node_down(name, "admin down").await;
        }
    }
    ctl.request_node_save();
    Ok(Message::return_code(ReturnCode::success()))
}

/// Maint-flags eligible nodes and queues reboot signals.
pub async fn reboot_nodes(ctl: &Arc<Controller>, req: &RebootNodesReq) -> Result<Message> {
    let mut guard = ctl.state.acquire(sets::NODE_WRITE).await;
    let count =
        crate::health::reboot_nodes(guard.nodes.get_mut(), &ctl.agent, &req.node_names)?;
    drop(guard);

    tracing::info!(count, "reboot scheduled");
    ctl.request_node_save();
    Ok(Message::return_code(ReturnCode::success()))
}
