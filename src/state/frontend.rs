//! Front-end records: proxy daemons owning several compute nodes.
//!
//! In front-end dispatch mode, launch and kill traffic targets the front
//! end instead of each node. Front ends are stored apart from the node
//! table but reuse its state vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FrontEndDef;
use crate::state::node::{NodeBase, NodeFlags};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontEndRecord {
    pub name: String,
    pub addr: Option<String>,
    /// Names of the compute nodes this front end owns.
    pub node_names: Vec<String>,
    base: NodeBase,
    flags: NodeFlags,
    pub reason: Option<String>,
    pub last_registration: Option<DateTime<Utc>>,
    /// Jobs whose traffic currently routes through this front end.
    pub job_cnt: u32,
}

impl FrontEndRecord {
    pub fn from_def(def: &FrontEndDef) -> Self {
        Self {
            name: def.name.clone(),
            addr: def.addr.clone(),
            node_names: def.nodes.clone(),
            base: NodeBase::Unknown,
            flags: NodeFlags::default(),
            reason: None,
            last_registration: None,
            job_cnt: 0,
        }
    }

    pub fn base(&self) -> NodeBase {
        self.base
    }

    pub fn owns(&self, node_name: &str) -> bool {
        self.node_names.iter().any(|n| n == node_name)
    }

    pub fn registered(&mut self, now: DateTime<Utc>) {
        self.flags.remove(NodeFlags::NO_RESPOND);
        self.last_registration = Some(now);
        if matches!(self.base, NodeBase::Unknown | NodeBase::Down) {
            self.base = NodeBase::Idle;
        }
    }

    pub fn drain(&mut self, reason: &str) {
        self.flags.insert(NodeFlags::DRAIN);
        self.reason = Some(reason.to_string());
    }

    pub fn is_drained_or_draining(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN)
    }

    pub fn job_started(&mut self) {
        self.job_cnt += 1;
        self.base = NodeBase::Allocated;
    }

    pub fn job_finished(&mut self) {
        self.job_cnt = self.job_cnt.saturating_sub(1);
        if self.job_cnt == 0 && self.base == NodeBase::Allocated {
            self.base = NodeBase::Idle;
        }
    }
}
