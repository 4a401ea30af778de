//! Node records and the node state machine.
//!
//! A node has a base state and orthogonal flags. Nodes are created from the
//! configuration at startup and never destroyed at runtime; registrations,
//! admin updates, and job completions drive the transitions through the
//! mutators here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NodeDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeBase {
    Unknown,
    Down,
    Idle,
    Allocated,
    Error,
    Mixed,
    Future,
}

impl std::fmt::Display for NodeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeBase::Unknown => "unknown",
            NodeBase::Down => "down",
            NodeBase::Idle => "idle",
            NodeBase::Allocated => "allocated",
            NodeBase::Error => "error",
            NodeBase::Mixed => "mixed",
            NodeBase::Future => "future",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeFlags(u16);

impl NodeFlags {
    pub const DRAIN: NodeFlags = NodeFlags(0x0001);
    pub const COMPLETING: NodeFlags = NodeFlags(0x0002);
    pub const NO_RESPOND: NodeFlags = NodeFlags(0x0004);
    pub const POWER_SAVE: NodeFlags = NodeFlags(0x0008);
    pub const POWER_UP: NodeFlags = NodeFlags(0x0010);
    pub const FAIL: NodeFlags = NodeFlags(0x0020);
    pub const MAINT: NodeFlags = NodeFlags(0x0040);
    pub const CLOUD: NodeFlags = NodeFlags(0x0080);

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// Hardware shape a node reports at registration, compared against the
/// configured definition unless fast-schedule mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    pub boards: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    pub cpus: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Position in the node table; bit index in every node bitmap.
    pub index: usize,
    pub name: String,
    pub addr: Option<String>,
    pub topology: NodeTopology,
    pub real_memory_mb: u64,
    pub tmp_disk_mb: u64,
    pub features: Vec<String>,
    pub weight: u32,
    pub core_spec_cnt: u16,

    base: NodeBase,
    flags: NodeFlags,
    pub reason: Option<String>,

    pub last_registration: Option<DateTime<Utc>>,
    pub boot_time: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub cpu_load: Option<f32>,

    /// Jobs currently allocated here, with their CPU share.
    pub running_jobs: HashMap<u32, u32>,
    /// Jobs whose epilog is still running here, with the CPU share they
    /// hold until it finishes.
    pub completing_jobs: HashMap<u32, u32>,
}

impl NodeRecord {
    pub fn from_def(index: usize, def: &NodeDef) -> Self {
        Self {
            index,
            name: def.name.clone(),
            addr: def.addr.clone(),
            topology: NodeTopology {
                boards: def.boards,
                sockets: def.sockets,
                cores_per_socket: def.cores_per_socket,
                threads_per_core: def.threads_per_core,
                cpus: def.cpus,
            },
            real_memory_mb: def.real_memory_mb,
            tmp_disk_mb: def.tmp_disk_mb,
            features: def.features.clone(),
            weight: def.weight,
            core_spec_cnt: def.core_spec_cnt,
            base: NodeBase::Unknown,
            flags: NodeFlags::default(),
            reason: None,
            last_registration: None,
            boot_time: None,
            version: None,
            cpu_load: None,
            running_jobs: HashMap::new(),
            completing_jobs: HashMap::new(),
        }
    }

    pub fn base(&self) -> NodeBase {
        self.base
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    // Predicates.

    pub fn is_drained_or_draining(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN)
    }

    /// Drain flag set while work is still present.
    pub fn is_draining(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN)
            && matches!(
                self.base,
                NodeBase::Allocated | NodeBase::Error | NodeBase::Mixed
            )
    }

    /// Drain flag set and the node is quiet.
    pub fn is_drained(&self) -> bool {
        self.flags.contains(NodeFlags::DRAIN) && !self.is_draining()
    }

    pub fn is_no_respond(&self) -> bool {
        self.flags.contains(NodeFlags::NO_RESPOND)
    }

    pub fn is_maint(&self) -> bool {
        self.flags.contains(NodeFlags::MAINT)
    }

    /// Eligible to receive new allocations.
    pub fn available_for_alloc(&self) -> bool {
        if self.is_drained_or_draining()
            || self.is_no_respond()
            || self.is_maint()
            || self.flags.contains(NodeFlags::FAIL)
        {
            return false;
        }
        matches!(self.base, NodeBase::Idle | NodeBase::Mixed)
    }

    /// CPUs not yet claimed by running or still-completing jobs, minus the
    /// specialized-core reservation.
    pub fn idle_cpus(&self) -> u32 {
        let claimed: u32 = self
            .running_jobs
            .values()
            .chain(self.completing_jobs.values())
            .sum();
        self.topology
            .cpus
            .saturating_sub(claimed)
            .saturating_sub(self.core_spec_cnt as u32)
    }

    // Mutators.

    /// Registration succeeded: the node is responsive and its state derives
    /// from the work it carries.
    pub fn registered(&mut self, now: DateTime<Utc>, boot_time: Option<DateTime<Utc>>) -> bool {
        let was_unreachable = matches!(self.base, NodeBase::Unknown | NodeBase::Down | NodeBase::Future)
            || self.is_no_respond();
        self.flags.remove(NodeFlags::NO_RESPOND);
        self.last_registration = Some(now);
        if boot_time.is_some() {
            self.boot_time = boot_time;
        }
        if matches!(self.base, NodeBase::Unknown | NodeBase::Down | NodeBase::Future) {
            self.base = if self.running_jobs.is_empty() {
                NodeBase::Idle
            } else {
                NodeBase::Allocated
            };
            tracing::info!(node = %self.name, state = %self.base, "node registered");
        }
        was_unreachable
    }

    /// Binds a job and its CPU share to the node. Mixed means CPUs remain
    /// for other jobs; Allocated means the node is full.
    pub fn allocate_job(&mut self, job_id: u32, cpus: u32) {
        self.running_jobs.insert(job_id, cpus);
        self.base = if self.idle_cpus() > 0 {
            NodeBase::Mixed
        } else {
            NodeBase::Allocated
        };
    }

    /// Job termination started: epilog is now expected from this node. The
    /// CPU share stays claimed until it reports.
    pub fn begin_completing(&mut self, job_id: u32) {
        if let Some(cpus) = self.running_jobs.remove(&job_id) {
            self.completing_jobs.insert(job_id, cpus);
            self.flags.insert(NodeFlags::COMPLETING);
        }
    }

    /// Epilog for `job_id` finished here. Last job out returns the node to
    /// Idle (Drain flag leaves it drained instead).
    pub fn epilog_complete(&mut self, job_id: u32) {
        self.completing_jobs.remove(&job_id);
        self.running_jobs.remove(&job_id);
        if self.completing_jobs.is_empty() {
            self.flags.remove(NodeFlags::COMPLETING);
        }
        if matches!(self.base, NodeBase::Down | NodeBase::Error) {
            return;
        }
        if self.running_jobs.is_empty() && self.completing_jobs.is_empty() {
            self.base = NodeBase::Idle;
        } else if self.idle_cpus() > 0 {
            self.base = NodeBase::Mixed;
        } else {
            self.base = NodeBase::Allocated;
        }
    }

    pub fn drain(&mut self, reason: &str) {
        if !self.flags.contains(NodeFlags::DRAIN) {
            tracing::info!(node = %self.name, reason, "draining node");
        }
        self.flags.insert(NodeFlags::DRAIN);
        self.reason = Some(reason.to_string());
    }

    pub fn undrain(&mut self) {
        self.flags.remove(NodeFlags::DRAIN);
        self.reason = None;
    }

    pub fn set_no_respond(&mut self) {
        if !self.is_no_respond() {
            tracing::warn!(node = %self.name, "node not responding");
            self.flags.insert(NodeFlags::NO_RESPOND);
        }
    }

    pub fn set_down(&mut self, reason: &str) {
        if self.base != NodeBase::Down {
            tracing::warn!(node = %self.name, reason, "downing node");
        }
        self.base = NodeBase::Down;
        self.reason = Some(reason.to_string());
    }

    pub fn set_maint(&mut self, on: bool) {
        if on {
            self.flags.insert(NodeFlags::MAINT);
        } else {
            self.flags.remove(NodeFlags::MAINT);
        }
    }

    /// Carries runtime state from a prior incarnation of this node across
    /// a reconfigure or restore. Hardware shape stays config-defined.
    pub fn carry_runtime_state(&mut self, old: &NodeRecord) {
        self.base = old.base;
        self.flags = old.flags;
        self.reason = old.reason.clone();
        self.last_registration = old.last_registration;
        self.boot_time = old.boot_time;
        self.version = old.version.clone();
        self.cpu_load = old.cpu_load;
        self.running_jobs = old.running_jobs.clone();
        self.completing_jobs = old.completing_jobs.clone();
    }

    pub fn is_rebootable(&self) -> bool {
        !matches!(self.base, NodeBase::Down | NodeBase::Future)
            && !self.flags.contains(NodeFlags::POWER_SAVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeRecord {
        NodeRecord::from_def(
            0,
            &NodeDef {
                name: "n1".into(),
                addr: None,
                boards: 1,
                sockets: 2,
                cores_per_socket: 4,
                threads_per_core: 1,
                cpus: 8,
                real_memory_mb: 16384,
                tmp_disk_mb: 0,
                features: vec![],
                weight: 1,
                core_spec_cnt: 0,
            },
        )
    }

    #[test]
    fn registration_brings_node_up() {
        let mut n = node();
        assert_eq!(n.base(), NodeBase::Unknown);
        assert!(n.registered(Utc::now(), None));
        assert_eq!(n.base(), NodeBase::Idle);
        // A repeat registration is not "newly up".
        assert!(!n.registered(Utc::now(), None));
    }

    #[test]
    fn partial_allocation_goes_mixed() {
        let mut n = node();
        n.registered(Utc::now(), None);
        n.allocate_job(1, 4);
        assert_eq!(n.base(), NodeBase::Mixed);
        assert_eq!(n.idle_cpus(), 4);
        n.allocate_job(2, 4);
        assert_eq!(n.base(), NodeBase::Allocated);
        assert_eq!(n.idle_cpus(), 0);
    }

    #[test]
    fn epilog_returns_node_to_idle() {
        let mut n = node();
        n.registered(Utc::now(), None);
        n.allocate_job(1, 4);
        n.begin_completing(1);
        assert!(n.flags().contains(NodeFlags::COMPLETING));
        n.epilog_complete(1);
        assert_eq!(n.base(), NodeBase::Idle);
        assert!(!n.flags().contains(NodeFlags::COMPLETING));
    }

    #[test]
    fn drained_vs_draining() {
        let mut n = node();
        n.registered(Utc::now(), None);
        n.allocate_job(1, 4);
        n.drain("bad disk");
        assert!(n.is_draining());
        assert!(!n.is_drained());
        assert!(!n.available_for_alloc());
        n.begin_completing(1);
        n.epilog_complete(1);
        assert!(n.is_drained());
        assert!(!n.is_draining());
    }

    #[test]
    fn down_node_stays_down_through_epilog() {
        let mut n = node();
        n.registered(Utc::now(), None);
        n.allocate_job(1, 4);
        n.set_down("watchdog");
        n.begin_completing(1);
        n.epilog_complete(1);
        assert_eq!(n.base(), NodeBase::Down);
    }
}
