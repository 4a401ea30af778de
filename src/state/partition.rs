//! Partition records: named queueing buckets with scheduling policy.

use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::config::{PartitionDef, PreemptMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    #[default]
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub node_names: Vec<String>,
    pub node_bitmap: NodeBitmap,
    pub max_time_minutes: Option<u32>,
    pub default_time_minutes: Option<u32>,
    pub priority: u32,
    pub is_default: bool,
    pub allowed_users: Vec<u32>,
    pub allowed_accounts: Vec<String>,
    pub preempt_mode: PreemptMode,
    pub state: PartitionState,
}

impl Partition {
    pub fn from_def(def: &PartitionDef, node_bitmap: NodeBitmap) -> Self {
        Self {
            name: def.name.clone(),
            node_names: def.nodes.clone(),
            node_bitmap,
            max_time_minutes: def.max_time_minutes,
            default_time_minutes: def.default_time_minutes,
            priority: def.priority,
            is_default: def.is_default,
            allowed_users: def.allowed_users.clone(),
            allowed_accounts: def.allowed_accounts.clone(),
            preempt_mode: def.preempt_mode,
            state: PartitionState::Up,
        }
    }

    /// Empty allow-list admits everyone.
    pub fn user_allowed(&self, uid: u32) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&uid)
    }

    pub fn is_up(&self) -> bool {
        self.state == PartitionState::Up
    }

    /// Effective time limit for a request, clamped to the partition max.
    pub fn effective_time_limit(&self, requested_minutes: Option<u32>) -> Option<u32> {
        let limit = requested_minutes.or(self.default_time_minutes);
        match (limit, self.max_time_minutes) {
            (Some(req), Some(max)) if req > max => None,
            (Some(req), _) => Some(req),
            (None, max) => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(max: Option<u32>, default: Option<u32>) -> Partition {
        Partition {
            name: "batch".into(),
            node_names: vec!["n1".into()],
            node_bitmap: NodeBitmap::from_indices(1, &[0]),
            max_time_minutes: max,
            default_time_minutes: default,
            priority: 1,
            is_default: true,
            allowed_users: vec![],
            allowed_accounts: vec![],
            preempt_mode: PreemptMode::Off,
            state: PartitionState::Up,
        }
    }

    #[test]
    fn time_limit_clamping() {
        let p = part(Some(60), Some(30));
        assert_eq!(p.effective_time_limit(Some(20)), Some(20));
        assert_eq!(p.effective_time_limit(None), Some(30));
        // Exceeding the partition max is rejected, not silently clamped.
        assert_eq!(p.effective_time_limit(Some(90)), None);
    }

    #[test]
    fn user_allow_list() {
        let mut p = part(None, None);
        assert!(p.user_allowed(42));
        p.allowed_users = vec![7];
        assert!(p.user_allowed(7));
        assert!(!p.user_allowed(42));
    }
}
