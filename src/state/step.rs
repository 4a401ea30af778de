//! Step records: parallel execution units inside a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::error::{Result, SchedError};
use crate::state::PluginData;

/// Step id value standing in for "the batch script itself" in kill and
/// completion requests.
pub const BATCH_SCRIPT_STEP: u32 = u32::MAX;

/// Task-to-node layout of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLayout {
    pub task_cnt: u32,
    pub cpus_per_task: u16,
    /// Tasks placed on each step-local node, in bitmap order.
    pub tasks_per_node: Vec<u16>,
}

/// Tracks step completion reported as contiguous ranges of step-local node
/// indices. Node daemons aggregate over a binomial tree, so each message
/// covers `[first..=last]`; a range whose nodes have all already reported
/// is a duplicate delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeTracker {
    remaining: NodeBitmap,
}

impl RangeTracker {
    pub fn new(node_cnt: usize) -> Self {
        Self {
            remaining: NodeBitmap::full(node_cnt),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.count()
    }

    /// Records completion of `[first..=last]`. Returns the number of nodes
    /// still outstanding, or `AlreadyDone` when every node in the range had
    /// already reported.
    pub fn complete_range(&mut self, first: usize, last: usize) -> Result<usize> {
        if first > last || last >= self.remaining.len() {
            return Err(SchedError::Unexpected(format!(
                "bad completion range {first}..{last}"
            )));
        }
        let any_outstanding = (first..=last).any(|i| self.remaining.is_set(i));
        if !any_outstanding {
            return Err(SchedError::AlreadyDone);
        }
        for i in first..=last {
            self.remaining.unset(i);
        }
        Ok(self.remaining.count())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: u32,
    pub job_id: u32,
    pub name: String,
    /// Subset of the job's node bitmap.
    pub node_bitmap: NodeBitmap,
    pub layout: StepLayout,
    pub mem_per_node_mb: u64,
    /// Reserved MPI port range, inclusive.
    pub port_range: Option<(u16, u16)>,
    /// Serialized signed credential handed to the node daemons.
    pub credential: Vec<u8>,
    pub switch_data: Option<PluginData>,
    pub start_time: DateTime<Utc>,
    pub exit_code: i32,
    completion: RangeTracker,
}

impl StepRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        step_id: u32,
        job_id: u32,
        name: String,
        node_bitmap: NodeBitmap,
        layout: StepLayout,
        mem_per_node_mb: u64,
        port_range: Option<(u16, u16)>,
        credential: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        let node_cnt = node_bitmap.count();
        Self {
            step_id,
            job_id,
            name,
            node_bitmap,
            layout,
            mem_per_node_mb,
            port_range,
            credential,
            switch_data: None,
            start_time: now,
            exit_code: 0,
            completion: RangeTracker::new(node_cnt),
        }
    }

    pub fn node_cnt(&self) -> usize {
        self.node_bitmap.count()
    }

    pub fn nodes_remaining(&self) -> usize {
        self.completion.remaining()
    }

    /// Folds one completion message in. Returns remaining node count.
    pub fn complete_range(&mut self, first: usize, last: usize, rc: i32) -> Result<usize> {
        let remaining = self.completion.complete_range(first, last)?;
        if rc != 0 && self.exit_code == 0 {
            self.exit_code = rc;
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(nodes: usize) -> StepRecord {
        StepRecord::new(
            0,
            1000,
            "step".into(),
            NodeBitmap::full(nodes),
            StepLayout {
                task_cnt: nodes as u32,
                cpus_per_task: 1,
                tasks_per_node: vec![1; nodes],
            },
            0,
            None,
            Vec::new(),
            Utc::now(),
        )
    }

    #[test]
    fn range_fanin_completes_once() {
        let mut s = step(4);
        assert_eq!(s.complete_range(0, 1, 0).unwrap(), 2);
        assert_eq!(s.complete_range(2, 3, 0).unwrap(), 0);
    }

    #[test]
    fn duplicate_range_is_already_done() {
        let mut s = step(4);
        s.complete_range(0, 1, 0).unwrap();
        assert!(matches!(
            s.complete_range(0, 1, 0),
            Err(SchedError::AlreadyDone)
        ));
        // Still two outstanding; nothing was lost.
        assert_eq!(s.nodes_remaining(), 2);
    }

    #[test]
    fn overlapping_range_counts_fresh_nodes() {
        let mut s = step(4);
        s.complete_range(0, 1, 0).unwrap();
        // Overlaps node 1 but brings node 2; not a duplicate.
        assert_eq!(s.complete_range(1, 2, 0).unwrap(), 1);
    }

    #[test]
    fn first_nonzero_rc_sticks() {
        let mut s = step(3);
        s.complete_range(0, 0, 0).unwrap();
        s.complete_range(1, 1, 9).unwrap();
        s.complete_range(2, 2, 7).unwrap();
        assert_eq!(s.exit_code, 9);
    }

    #[test]
    fn out_of_bounds_range_rejected() {
        let mut s = step(2);
        assert!(s.complete_range(0, 2, 0).is_err());
    }
}
