//! Priority evaluation port. Fair-share internals are out of scope; the
//! controller only needs a number per job and the factor breakdown for the
//! priority-factors info RPC.

use serde::{Deserialize, Serialize};

use crate::state::JobRecord;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriorityFactors {
    pub age: u32,
    pub fairshare: u32,
    pub jobsize: u32,
    pub partition: u32,
    pub qos: u32,
}

impl PriorityFactors {
    pub fn total(&self) -> u32 {
        self.age
            .saturating_add(self.fairshare)
            .saturating_add(self.jobsize)
            .saturating_add(self.partition)
            .saturating_add(self.qos)
    }
}

pub trait PriorityPlugin: Send + Sync {
    fn priority_of(&self, job: &JobRecord, partition_priority: u32) -> u32 {
        self.factors(job, partition_priority).total()
    }

    fn factors(&self, job: &JobRecord, partition_priority: u32) -> PriorityFactors;
}

/// Built-in evaluator: age plus job size plus partition weight. No
/// fair-share history.
#[derive(Debug, Default)]
pub struct MultifactorLite {
    /// Age cap in minutes; queue time past this stops accruing priority.
    pub max_age_minutes: Option<u32>,
}

impl PriorityPlugin for MultifactorLite {
    fn factors(&self, job: &JobRecord, partition_priority: u32) -> PriorityFactors {
        let age_minutes = chrono::Utc::now()
            .signed_duration_since(job.submit_time)
            .num_minutes()
            .max(0) as u32;
        let age = match self.max_age_minutes {
            Some(cap) => age_minutes.min(cap),
            None => age_minutes,
        };
        PriorityFactors {
            age,
            fairshare: 0,
            jobsize: job.request.min_nodes,
            partition: partition_priority * 100,
            qos: 0,
        }
    }
}
