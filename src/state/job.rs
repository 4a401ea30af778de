//! Job records and the job state machine.
//!
//! A job is in exactly one base state plus an orthogonal set of modifier
//! flags. All transitions go through [`JobRecord`] mutators; nothing outside
//! this module writes the state fields directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::error::{Result, SchedError};
use crate::ids::StepIdCounter;
use crate::state::step::StepRecord;
use crate::state::PluginData;

/// Base job states. Ordering matters: `Started` and `Finished` predicates
/// compare against `Pending` and `Suspended`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum JobBase {
    Pending,
    Running,
    Suspended,
    Complete,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
}

impl std::fmt::Display for JobBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobBase::Pending => "pending",
            JobBase::Running => "running",
            JobBase::Suspended => "suspended",
            JobBase::Complete => "complete",
            JobBase::Cancelled => "cancelled",
            JobBase::Failed => "failed",
            JobBase::Timeout => "timeout",
            JobBase::NodeFail => "node_fail",
        };
        f.write_str(s)
    }
}

impl JobBase {
    pub fn is_terminal(self) -> bool {
        self > JobBase::Suspended
    }
}

/// Modifier flags OR-ed with the base state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobFlags(u16);

impl JobFlags {
    pub const COMPLETING: JobFlags = JobFlags(0x0001);
    pub const CONFIGURING: JobFlags = JobFlags(0x0002);
    pub const RESIZING: JobFlags = JobFlags(0x0004);
    pub const REQUEUE: JobFlags = JobFlags(0x0008);

    pub fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: JobFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: JobFlags) {
        self.0 &= !other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// Why a pending job is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendReason {
    #[default]
    None,
    Priority,
    Resources,
    NodeDown,
    Held,
    PartitionConfig,
    QosThreshold,
    ReservationNotUsable,
    BeginTime,
    JobExitRequeue,
    NodeFailRequeue,
}

/// Resource demand carried by submit/allocate requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocRequest {
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub min_cpus: u32,
    #[serde(default)]
    pub mem_per_cpu_mb: Option<u64>,
    #[serde(default)]
    pub mem_per_node_mb: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub gres: Vec<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub reservation: Option<String>,
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,
}

impl Default for AllocRequest {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: None,
            min_cpus: 1,
            mem_per_cpu_mb: None,
            mem_per_node_mb: None,
            features: Vec::new(),
            gres: Vec::new(),
            partition: None,
            reservation: None,
            time_limit_minutes: None,
        }
    }
}

/// Per-node CPU share of an allocation. Node indices refer to the node
/// table and are re-resolved under the node lock before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResources {
    pub node_indices: Vec<usize>,
    pub cpus_per_node: Vec<u32>,
    pub mem_per_node_mb: u64,
}

impl JobResources {
    pub fn total_cpus(&self) -> u32 {
        self.cpus_per_node.iter().sum()
    }
}

/// Submit-time details consulted at completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDetails {
    /// Job may be requeued on failure.
    pub requeue: bool,
    /// Job is administratively held.
    pub held: bool,
    /// Hold the job instead of requeueing when the exit code is non-zero.
    pub hold_on_exit: bool,
    /// A pending requeue was admin-initiated and must not consume the
    /// restart budget.
    pub admin_requeue: bool,
    pub begin_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: u32,
    pub array_job_id: Option<u32>,
    pub array_task_id: Option<u32>,
    pub name: String,
    pub user_id: u32,
    pub group_id: u32,
    pub request: AllocRequest,
    pub spank_env: Vec<String>,
    pub partition: String,

    base: JobBase,
    flags: JobFlags,
    pub reason: PendReason,
    pub priority: u32,

    pub node_bitmap: Option<NodeBitmap>,
    pub resources: Option<JobResources>,
    pub node_cnt: u32,
    pub batch_host: Option<String>,
    pub batch_script: Option<String>,

    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
    pub time_limit_minutes: u32,

    pub restart_cnt: u32,
    pub exit_code: Option<i32>,
    pub details: JobDetails,

    pub steps: BTreeMap<u32, StepRecord>,
    pub step_ids: StepIdCounter,
    /// Nodes whose prolog has not yet reported done.
    pub prologs_remaining: u32,
    /// Nodes whose epilog has not yet reported done.
    pub epilogs_remaining: u32,

    pub plugin_data: Vec<PluginData>,
}

impl JobRecord {
    pub fn new(
        job_id: u32,
        user_id: u32,
        group_id: u32,
        name: String,
        partition: String,
        request: AllocRequest,
        now: DateTime<Utc>,
    ) -> Self {
        let time_limit_minutes = request.time_limit_minutes.unwrap_or(60);
        Self {
            job_id,
            array_job_id: None,
            array_task_id: None,
            name,
            user_id,
            group_id,
            request,
            spank_env: Vec::new(),
            partition,
            base: JobBase::Pending,
            flags: JobFlags::default(),
            reason: PendReason::None,
            priority: 0,
            node_bitmap: None,
            resources: None,
            node_cnt: 0,
            batch_host: None,
            batch_script: None,
            submit_time: now,
            start_time: None,
            end_time: None,
            last_active: now,
            time_limit_minutes,
            restart_cnt: 0,
            exit_code: None,
            details: JobDetails::default(),
            steps: BTreeMap::new(),
            step_ids: StepIdCounter::default(),
            prologs_remaining: 0,
            epilogs_remaining: 0,
            plugin_data: Vec::new(),
        }
    }

    pub fn base(&self) -> JobBase {
        self.base
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    // State predicates.

    pub fn is_pending(&self) -> bool {
        self.base == JobBase::Pending
    }

    pub fn is_running(&self) -> bool {
        self.base == JobBase::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.base == JobBase::Suspended
    }

    /// Past admission: the job has (or had) an allocation.
    pub fn is_started(&self) -> bool {
        self.base > JobBase::Pending
    }

    /// Reached a terminal base state (cleanup may still be in progress).
    pub fn is_finished(&self) -> bool {
        self.base > JobBase::Suspended
    }

    /// Terminal and all cleanup done.
    pub fn is_completed(&self) -> bool {
        self.is_finished() && !self.is_completing()
    }

    pub fn is_completing(&self) -> bool {
        self.flags.contains(JobFlags::COMPLETING)
    }

    pub fn is_configuring(&self) -> bool {
        self.flags.contains(JobFlags::CONFIGURING)
    }

    pub fn has_requeue_flag(&self) -> bool {
        self.flags.contains(JobFlags::REQUEUE)
    }

    fn transition_allowed(from: JobBase, to: JobBase) -> bool {
        use JobBase::*;
        match (from, to) {
            (Pending, Running | Cancelled | Failed | Timeout) => true,
            (Running, Suspended | Complete | Cancelled | Failed | Timeout | NodeFail) => true,
            (Suspended, Running | Cancelled | Failed | Timeout) => true,
            // Requeue resets a terminal job to pending.
            (Complete | Cancelled | Failed | Timeout | NodeFail, Pending) => true,
            _ => false,
        }
    }

    /// Central base-state mutator. Rejects transitions outside the allowed
    /// set with `Disabled`.
    pub fn set_base_state(&mut self, to: JobBase) -> Result<()> {
        if self.base == to {
            return Ok(());
        }
        if !Self::transition_allowed(self.base, to) {
            tracing::warn!(
                job_id = self.job_id,
                from = %self.base,
                to = %to,
                "illegal job state transition rejected"
            );
            return Err(SchedError::Disabled);
        }
        tracing::debug!(job_id = self.job_id, from = %self.base, to = %to, "job state");
        self.base = to;
        Ok(())
    }

    // Event-driven mutators.

    /// Allocation succeeded: the job starts running with prologs pending on
    /// every allocated node.
    pub fn start_allocation(
        &mut self,
        bitmap: NodeBitmap,
        resources: JobResources,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.set_base_state(JobBase::Running)?;
        self.node_cnt = bitmap.count() as u32;
        self.prologs_remaining = self.node_cnt;
        self.epilogs_remaining = self.node_cnt;
        self.node_bitmap = Some(bitmap);
        self.resources = Some(resources);
        self.flags.insert(JobFlags::CONFIGURING);
        self.reason = PendReason::None;
        self.start_time = Some(now);
        self.last_active = now;
        Ok(())
    }

    /// One node's prolog finished; clears Configuring on the last one.
    pub fn prolog_done(&mut self) -> Result<()> {
        if self.prologs_remaining == 0 {
            return Err(SchedError::AlreadyDone);
        }
        self.prologs_remaining -= 1;
        if self.prologs_remaining == 0 {
            self.flags.remove(JobFlags::CONFIGURING);
        }
        Ok(())
    }

    /// Terminal transition plus Completing; used by cancel, timeout, and
    /// completion paths.
    pub fn finish(&mut self, to: JobBase, exit_code: i32, now: DateTime<Utc>) -> Result<()> {
        debug_assert!(to.is_terminal());
        self.set_base_state(to)?;
        self.flags.insert(JobFlags::COMPLETING);
        self.exit_code = Some(exit_code);
        self.end_time = Some(now);
        self.last_active = now;
        self.steps.clear();
        Ok(())
    }

    /// One node's epilog finished. Returns true when it was the last one
    /// and Completing cleared.
    pub fn epilog_done(&mut self) -> bool {
        if self.epilogs_remaining > 0 {
            self.epilogs_remaining -= 1;
        }
        if self.epilogs_remaining == 0 && self.is_completing() {
            self.flags.remove(JobFlags::COMPLETING);
            return true;
        }
        false
    }

    /// Resets a terminal job back to Pending, clearing allocation state.
    pub fn requeue(&mut self, reason: PendReason, now: DateTime<Utc>) -> Result<()> {
        if !self.is_finished() {
            return Err(SchedError::Disabled);
        }
        self.set_base_state(JobBase::Pending)?;
        self.flags.clear();
        self.reason = reason;
        self.node_bitmap = None;
        self.resources = None;
        self.node_cnt = 0;
        self.batch_host = None;
        self.start_time = None;
        self.end_time = None;
        self.exit_code = None;
        self.prologs_remaining = 0;
        self.epilogs_remaining = 0;
        self.restart_cnt += 1;
        self.last_active = now;
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(SchedError::Disabled);
        }
        self.set_base_state(JobBase::Suspended)
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.is_suspended() {
            return Err(SchedError::Disabled);
        }
        self.set_base_state(JobBase::Running)
    }

    /// Drops the Completing flag without an epilog fan-in; used when a job
    /// terminates before it ever held nodes.
    pub fn clear_completing(&mut self) {
        self.flags.remove(JobFlags::COMPLETING);
    }

    pub fn set_requeue_flag(&mut self, on: bool) {
        if on {
            self.flags.insert(JobFlags::REQUEUE);
        } else {
            self.flags.remove(JobFlags::REQUEUE);
        }
    }

    /// Whether the retention window has elapsed for a finished job.
    pub fn purgeable(&self, min_job_age_secs: u64, now: DateTime<Utc>) -> bool {
        if !self.is_completed() {
            return false;
        }
        match self.end_time {
            Some(end) => {
                let age = now.signed_duration_since(end);
                age.num_seconds() >= min_job_age_secs as i64
            }
            None => true,
        }
    }

    /// Hard deadline derived from the time limit.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.start_time
            .map(|s| s + chrono::Duration::minutes(self.time_limit_minutes as i64))
    }
}
