//! In-memory entity stores.
//!
//! Each store sits behind one axis of the lock domain: `JobStore` under the
//! job lock, `NodeStore` under the node lock, `PartStore` (partitions and
//! reservations) under the partition lock. Cross-entity links are stable
//! ids/indices resolved through these stores under lock, never held
//! references.

pub mod frontend;
pub mod job;
pub mod node;
pub mod partition;
pub mod reservation;
pub mod step;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::config::ClusterConfig;
use crate::error::{Result, SchedError};
use crate::ids::JobIdAllocator;

pub use frontend::FrontEndRecord;
pub use job::{AllocRequest, JobBase, JobDetails, JobFlags, JobRecord, JobResources, PendReason};
pub use node::{NodeBase, NodeFlags, NodeRecord};
pub use partition::{Partition, PartitionState};
pub use reservation::{Reservation, ResvFlags};
pub use step::{StepRecord, BATCH_SCRIPT_STEP};

/// Opaque plugin payload carried by jobs and steps (select/switch data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginData {
    pub kind: u16,
    pub bytes: Vec<u8>,
}

/// Jobs plus their lookup indices and the id allocator.
#[derive(Debug)]
pub struct JobStore {
    jobs: std::collections::BTreeMap<u32, JobRecord>,
    by_user: HashMap<u32, Vec<u32>>,
    by_partition: HashMap<String, Vec<u32>>,
    pub id_alloc: JobIdAllocator,
    pub last_update: DateTime<Utc>,
}

impl JobStore {
    pub fn new(config: &ClusterConfig, now: DateTime<Utc>) -> Self {
        Self {
            jobs: Default::default(),
            by_user: Default::default(),
            by_partition: Default::default(),
            id_alloc: JobIdAllocator::new(config.first_job_id, config.max_job_id),
            last_update: now,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn find(&self, job_id: u32) -> Option<&JobRecord> {
        self.jobs.get(&job_id)
    }

    pub fn find_mut(&mut self, job_id: u32) -> Option<&mut JobRecord> {
        self.last_update = Utc::now();
        self.jobs.get_mut(&job_id)
    }

    pub fn get(&self, job_id: u32) -> Result<&JobRecord> {
        self.find(job_id).ok_or(SchedError::InvalidJobId(job_id))
    }

    pub fn get_mut(&mut self, job_id: u32) -> Result<&mut JobRecord> {
        self.find_mut(job_id)
            .ok_or(SchedError::InvalidJobId(job_id))
    }

    /// Allocates an id and inserts the job built by `make`. The id is
    /// guaranteed unused among live records.
    pub fn insert_with(
        &mut self,
        make: impl FnOnce(u32) -> JobRecord,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let jobs = &self.jobs;
        let id = self
            .id_alloc
            .alloc(|candidate| jobs.contains_key(&candidate))
            .ok_or(SchedError::ResourceBusy)?;
        let job = make(id);
        debug_assert_eq!(job.job_id, id);
        self.index_job(&job);
        self.jobs.insert(id, job);
        self.last_update = now;
        Ok(id)
    }

    fn index_job(&mut self, job: &JobRecord) {
        self.by_user.entry(job.user_id).or_default().push(job.job_id);
        self.by_partition
            .entry(job.partition.clone())
            .or_default()
            .push(job.job_id);
    }

    fn unindex_job(&mut self, job: &JobRecord) {
        if let Some(ids) = self.by_user.get_mut(&job.user_id) {
            ids.retain(|&id| id != job.job_id);
        }
        if let Some(ids) = self.by_partition.get_mut(&job.partition) {
            ids.retain(|&id| id != job.job_id);
        }
    }

    /// Removes a job record. Refused while the job is still completing.
    pub fn delete(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<JobRecord> {
        let job = self.get(job_id)?;
        if job.is_completing() {
            return Err(SchedError::InProgress);
        }
        let job = self.jobs.remove(&job_id).expect("checked above");
        self.unindex_job(&job);
        self.last_update = now;
        Ok(job)
    }

    /// Re-inserts a record recovered from the state-save store, keeping its
    /// original id.
    pub fn insert_restored(&mut self, job: JobRecord, now: DateTime<Utc>) -> Result<()> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(SchedError::DuplicateJobId(job.job_id));
        }
        self.index_job(&job);
        self.jobs.insert(job.job_id, job);
        self.last_update = now;
        Ok(())
    }

    /// Drops finished jobs whose retention window has elapsed. Returns the
    /// purged ids.
    pub fn purge_old(&mut self, min_job_age_secs: u64, now: DateTime<Utc>) -> Vec<u32> {
        let purgeable: Vec<u32> = self
            .jobs
            .values()
            .filter(|j| j.purgeable(min_job_age_secs, now))
            .map(|j| j.job_id)
            .collect();
        for id in &purgeable {
            if let Some(job) = self.jobs.remove(id) {
                self.unindex_job(&job);
            }
        }
        if !purgeable.is_empty() {
            self.last_update = now;
        }
        purgeable
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.jobs.keys().copied().collect()
    }

    pub fn ids_for_user(&self, uid: u32) -> &[u32] {
        self.by_user.get(&uid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ids_for_partition(&self, partition: &str) -> &[u32] {
        self.by_partition
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pending job ids, highest priority first; ties broken by id (age).
    pub fn pending_by_priority(&self) -> Vec<u32> {
        let mut pending: Vec<(u32, u32)> = self
            .jobs
            .values()
            .filter(|j| j.is_pending() && !j.details.held)
            .map(|j| (j.priority, j.job_id))
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Verifies the secondary indices agree with the primary map and that
    /// step bitmaps stay inside their job's allocation. Used by tests and
    /// debug assertions after bulk mutations.
    pub fn check_integrity(&self) -> Result<()> {
        for (uid, ids) in &self.by_user {
            for id in ids {
                let job = self
                    .jobs
                    .get(id)
                    .ok_or_else(|| SchedError::Unexpected(format!("user index orphan {id}")))?;
                if job.user_id != *uid {
                    return Err(SchedError::Unexpected(format!(
                        "user index mismatch for job {id}"
                    )));
                }
            }
        }
        for job in self.jobs.values() {
            if let Some(bitmap) = &job.node_bitmap {
                if bitmap.count() as u32 != job.node_cnt {
                    return Err(SchedError::Unexpected(format!(
                        "job {} bitmap cardinality {} != node_cnt {}",
                        job.job_id,
                        bitmap.count(),
                        job.node_cnt
                    )));
                }
                for step in job.steps.values() {
                    if !step.node_bitmap.is_subset_of(bitmap) {
                        return Err(SchedError::Unexpected(format!(
                            "step {}.{} escapes job allocation",
                            job.job_id, step.step_id
                        )));
                    }
                }
            } else if !job.steps.is_empty() {
                return Err(SchedError::Unexpected(format!(
                    "job {} has steps but no allocation",
                    job.job_id
                )));
            }
        }
        Ok(())
    }
}

/// Nodes and front ends. Node table order is fixed at config load; bitmap
/// bit `i` refers to `nodes[i]`.
#[derive(Debug)]
pub struct NodeStore {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
    front_ends: Vec<FrontEndRecord>,
    pub last_update: DateTime<Utc>,
}

impl NodeStore {
    pub fn new(config: &ClusterConfig, now: DateTime<Utc>) -> Self {
        let nodes: Vec<NodeRecord> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, def)| NodeRecord::from_def(i, def))
            .collect();
        let by_name = nodes
            .iter()
            .map(|n| (n.name.clone(), n.index))
            .collect();
        let front_ends = config.front_ends.iter().map(FrontEndRecord::from_def).collect();
        Self {
            nodes,
            by_name,
            front_ends,
            last_update: now,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn empty_bitmap(&self) -> NodeBitmap {
        NodeBitmap::new(self.nodes.len())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn find(&self, name: &str) -> Option<&NodeRecord> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut NodeRecord> {
        self.last_update = Utc::now();
        let idx = self.by_name.get(name).copied()?;
        Some(&mut self.nodes[idx])
    }

    pub fn get(&self, name: &str) -> Result<&NodeRecord> {
        self.find(name)
            .ok_or_else(|| SchedError::InvalidNodeName(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut NodeRecord> {
        self.find_mut(name)
            .ok_or_else(|| SchedError::InvalidNodeName(name.to_string()))
    }

    pub fn by_index(&self, idx: usize) -> Option<&NodeRecord> {
        self.nodes.get(idx)
    }

    pub fn by_index_mut(&mut self, idx: usize) -> Option<&mut NodeRecord> {
        self.last_update = Utc::now();
        self.nodes.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeRecord> {
        self.last_update = Utc::now();
        self.nodes.iter_mut()
    }

    /// Builds a bitmap from node names, failing on the first unknown name.
    pub fn bitmap_of(&self, names: &[String]) -> Result<NodeBitmap> {
        let mut bm = self.empty_bitmap();
        for name in names {
            let idx = self
                .index_of(name)
                .ok_or_else(|| SchedError::InvalidNodeName(name.clone()))?;
            bm.set(idx);
        }
        Ok(bm)
    }

    /// Names of the nodes set in `bitmap`, in index order.
    pub fn names_of(&self, bitmap: &NodeBitmap) -> Vec<String> {
        bitmap
            .iter_set()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.clone()))
            .collect()
    }

    pub fn front_ends(&self) -> &[FrontEndRecord] {
        &self.front_ends
    }

    pub fn find_front_end_mut(&mut self, name: &str) -> Option<&mut FrontEndRecord> {
        self.last_update = Utc::now();
        self.front_ends.iter_mut().find(|fe| fe.name == name)
    }

    /// Front end owning `node_name`, if any.
    pub fn front_end_for_node(&self, node_name: &str) -> Option<&FrontEndRecord> {
        self.front_ends.iter().find(|fe| fe.owns(node_name))
    }
}

/// Partitions and reservations, both under the partition lock axis.
#[derive(Debug)]
pub struct PartStore {
    partitions: HashMap<String, Partition>,
    reservations: HashMap<String, Reservation>,
    pub last_update: DateTime<Utc>,
}

impl PartStore {
    pub fn new(config: &ClusterConfig, nodes: &NodeStore, now: DateTime<Utc>) -> Result<Self> {
        let mut partitions = HashMap::new();
        for def in &config.partitions {
            let bitmap = nodes.bitmap_of(&def.nodes)?;
            partitions.insert(def.name.clone(), Partition::from_def(def, bitmap));
        }
        Ok(Self {
            partitions,
            reservations: HashMap::new(),
            last_update: now,
        })
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.last_update = Utc::now();
        self.partitions.get_mut(name)
    }

    pub fn get(&self, name: &str) -> Result<&Partition> {
        self.find(name)
            .ok_or_else(|| SchedError::InvalidPartitionName(name.to_string()))
    }

    pub fn default_partition(&self) -> Option<&Partition> {
        self.partitions
            .values()
            .find(|p| p.is_default)
            .or_else(|| self.partitions.values().next())
    }

    pub fn insert(&mut self, part: Partition, now: DateTime<Utc>) {
        self.partitions.insert(part.name.clone(), part);
        self.last_update = now;
    }

    /// Deletes a partition; the caller must have verified no live jobs
    /// reference it.
    pub fn delete(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.partitions
            .remove(name)
            .ok_or_else(|| SchedError::InvalidPartitionName(name.to_string()))?;
        self.last_update = now;
        Ok(())
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn find_resv(&self, name: &str) -> Option<&Reservation> {
        self.reservations.get(name)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn create_resv(&mut self, resv: Reservation, now: DateTime<Utc>) -> Result<()> {
        if self.reservations.contains_key(&resv.name) {
            return Err(SchedError::ReservationBusy);
        }
        let existing: Vec<&Reservation> = self.reservations.values().collect();
        resv.validate(&existing, now)?;
        self.reservations.insert(resv.name.clone(), resv);
        self.last_update = now;
        Ok(())
    }

    pub fn update_resv(&mut self, resv: Reservation, now: DateTime<Utc>) -> Result<()> {
        if !self.reservations.contains_key(&resv.name) {
            return Err(SchedError::InvalidReservationName(resv.name.clone()));
        }
        let existing: Vec<&Reservation> = self
            .reservations
            .values()
            .filter(|r| r.name != resv.name)
            .collect();
        resv.validate(&existing, now)?;
        self.reservations.insert(resv.name.clone(), resv);
        self.last_update = now;
        Ok(())
    }

    /// Re-inserts a reservation recovered from the state-save store,
    /// bypassing the overlap checks it already passed when created.
    pub fn restore_resv(&mut self, resv: Reservation, now: DateTime<Utc>) {
        self.reservations.insert(resv.name.clone(), resv);
        self.last_update = now;
    }

    pub fn delete_resv(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.reservations
            .remove(name)
            .ok_or_else(|| SchedError::InvalidReservationName(name.to_string()))?;
        self.last_update = now;
        Ok(())
    }

    /// Nodes blocked for `uid` at time `t` by active exclusive windows.
    pub fn reserved_against(
        &self,
        uid: u32,
        account: Option<&str>,
        t: DateTime<Utc>,
        width: usize,
    ) -> NodeBitmap {
        let mut blocked = NodeBitmap::new(width);
        for resv in self.reservations.values() {
            if resv.active_at(t) && !resv.admits(uid, account) {
                blocked = blocked.or(&resv.node_bitmap);
            }
        }
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeDef, PartitionDef, PreemptMode};

    fn config(node_cnt: usize) -> ClusterConfig {
        let nodes: Vec<NodeDef> = (1..=node_cnt)
            .map(|i| NodeDef {
                name: format!("n{i}"),
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
            })
            .collect();
        let node_names = nodes.iter().map(|n| n.name.clone()).collect();
        ClusterConfig {
            cluster_name: "test".into(),
            listen_addr: "127.0.0.1:6817".parse().unwrap(),
            node_name: None,
            nodes,
            partitions: vec![PartitionDef {
                name: "batch".into(),
                nodes: node_names,
                max_time_minutes: None,
                default_time_minutes: None,
                priority: 1,
                is_default: true,
                allowed_users: vec![],
                allowed_accounts: vec![],
                preempt_mode: PreemptMode::Off,
            }],
            front_ends: vec![],
            dispatch_mode: Default::default(),
            daemon_uid: 990,
            super_users: vec![],
            operators: vec![],
            private_data: 0,
            debug_flags: 0,
            first_job_id: 1000,
            max_job_id: 9999,
            min_job_age_secs: 0,
            node_timeout_secs: 300,
            node_down_secs: 600,
            max_restarts: 3,
            sched_defer: false,
            sched_interval_secs: 60,
            fast_schedule: false,
            state_save_dir: "/tmp/grid-lite".into(),
            cred_key: "k".into(),
            conf_hash: 0,
        }
    }

    fn new_job(id: u32, uid: u32) -> JobRecord {
        JobRecord::new(
            id,
            uid,
            uid,
            "j".into(),
            "batch".into(),
            AllocRequest::default(),
            Utc::now(),
        )
    }

    #[test]
    fn insert_assigns_increasing_ids_and_indexes() {
        let cfg = config(2);
        let mut store = JobStore::new(&cfg, Utc::now());
        let a = store.insert_with(|id| new_job(id, 100), Utc::now()).unwrap();
        let b = store.insert_with(|id| new_job(id, 100), Utc::now()).unwrap();
        assert!(b > a);
        assert_eq!(store.ids_for_user(100), &[a, b]);
        assert_eq!(store.ids_for_partition("batch"), &[a, b]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn delete_refused_while_completing() {
        let cfg = config(2);
        let mut store = JobStore::new(&cfg, Utc::now());
        let id = store.insert_with(|id| new_job(id, 100), Utc::now()).unwrap();
        let bitmap = NodeBitmap::from_indices(2, &[0]);
        let res = JobResources {
            node_indices: vec![0],
            cpus_per_node: vec![8],
            mem_per_node_mb: 0,
        };
        let job = store.get_mut(id).unwrap();
        job.start_allocation(bitmap, res, Utc::now()).unwrap();
        job.finish(JobBase::Complete, 0, Utc::now()).unwrap();
        assert!(matches!(
            store.delete(id, Utc::now()),
            Err(SchedError::InProgress)
        ));
        store.get_mut(id).unwrap().epilog_done();
        store.delete(id, Utc::now()).unwrap();
        assert!(store.find(id).is_none());
        assert!(store.ids_for_user(100).is_empty());
    }

    #[test]
    fn pending_order_is_priority_then_age() {
        let cfg = config(2);
        let mut store = JobStore::new(&cfg, Utc::now());
        let a = store.insert_with(|id| new_job(id, 1), Utc::now()).unwrap();
        let b = store.insert_with(|id| new_job(id, 1), Utc::now()).unwrap();
        let c = store.insert_with(|id| new_job(id, 1), Utc::now()).unwrap();
        store.get_mut(b).unwrap().priority = 10;
        store.get_mut(c).unwrap().priority = 10;
        assert_eq!(store.pending_by_priority(), vec![b, c, a]);
    }

    #[test]
    fn node_store_lookup_and_bitmaps() {
        let cfg = config(3);
        let nodes = NodeStore::new(&cfg, Utc::now());
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.index_of("n2"), Some(1));
        let bm = nodes.bitmap_of(&["n1".into(), "n3".into()]).unwrap();
        assert_eq!(nodes.names_of(&bm), vec!["n1", "n3"]);
        assert!(nodes.bitmap_of(&["nope".into()]).is_err());
    }

    #[test]
    fn part_store_builds_from_config() {
        let cfg = config(2);
        let nodes = NodeStore::new(&cfg, Utc::now());
        let parts = PartStore::new(&cfg, &nodes, Utc::now()).unwrap();
        let p = parts.get("batch").unwrap();
        assert_eq!(p.node_bitmap.count(), 2);
        assert!(parts.default_partition().is_some());
    }
}
