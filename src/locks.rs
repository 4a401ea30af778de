//! Four-axis lock domain and the writer throttle gate.
//!
//! The shared controller state splits across four reader/writer locks:
//! config, job, node, partition. Every handler declares a [`LockSet`] naming
//! the level it needs on each axis; acquisition always proceeds in that
//! fixed order and release happens in reverse, which is what makes the
//! domain deadlock-free. Handlers must not perform outbound network I/O
//! while holding a [`DomainGuard`].
//!
//! The throttle gate serializes writer-heavy handlers (submit, allocate,
//! and the completion family) so a burst of them cannot monopolize the
//! write locks against readers.

use std::sync::Arc;

use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::ClusterConfig;
use crate::state::{JobStore, NodeStore, PartStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockLevel {
    #[default]
    None,
    Read,
    Write,
}

/// Per-axis lock requirement of a handler, in acquisition order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockSet {
    pub config: LockLevel,
    pub job: LockLevel,
    pub node: LockLevel,
    pub part: LockLevel,
}

impl LockSet {
    pub const fn new(
        config: LockLevel,
        job: LockLevel,
        node: LockLevel,
        part: LockLevel,
    ) -> Self {
        Self {
            config,
            job,
            node,
            part,
        }
    }
}

/// One acquired axis: nothing, a read guard, or a write guard.
pub enum AxisGuard<'a, T> {
    None,
    Read(RwLockReadGuard<'a, T>),
    Write(RwLockWriteGuard<'a, T>),
}

impl<'a, T> AxisGuard<'a, T> {
    /// Shared access. Panics when the axis was not declared in the lock
    /// set; that is a handler bug, not a runtime condition.
    pub fn get(&self) -> &T {
        match self {
            AxisGuard::Read(g) => g,
            AxisGuard::Write(g) => g,
            AxisGuard::None => panic!("axis not held; declare it in the handler's LockSet"),
        }
    }

    /// Exclusive access. Panics when the axis was not declared Write.
    pub fn get_mut(&mut self) -> &mut T {
        match self {
            AxisGuard::Write(g) => &mut *g,
            _ => panic!("axis not held for write; declare Write in the handler's LockSet"),
        }
    }
}

/// All four axes of one acquisition. Field order is the reverse of the
/// acquisition order so that dropping the guard releases partition first
/// and config last.
pub struct DomainGuard<'a> {
    pub parts: AxisGuard<'a, PartStore>,
    pub nodes: AxisGuard<'a, NodeStore>,
    pub jobs: AxisGuard<'a, JobStore>,
    pub config: AxisGuard<'a, Arc<ClusterConfig>>,
}

impl DomainGuard<'_> {
    /// Snapshot of the config Arc without keeping the axis borrowed.
    pub fn config_snapshot(&self) -> Arc<ClusterConfig> {
        Arc::clone(self.config.get())
    }
}

/// The controller's shared mutable state behind the four axes.
pub struct SharedState {
    config: RwLock<Arc<ClusterConfig>>,
    jobs: RwLock<JobStore>,
    nodes: RwLock<NodeStore>,
    parts: RwLock<PartStore>,
}

impl SharedState {
    pub fn new(
        config: Arc<ClusterConfig>,
        jobs: JobStore,
        nodes: NodeStore,
        parts: PartStore,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            jobs: RwLock::new(jobs),
            nodes: RwLock::new(nodes),
            parts: RwLock::new(parts),
        }
    }

    /// Acquires the declared subset in config → job → node → partition
    /// order.
    pub async fn acquire(&self, set: LockSet) -> DomainGuard<'_> {
        let config = Self::acquire_axis(&self.config, set.config).await;
        let jobs = Self::acquire_axis(&self.jobs, set.job).await;
        let nodes = Self::acquire_axis(&self.nodes, set.node).await;
        let parts = Self::acquire_axis(&self.parts, set.part).await;
        DomainGuard {
            parts,
            nodes,
            jobs,
            config,
        }
    }

    async fn acquire_axis<T>(lock: &RwLock<T>, level: LockLevel) -> AxisGuard<'_, T> {
        match level {
            LockLevel::None => AxisGuard::None,
            LockLevel::Read => AxisGuard::Read(lock.read().await),
            LockLevel::Write => AxisGuard::Write(lock.write().await),
        }
    }

    /// Current config snapshot, taking the config axis briefly.
    pub async fn config_snapshot(&self) -> Arc<ClusterConfig> {
        Arc::clone(&*self.config.read().await)
    }
}

/// Serializes writer-heavy handlers: at most one holds a permit at a time;
/// the rest queue on the notifier. Waiters are woken one at a time, which
/// keeps the gate starvation-free without promising strict FIFO order.
#[derive(Debug, Default)]
pub struct ThrottleGate {
    active: std::sync::Mutex<u32>,
    waiters: Notify,
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other writer-heavy handler is active.
    pub async fn start(&self) -> ThrottlePermit<'_> {
        loop {
            let notified = self.waiters.notified();
            {
                let mut active = self.active.lock().expect("throttle mutex poisoned");
                if *active == 0 {
                    *active = 1;
                    return ThrottlePermit { gate: self };
                }
            }
            notified.await;
        }
    }

    fn finish(&self) {
        let mut active = self.active.lock().expect("throttle mutex poisoned");
        *active = 0;
        drop(active);
        self.waiters.notify_one();
    }
}

/// Held for the duration of a writer-heavy handler's lock scope.
pub struct ThrottlePermit<'a> {
    gate: &'a ThrottleGate,
}

impl Drop for ThrottlePermit<'_> {
    fn drop(&mut self) {
        self.gate.finish();
    }
}

/// Shorthand constructors mirroring the lock-set comments handlers carry.
pub mod sets {
    use super::{LockLevel::*, LockSet};

    /// Read config, read job, read node, read partition.
    pub const READ_ALL: LockSet = LockSet::new(Read, Read, Read, Read);
    /// Read config, write job, write node, read partition.
    pub const JOB_WRITE: LockSet = LockSet::new(Read, Write, Write, Read);
    /// Write job only.
    pub const JOB_ONLY_WRITE: LockSet = LockSet::new(None, Write, None, None);
    /// Read config and job.
    pub const JOB_READ: LockSet = LockSet::new(Read, Read, None, None);
    /// Read config, job, and node.
    pub const JOB_NODE_READ: LockSet = LockSet::new(Read, Read, Read, None);
    /// Read config, write node.
    pub const NODE_WRITE: LockSet = LockSet::new(Read, None, Write, None);
    /// Read config and node.
    pub const NODE_READ: LockSet = LockSet::new(Read, None, Read, None);
    /// Read config and partition.
    pub const PART_READ: LockSet = LockSet::new(Read, None, None, Read);
    /// Read config, write partition (reservation and partition updates).
    pub const PART_WRITE: LockSet = LockSet::new(Read, None, Read, Write);
    /// Write config (reconfigure).
    pub const CONFIG_WRITE: LockSet = LockSet::new(Write, Write, Write, Write);
    /// Config only.
    pub const CONFIG_READ: LockSet = LockSet::new(Read, None, None, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn throttle_admits_one_at_a_time() {
        let gate = Arc::new(ThrottleGate::new());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.start().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn independent_axes_do_not_block() {
        use crate::state::{JobStore, NodeStore, PartStore};
        let config = Arc::new(crate::config_for_tests::minimal());
        let now = chrono::Utc::now();
        let jobs = JobStore::new(&config, now);
        let nodes = NodeStore::new(&config, now);
        let parts = PartStore::new(&config, &nodes, now).unwrap();
        let state = Arc::new(SharedState::new(config, jobs, nodes, parts));

        // Hold the job axis for write; a node-only reader must still pass.
        let job_guard = state.acquire(sets::JOB_ONLY_WRITE).await;
        let state2 = state.clone();
        let reader = tokio::time::timeout(Duration::from_millis(200), async move {
            let guard = state2.acquire(sets::NODE_READ).await;
            guard.nodes.get().len()
        })
        .await;
        assert!(reader.is_ok(), "node reader blocked behind job writer");
        drop(job_guard);
    }
}
