//! Controller assembly: owns the shared state, the collaborator ports, and
//! every background loop (scheduler, watchdog, purge, state save).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentQueue, NodeTransport};
use crate::config::ClusterConfig;
use crate::cred::CredentialSigner;
use crate::error::Result;
use crate::ids::{Clock, SystemClock};
use crate::locks::{sets, SharedState, ThrottleGate};
use crate::persist::{
    IdSnapshot, JobsSnapshot, NodesSnapshot, PartsSnapshot, RestoredState, ResvSnapshot, StateSaver,
};
use crate::ports::Ports;
use crate::rpc::WireCodec;
use crate::sched::{schedule_pass, Scheduler, SchedulerPlugin};
use crate::state::{JobStore, NodeStore, PartStore};
use crate::telemetry::{DiagStats, RpcTelemetry};

/// Deferred-save flags, mirroring the "schedule a save, a helper thread
/// writes it" discipline: handlers set a flag, the save loop does the I/O.
#[derive(Debug, Default)]
pub struct SaveFlags {
    pub jobs: AtomicBool,
    pub nodes: AtomicBool,
    pub partitions: AtomicBool,
    pub reservations: AtomicBool,
}

pub struct Controller {
    pub state: SharedState,
    pub throttle: ThrottleGate,
    pub telemetry: RpcTelemetry,
    pub diag: DiagStats,
    pub agent: AgentQueue,
    /// Direct transport handle for synchronous fan-out (forwarded
    /// requests); everything else goes through the agent queue.
    pub transport: Arc<dyn NodeTransport>,
    pub signer: CredentialSigner,
    pub ports: Ports,
    pub sched: Scheduler,
    pub saver: Arc<dyn StateSaver>,
    pub codec: Arc<dyn WireCodec>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: CancellationToken,
    pub save_flags: SaveFlags,
    /// Runtime copy of the config's debug flags, adjustable by RPC.
    pub debug_flags: AtomicU64,
    pub boot_time: DateTime<Utc>,
}

/// Everything pluggable, with defaults for production wiring.
pub struct ControllerBuilder {
    config: Arc<ClusterConfig>,
    ports: Option<Ports>,
    transport: Option<Arc<dyn NodeTransport>>,
    saver: Option<Arc<dyn StateSaver>>,
    codec: Option<Arc<dyn WireCodec>>,
    plugin: Option<Arc<dyn SchedulerPlugin>>,
    clock: Option<Arc<dyn Clock>>,
    shutdown: Option<CancellationToken>,
}

impl ControllerBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config: Arc::new(config),
            ports: None,
            transport: None,
            saver: None,
            codec: None,
            plugin: None,
            clock: None,
            shutdown: None,
        }
    }

    pub fn ports(mut self, ports: Ports) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn NodeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn saver(mut self, saver: Arc<dyn StateSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn scheduler_plugin(mut self, plugin: Arc<dyn SchedulerPlugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Restores persisted state and assembles the controller.
    pub async fn build(self) -> Result<Arc<Controller>> {
        let config = self.config;
        let shutdown = self.shutdown.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let now = clock.now();

        let saver = self.saver.unwrap_or_else(|| {
            Arc::new(crate::persist::FileStateSaver::new(&config.state_save_dir))
        });
        let restored = saver.restore_all().await?;

        let mut jobs = JobStore::new(&config, now);
        let mut nodes = NodeStore::new(&config, now);
        let mut parts = PartStore::new(&config, &nodes, now)?;
        apply_restored(&mut jobs, &mut nodes, &mut parts, &config, restored, now);

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(crate::agent::LogTransport));
        let agent = AgentQueue::start(Arc::clone(&transport), shutdown.clone());

        let controller = Arc::new(Controller {
            state: SharedState::new(Arc::clone(&config), jobs, nodes, parts),
            throttle: ThrottleGate::new(),
            telemetry: RpcTelemetry::new(),
            diag: DiagStats::default(),
            agent,
            transport,
            signer: CredentialSigner::new(config.cred_key.as_bytes()),
            ports: self
                .ports
                .unwrap_or_else(|| Ports::defaults(&config.cred_key)),
            sched: Scheduler::new(
                self.plugin
                    .unwrap_or_else(|| Arc::new(crate::sched::BuiltinScheduler)),
            ),
            saver,
            codec: self.codec.unwrap_or_else(|| Arc::new(crate::rpc::JsonCodec)),
            clock,
            shutdown,
            save_flags: SaveFlags::default(),
            debug_flags: AtomicU64::new(config.debug_flags),
            boot_time: now,
        });
        Ok(controller)
    }
}

fn apply_restored(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    parts: &mut PartStore,
    config: &ClusterConfig,
    restored: RestoredState,
    now: DateTime<Utc>,
) {
    if let Some(snap) = restored.jobs {
        for job in snap.jobs {
            let id = job.job_id;
            if let Err(e) = jobs.insert_restored(job, now) {
                tracing::error!(job_id = id, error = %e, "dropping unrestorable job");
            }
        }
    }
    let next = restored
        .ids
        .map(|i| i.next_job_id)
        .unwrap_or(config.first_job_id);
    jobs.id_alloc = crate::ids::JobIdAllocator::restore(next, config.first_job_id, config.max_job_id);

    if let Some(snap) = restored.nodes {
        // Runtime state (drain/down/reason, job sets) carries over onto the
        // config-defined table; hardware shape always comes from config.
        for saved in snap.nodes {
            if let Some(node) = nodes.find_mut(&saved.name) {
                node.carry_runtime_state(&saved);
            }
        }
    }

    if let Some(snap) = restored.partitions {
        for part in snap.partitions {
            if parts.find(&part.name).is_none() {
                parts.insert(part, now);
            }
        }
    }
    if let Some(snap) = restored.reservations {
        for resv in snap.reservations {
            parts.restore_resv(resv, now);
        }
    }
}

impl Controller {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn request_job_save(&self) {
        self.save_flags.jobs.store(true, Ordering::Release);
    }

    pub fn request_node_save(&self) {
        self.save_flags.nodes.store(true, Ordering::Release);
    }

    pub fn request_part_save(&self) {
        self.save_flags.partitions.store(true, Ordering::Release);
    }

    pub fn request_resv_save(&self) {
        self.save_flags.reservations.store(true, Ordering::Release);
    }

    pub fn debug_flag_set(&self, bit: u64) -> bool {
        self.debug_flags.load(Ordering::Relaxed) & bit != 0
    }

    /// Runs one scheduling pass under the standard scheduler lock set.
    pub async fn run_schedule_pass(&self) -> u32 {
        let now = self.now();
        let mut guard = self.state.acquire(sets::JOB_WRITE).await;
        let config = guard.config_snapshot();
        // Split borrows: jobs and nodes are written, partitions read.
        let DomainSplit { jobs, nodes, parts } = split_guard(&mut guard);
        let started = schedule_pass(
            jobs,
            nodes,
            parts,
            &config,
            &self.ports,
            self.sched.plugin.as_ref(),
            &self.signer,
            &self.agent,
            &self.diag,
            now,
        );
        drop(guard);
        if started > 0 {
            self.request_job_save();
            self.request_node_save();
        }
        started
    }

    /// Kicks the scheduler unless defer mode routes everything through the
    /// timer.
    pub async fn kick_scheduler(&self) {
        let config = self.state.config_snapshot().await;
        if !config.sched_defer {
            self.sched.kicker.kick();
        }
    }

    /// Spawns the scheduler, watchdog, purge, and save loops.
    pub fn spawn_background(self: &Arc<Self>) {
        let ctl = Arc::clone(self);
        tokio::spawn(async move { ctl.scheduler_loop().await });
        let ctl = Arc::clone(self);
        tokio::spawn(async move { ctl.watchdog_loop().await });
        let ctl = Arc::clone(self);
        tokio::spawn(async move { ctl.save_loop().await });
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let interval_secs = self.state.config_snapshot().await.sched_interval_secs;
        let mut timer = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = timer.tick() => {}
                _ = self.sched.kicker.wait() => {}
            }
            self.run_schedule_pass().await;
        }
        tracing::debug!("scheduler loop stopped");
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(Duration::from_secs(10));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let now = self.now();
            let downed = {
                let mut guard = self.state.acquire(sets::NODE_WRITE).await;
                let config = guard.config_snapshot();
                crate::health::watchdog_sweep(guard.nodes.get_mut(), &config, now)
            };
            for name in &downed {
                self.ports.acct.node_down(name, "not responding").await;
            }
            if !downed.is_empty() {
                self.request_node_save();
            }

            // Time limits and retention ride the same tick.
            let expired = {
                let mut guard = self.state.acquire(sets::JOB_WRITE).await;
                let config = guard.config_snapshot();
                let DomainSplit { jobs, nodes, .. } = split_guard(&mut guard);
                crate::reconcile::expire_time_limits(
                    jobs, nodes, &config, &self.agent, &self.diag, now,
                )
            };
            let purged = {
                let min_age = self.state.config_snapshot().await.min_job_age_secs;
                let mut guard = self.state.acquire(sets::JOB_ONLY_WRITE).await;
                guard.jobs.get_mut().purge_old(min_age, now)
            };
            if expired > 0 || !purged.is_empty() {
                self.request_job_save();
                if expired > 0 {
                    self.kick_scheduler().await;
                }
            }
        }
        tracing::debug!("watchdog loop stopped");
    }

    async fn save_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Final sweep so a clean shutdown loses nothing.
                    self.flush_saves(true).await;
                    break;
                }
                _ = timer.tick() => {}
            }
            self.flush_saves(false).await;
        }
        tracing::debug!("save loop stopped");
    }

    async fn flush_saves(&self, force: bool) {
        if force || self.save_flags.jobs.swap(false, Ordering::AcqRel) {
            let snap = {
                let guard = self.state.acquire(sets::JOB_READ).await;
                let jobs = guard.jobs.get();
                JobsSnapshot {
                    jobs: jobs.iter().cloned().collect(),
                    next_job_id: jobs.id_alloc.next_unallocated(),
                }
            };
            crate::persist::save_jobs_logged(self.saver.as_ref(), snap).await;
        }
        if force || self.save_flags.nodes.swap(false, Ordering::AcqRel) {
            let snap = {
                let guard = self.state.acquire(sets::NODE_READ).await;
                NodesSnapshot {
                    nodes: guard.nodes.get().iter().cloned().collect(),
                }
            };
            crate::persist::save_nodes_logged(self.saver.as_ref(), snap).await;
        }
        if force || self.save_flags.partitions.swap(false, Ordering::AcqRel) {
            let snap = {
                let guard = self.state.acquire(sets::PART_READ).await;
                PartsSnapshot {
                    partitions: guard.parts.get().partitions().cloned().collect(),
                }
            };
            if let Err(e) = self.saver.save_partitions(&snap).await {
                tracing::error!(error = %e, "partition state save failed");
            }
        }
        if force || self.save_flags.reservations.swap(false, Ordering::AcqRel) {
            let snap = {
                let guard = self.state.acquire(sets::PART_READ).await;
                ResvSnapshot {
                    reservations: guard.parts.get().reservations().cloned().collect(),
                }
            };
            if let Err(e) = self.saver.save_reservations(&snap).await {
                tracing::error!(error = %e, "reservation state save failed");
            }
        }
        if force {
            let next = {
                let guard = self.state.acquire(sets::JOB_READ).await;
                guard.jobs.get().id_alloc.next_unallocated()
            };
            if let Err(e) = self.saver.save_ids(&IdSnapshot { next_job_id: next }).await {
                tracing::error!(error = %e, "id state save failed");
            }
        }
    }

    /// Reloads the config file, rebuilds the derived stores, and swaps the
    /// snapshot under the full write set. Running state is carried over.
    pub async fn reconfigure(&self) -> Result<()> {
        let new_config = Arc::new(ClusterConfig::load(None)?);
        let now = self.now();

        let mut guard = self.state.acquire(sets::CONFIG_WRITE).await;
        let mut new_nodes = NodeStore::new(&new_config, now);
        {
            let old_nodes = guard.nodes.get();
            for old in old_nodes.iter() {
                if let Some(node) = new_nodes.find_mut(&old.name) {
                    node.carry_runtime_state(old);
                }
            }
        }
        let mut new_parts = PartStore::new(&new_config, &new_nodes, now)?;
        for resv in guard.parts.get().reservations() {
            new_parts.restore_resv(resv.clone(), now);
        }

        *guard.config.get_mut() = Arc::clone(&new_config);
        *guard.nodes.get_mut() = new_nodes;
        *guard.parts.get_mut() = new_parts;
        drop(guard);

        self.debug_flags
            .store(new_config.debug_flags, Ordering::Relaxed);
        self.signer.rotate_key(new_config.cred_key.as_bytes());
        tracing::info!("reconfigure complete");
        self.sched.kicker.kick();
        self.request_node_save();
        self.request_part_save();
        Ok(())
    }
}

/// Split borrow helper: hand out disjoint mutable references to the axes a
/// scheduler or reconciler call needs.
pub struct DomainSplit<'a> {
    pub jobs: &'a mut JobStore,
    pub nodes: &'a mut NodeStore,
    pub parts: &'a PartStore,
}

pub fn split_guard<'a>(guard: &'a mut crate::locks::DomainGuard<'_>) -> DomainSplit<'a> {
    // Field-level borrows are disjoint.
    DomainSplit {
        jobs: guard.jobs.get_mut(),
        nodes: guard.nodes.get_mut(),
        parts: guard.parts.get(),
    }
}
