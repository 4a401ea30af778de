//! Scheduling pipeline: admission of pending jobs, node selection, and the
//! kick machinery that wakes the scheduler after completion events.
//!
//! Selection policy is pluggable through [`SchedulerPlugin`]; the built-in
//! policy filters a partition's nodes by feature, memory, reservation, and
//! availability, orders them through the topology port, and takes the
//! cheapest subset that satisfies the request. The pass itself walks
//! pending jobs in priority order and is opportunistic: a job that cannot
//! start does not block lower-priority jobs from trying.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::agent::{AgentPayload, AgentQueue};
use crate::bitmap::NodeBitmap;
use crate::config::ClusterConfig;
use crate::cred::{CredentialArg, CredentialSigner};
use crate::error::{Result, SchedError};
use crate::ports::Ports;
use crate::state::{
    JobRecord, JobResources, JobStore, NodeStore, PartStore, PendReason,
};
use crate::telemetry::DiagStats;

/// A committed placement decision.
#[derive(Debug, Clone)]
pub struct Selection {
    pub bitmap: NodeBitmap,
    pub resources: JobResources,
}

/// Node-selection seam. `immediate` requests fail fast instead of
/// deferring.
pub trait SchedulerPlugin: Send + Sync {
    fn select_nodes(
        &self,
        job: &JobRecord,
        nodes: &NodeStore,
        parts: &PartStore,
        ports: &Ports,
        now: DateTime<Utc>,
    ) -> Result<Selection>;
}

/// Built-in selector.
pub struct BuiltinScheduler;

impl SchedulerPlugin for BuiltinScheduler {
    fn select_nodes(
        &self,
        job: &JobRecord,
        nodes: &NodeStore,
        parts: &PartStore,
        ports: &Ports,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let part = parts
            .find(&job.partition)
            .ok_or_else(|| SchedError::InvalidPartitionName(job.partition.clone()))?;
        if !part.is_up() {
            return Err(SchedError::PartConfigUnavailable);
        }
        if !part.user_allowed(job.user_id) {
            return Err(SchedError::PartConfigUnavailable);
        }
        if part.effective_time_limit(job.request.time_limit_minutes).is_none() {
            return Err(SchedError::PartConfigUnavailable);
        }

        // Start from the partition's nodes, drop anything unavailable or
        // short on resources.
        let mem_per_node = mem_per_node_mb(job);
        let mut candidates: Vec<usize> = part
            .node_bitmap
            .iter_set()
            .filter(|&i| {
                let node = match nodes.by_index(i) {
                    Some(n) => n,
                    None => return false,
                };
                node.available_for_alloc()
                    && node.real_memory_mb >= mem_per_node
                    && node.idle_cpus() > 0
                    && job
                        .request
                        .features
                        .iter()
                        .all(|f| node.features.contains(f))
            })
            .collect();

        // Reservation gates.
        if let Some(resv_name) = &job.request.reservation {
            let resv = parts
                .find_resv(resv_name)
                .ok_or_else(|| SchedError::InvalidReservationName(resv_name.clone()))?;
            if !resv.active_at(now) || !resv.admits(job.user_id, None) {
                return Err(SchedError::ReservationNotUsable);
            }
            candidates.retain(|&i| resv.node_bitmap.is_set(i));
        } else {
            let blocked = parts.reserved_against(job.user_id, None, now, nodes.len());
            candidates.retain(|&i| !blocked.is_set(i));
        }

        let want_nodes = job.request.min_nodes.max(1) as usize;
        if candidates.len() < want_nodes {
            return Err(SchedError::NodeNotAvail);
        }

        let ordered = ports.topo.order_nodes(nodes, candidates);

        // CPUs spread evenly over the chosen width.
        let total_cpus = job.request.min_cpus.max(want_nodes as u32);
        let cpus_per_node = total_cpus.div_ceil(want_nodes as u32);

        let mut picked = Vec::with_capacity(want_nodes);
        for idx in ordered {
            let Some(node) = nodes.by_index(idx) else {
                continue;
            };
            if node.idle_cpus() >= cpus_per_node {
                picked.push(idx);
                if picked.len() == want_nodes {
                    break;
                }
            }
        }
        if picked.len() < want_nodes {
            return Err(SchedError::NodeNotAvail);
        }
        picked.sort_unstable();

        let bitmap = NodeBitmap::from_indices(nodes.len(), &picked);
        let resources = JobResources {
            node_indices: picked.clone(),
            cpus_per_node: vec![cpus_per_node; picked.len()],
            mem_per_node_mb: mem_per_node,
        };
        Ok(Selection { bitmap, resources })
    }
}

fn mem_per_node_mb(job: &JobRecord) -> u64 {
    if let Some(per_node) = job.request.mem_per_node_mb {
        return per_node;
    }
    if let Some(per_cpu) = job.request.mem_per_cpu_mb {
        let cpus = job.request.min_cpus.max(job.request.min_nodes) as u64;
        let nodes = job.request.min_nodes.max(1) as u64;
        return per_cpu * cpus.div_ceil(nodes);
    }
    0
}

pub fn pend_reason_for(err: &SchedError) -> PendReason {
    match err {
        SchedError::NodeNotAvail => PendReason::Resources,
        SchedError::PartConfigUnavailable => PendReason::PartitionConfig,
        SchedError::QosThreshold => PendReason::QosThreshold,
        SchedError::JobHeld => PendReason::Held,
        SchedError::ReservationNotUsable => PendReason::ReservationNotUsable,
        _ => PendReason::Priority,
    }
}

/// Commits a selection: job state, node state, credential, and the prolog
/// (plus batch) launch messages.
#[allow(clippy::too_many_arguments)]
pub fn start_job(
    job_id: u32,
    selection: Selection,
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    signer: &CredentialSigner,
    agent: &AgentQueue,
    diag: &DiagStats,
    now: DateTime<Utc>,
) -> Result<()> {
    let node_names = nodes.names_of(&selection.bitmap);
    let job = jobs.get_mut(job_id)?;

    let cred = signer.mint(&job_credential_arg(job, &node_names, &selection, now));
    let cred_bytes = cred.to_bytes();

    job.start_allocation(selection.bitmap.clone(), selection.resources.clone(), now)?;
    job.batch_host = node_names.first().cloned();
    job.priority = 0;

    for (pos, &idx) in selection.resources.node_indices.iter().enumerate() {
        if let Some(node) = nodes.by_index_mut(idx) {
            node.allocate_job(job_id, selection.resources.cpus_per_node[pos]);
        }
    }

    // Launch traffic goes through the agent queue, never inline.
    let targets = dispatch_targets(config, nodes, &node_names);
    for target in &targets {
        agent.send(
            target.clone(),
            AgentPayload::PrologLaunch {
                job_id,
                credential: cred_bytes.clone(),
            },
        );
    }
    let job = jobs.get(job_id)?;
    if let Some(script) = &job.batch_script {
        let host = job.batch_host.clone().unwrap_or_default();
        let batch_cred = crate::stepmgr::batch_step_credential(job, nodes, signer, now)?;
        agent.send(
            host,
            AgentPayload::BatchLaunch {
                job_id,
                script: script.clone(),
                credential: batch_cred,
            },
        );
    }

    DiagStats::bump(&diag.jobs_started);
    tracing::info!(job_id, nodes = ?node_names, "job started");
    Ok(())
}

/// Resolves message targets under the configured dispatch strategy.
pub fn dispatch_targets(
    config: &ClusterConfig,
    nodes: &NodeStore,
    node_names: &[String],
) -> Vec<String> {
    match config.dispatch_mode {
        crate::config::DispatchMode::PerNode => node_names.to_vec(),
        crate::config::DispatchMode::FrontEnd => {
            let mut fes: Vec<String> = node_names
                .iter()
                .filter_map(|n| nodes.front_end_for_node(n).map(|fe| fe.name.clone()))
                .collect();
            fes.sort();
            fes.dedup();
            fes
        }
    }
}

fn job_credential_arg(
    job: &JobRecord,
    node_names: &[String],
    selection: &Selection,
    now: DateTime<Utc>,
) -> CredentialArg {
    let expiration = now + chrono::Duration::minutes(job.time_limit_minutes as i64);
    CredentialArg {
        job_id: job.job_id,
        step_id: crate::state::BATCH_SCRIPT_STEP,
        uid: job.user_id,
        node_list: node_names.to_vec(),
        core_bitmaps: selection
            .resources
            .cpus_per_node
            .iter()
            .map(|&cpus| vec![(1u64 << cpus.min(63)) - 1])
            .collect(),
        job_core_spec: 0,
        mem_limit_mb: selection.resources.mem_per_node_mb,
        cores_per_socket: Vec::new(),
        sockets_per_node: Vec::new(),
        sock_core_rep_count: Vec::new(),
        gres: job.request.gres.clone(),
        expiration,
    }
}

/// One priority-ordered pass over the pending queue. Returns the number of
/// jobs started.
#[allow(clippy::too_many_arguments)]
pub fn schedule_pass(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    parts: &PartStore,
    config: &ClusterConfig,
    ports: &Ports,
    plugin: &dyn SchedulerPlugin,
    signer: &CredentialSigner,
    agent: &AgentQueue,
    diag: &DiagStats,
    now: DateTime<Utc>,
) -> u32 {
    // Refresh priorities first so the ordering reflects current age.
    let ids = jobs.ids();
    for id in ids {
        let part_priority = jobs
            .find(id)
            .and_then(|j| parts.find(&j.partition))
            .map(|p| p.priority)
            .unwrap_or(0);
        if let Some(job) = jobs.find_mut(id) {
            if job.is_pending() {
                job.priority = ports.priority.priority_of(job, part_priority);
            }
        }
    }

    let mut started = 0;
    for job_id in jobs.pending_by_priority() {
        let selection = {
            let job = match jobs.find(job_id) {
                Some(j) => j,
                None => continue,
            };
            plugin.select_nodes(job, nodes, parts, ports, now)
        };
        match selection {
            Ok(selection) => {
                if let Err(e) =
                    start_job(job_id, selection, jobs, nodes, config, signer, agent, diag, now)
                {
                    tracing::error!(job_id, error = %e, "job start failed after selection");
                }
                started += 1;
            }
            Err(e) => {
                let reason = pend_reason_for(&e);
                if let Some(job) = jobs.find_mut(job_id) {
                    job.reason = reason;
                }
            }
        }
    }
    if started > 0 {
        // Scheduler verbosity has its own knob, separate from the main
        // debug level.
        if crate::rpc::handlers::admin::sched_log_level() > 0 {
            tracing::info!(started, "scheduling pass");
        } else {
            tracing::debug!(started, "scheduling pass");
        }
    }
    started
}

/// Wakes the scheduler loop. `kick` is a non-blocking hint; in defer mode
/// kicks are ignored and only the periodic timer drives passes.
#[derive(Debug, Default)]
pub struct SchedKicker {
    notify: Notify,
}

impl SchedKicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Estimates when a request could start: now when it fits, otherwise the
/// earliest deadline among running jobs. A read-only probe; nothing is
/// committed.
pub fn will_run_estimate(
    job: &JobRecord,
    jobs: &JobStore,
    nodes: &NodeStore,
    parts: &PartStore,
    ports: &Ports,
    plugin: &dyn SchedulerPlugin,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, Vec<String>)> {
    match plugin.select_nodes(job, nodes, parts, ports, now) {
        Ok(selection) => Ok((now, nodes.names_of(&selection.bitmap))),
        Err(e) if e.leaves_job_pending() => {
            let eta = jobs
                .iter()
                .filter(|j| j.is_running())
                .filter_map(|j| j.deadline())
                .min()
                .unwrap_or_else(|| now + chrono::Duration::minutes(60));
            Ok((eta, Vec::new()))
        }
        Err(e) => Err(e),
    }
}

/// Shared scheduler bundle the controller hands to its background loop.
pub struct Scheduler {
    pub plugin: Arc<dyn SchedulerPlugin>,
    pub kicker: SchedKicker,
}

impl Scheduler {
    pub fn new(plugin: Arc<dyn SchedulerPlugin>) -> Self {
        Self {
            plugin,
            kicker: SchedKicker::new(),
        }
    }
}
