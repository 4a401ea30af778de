//! Step creation and the credential paths tied to a live job.
//!
//! Steps are created under job write + node read locks against a Running,
//! fully-prologed job, and carry a credential binding the step to its node
//! subset and limits.

use chrono::{DateTime, Utc};

use crate::cred::{CredentialArg, CredentialSigner};
use crate::error::{Result, SchedError};
use crate::rpc::StepCreateReq;
use crate::state::step::StepLayout;
use crate::state::{JobRecord, JobStore, NodeStore, StepRecord, BATCH_SCRIPT_STEP};

/// MPI port window handed out to steps that ask for reserved ports.
const MPI_PORT_BASE: u16 = 12000;
const MPI_PORTS_PER_STEP: u16 = 16;

/// Creates a step against a live job and mints its credential. Returns the
/// step id.
pub fn create_step(
    jobs: &mut JobStore,
    nodes: &NodeStore,
    signer: &CredentialSigner,
    req: &StepCreateReq,
    now: DateTime<Utc>,
) -> Result<u32> {
    let job = jobs.get_mut(req.job_id)?;

    if job.user_id != req.user_id {
        return Err(SchedError::AccessDenied);
    }
    if job.is_suspended() {
        return Err(SchedError::Disabled);
    }
    if !job.is_running() {
        return Err(SchedError::InvalidJobId(req.job_id));
    }
    // Steps wait for every prolog to finish.
    if job.is_configuring() {
        return Err(SchedError::PrologRunning);
    }

    let job_bitmap = job
        .node_bitmap
        .as_ref()
        .ok_or(SchedError::InvalidJobId(req.job_id))?;

    let want_nodes = (req.node_cnt.max(1) as usize).min(job_bitmap.count());
    if req.node_cnt as usize > job_bitmap.count() {
        return Err(SchedError::NodeNotAvail);
    }

    // Take the first `want_nodes` of the job's allocation. Index order is
    // the allocation's canonical order.
    let picked: Vec<usize> = job_bitmap.iter_set().take(want_nodes).collect();
    let step_bitmap = crate::bitmap::NodeBitmap::from_indices(job_bitmap.len(), &picked);

    // Memory containment within the job's per-node share.
    let job_mem = job
        .resources
        .as_ref()
        .map(|r| r.mem_per_node_mb)
        .unwrap_or(0);
    if job_mem > 0 && req.mem_per_node_mb > job_mem {
        return Err(SchedError::NodeNotAvail);
    }

    // CPU containment against the job's smallest per-node share.
    if let Some(res) = &job.resources {
        let step_cpus_per_node = (req.task_cnt.div_ceil(want_nodes as u32))
            .saturating_mul(req.cpus_per_task as u32);
        if let Some(&min_share) = res.cpus_per_node.iter().min() {
            if step_cpus_per_node > min_share {
                return Err(SchedError::NodeNotAvail);
            }
        }
    }

    let step_id = job.step_ids.alloc();
    let tasks_per_node = spread_tasks(req.task_cnt, want_nodes as u32);
    let port_range = req.want_ports.then(|| {
        let base = MPI_PORT_BASE + (step_id as u16 % 512) * MPI_PORTS_PER_STEP;
        (base, base + MPI_PORTS_PER_STEP - 1)
    });

    let node_names = nodes.names_of(&step_bitmap);
    let expiration = credential_expiration(job, now);
    let cred = signer.mint(&CredentialArg {
        job_id: job.job_id,
        step_id,
        uid: job.user_id,
        node_list: node_names,
        core_bitmaps: picked
            .iter()
            .map(|&i| {
                let cpus = nodes
                    .by_index(i)
                    .map(|n| n.topology.cpus)
                    .unwrap_or(1)
                    .min(63);
                vec![(1u64 << cpus) - 1]
            })
            .collect(),
        job_core_spec: 0,
        mem_limit_mb: req.mem_per_node_mb,
        cores_per_socket: picked
            .iter()
            .filter_map(|&i| nodes.by_index(i).map(|n| n.topology.cores_per_socket))
            .collect(),
        sockets_per_node: picked
            .iter()
            .filter_map(|&i| nodes.by_index(i).map(|n| n.topology.sockets))
            .collect(),
        sock_core_rep_count: vec![picked.len() as u32],
        gres: job.request.gres.clone(),
        expiration,
    });

    let step = StepRecord::new(
        step_id,
        job.job_id,
        req.name.clone(),
        step_bitmap,
        StepLayout {
            task_cnt: req.task_cnt,
            cpus_per_task: req.cpus_per_task,
            tasks_per_node,
        },
        req.mem_per_node_mb,
        port_range,
        cred.to_bytes(),
        now,
    );
    job.steps.insert(step_id, step);
    tracing::info!(
        job_id = job.job_id,
        step_id,
        tasks = req.task_cnt,
        "step created"
    );
    Ok(step_id)
}

/// Credentials die with the job: expiration is the job's fixed deadline,
/// not a window from mint time, so a credential minted mid-job never
/// outlives the allocation it authorizes. The fallback only covers a job
/// with no start time, which a running job cannot be.
fn credential_expiration(job: &JobRecord, now: DateTime<Utc>) -> DateTime<Utc> {
    job.deadline()
        .unwrap_or_else(|| now + chrono::Duration::minutes(job.time_limit_minutes as i64))
}

/// Round-robin task spread, front-loaded like the original layout.
fn spread_tasks(task_cnt: u32, node_cnt: u32) -> Vec<u16> {
    let node_cnt = node_cnt.max(1);
    let base = task_cnt / node_cnt;
    let extra = (task_cnt % node_cnt) as usize;
    (0..node_cnt as usize)
        .map(|i| base as u16 + u16::from(i < extra))
        .collect()
}

/// Credential used when dispatching a batch script: the whole allocation,
/// batch step id.
pub fn batch_step_credential(
    job: &JobRecord,
    nodes: &NodeStore,
    signer: &CredentialSigner,
    now: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let bitmap = job
        .node_bitmap
        .as_ref()
        .ok_or(SchedError::InvalidJobId(job.job_id))?;
    let expiration = credential_expiration(job, now);
    let cred = signer.mint(&CredentialArg {
        job_id: job.job_id,
        step_id: BATCH_SCRIPT_STEP,
        uid: job.user_id,
        node_list: nodes.names_of(bitmap),
        core_bitmaps: Vec::new(),
        job_core_spec: 0,
        mem_limit_mb: job
            .resources
            .as_ref()
            .map(|r| r.mem_per_node_mb)
            .unwrap_or(0),
        cores_per_socket: Vec::new(),
        sockets_per_node: Vec::new(),
        sock_core_rep_count: Vec::new(),
        gres: job.request.gres.clone(),
        expiration,
    });
    Ok(cred.to_bytes())
}

/// Broadcast-file credential: expires with the job, covers its node list.
pub fn sbcast_credential(
    job: &JobRecord,
    nodes: &NodeStore,
    signer: &CredentialSigner,
    now: DateTime<Utc>,
) -> Result<Vec<u8>> {
    if !job.is_running() && !job.is_suspended() {
        return Err(SchedError::Disabled);
    }
    batch_step_credential(job, nodes, signer, now)
}
