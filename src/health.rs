//! Node registration validation and the responsiveness watchdog.

use chrono::{DateTime, Utc};

use crate::agent::{AgentPayload, AgentQueue};
use crate::config::{debug_flags, ClusterConfig};
use crate::error::{Result, SchedError};
use crate::rpc::NodeRegistrationMsg;
use crate::state::{JobStore, NodeStore};

/// Outcome of a node registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// The node just became reachable; kick the scheduler.
    pub newly_up: bool,
}

/// Validates a node's self-report and reconciles its job view with ours.
///
/// The controller trusts its own state: a job we think runs on the node but
/// the node does not report is failed over; a job the node reports that we
/// do not know is told to abort.
pub fn register_node(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    agent: &AgentQueue,
    report: &NodeRegistrationMsg,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome> {
    if nodes.find(&report.node_name).is_none() {
        return Err(SchedError::InvalidNodeName(report.node_name.clone()));
    }

    if config.debug_flags & debug_flags::NO_CONF_HASH == 0 {
        if let Some(hash) = report.conf_hash {
            if hash != config.conf_hash {
                tracing::warn!(
                    node = %report.node_name,
                    reported = hash,
                    expected = config.conf_hash,
                    "node config hash differs from controller"
                );
            }
        }
    }

    // Hardware comparison, skipped in fast-schedule mode.
    if !config.fast_schedule {
        let (t, configured_mem) = {
            let node = nodes.get(&report.node_name)?;
            (node.topology, node.real_memory_mb)
        };
        if report.cpus < t.cpus || report.real_memory_mb < configured_mem {
            let reason = format!(
                "low resources: cpus {}/{} memory {}/{}",
                report.cpus, t.cpus, report.real_memory_mb, configured_mem
            );
            nodes.get_mut(&report.node_name)?.drain(&reason);
        } else if report.sockets != t.sockets
            || report.cores_per_socket != t.cores_per_socket
            || report.threads_per_core != t.threads_per_core
        {
            nodes
                .get_mut(&report.node_name)?
                .drain("socket/core/thread count mismatch");
        }
    }

    reconcile_job_view(jobs, nodes, agent, report, now)?;

    let node = nodes.get_mut(&report.node_name)?;
    node.version = Some(report.version.clone());
    node.cpu_load = report.cpu_load;
    node.tmp_disk_mb = report.tmp_disk_mb;
    let newly_up = node.registered(now, report.boot_time);

    Ok(RegistrationOutcome { newly_up })
}

fn reconcile_job_view(
    jobs: &mut JobStore,
    nodes: &mut NodeStore,
    agent: &AgentQueue,
    report: &NodeRegistrationMsg,
    now: DateTime<Utc>,
) -> Result<()> {
    let node_index = nodes
        .index_of(&report.node_name)
        .ok_or_else(|| SchedError::InvalidNodeName(report.node_name.clone()))?;

    // Jobs we think run there but the node does not report: fail them over.
    let expected: Vec<u32> = nodes
        .get(&report.node_name)?
        .running_jobs
        .keys()
        .copied()
        .collect();
    for job_id in expected {
        if report.running_job_ids.contains(&job_id) {
            continue;
        }
        let Some(job) = jobs.find_mut(job_id) else {
            continue;
        };
        // A job still configuring may not have launched yet; leave it.
        if job.is_configuring() || !job.is_running() {
            continue;
        }
        tracing::error!(
            job_id,
            node = %report.node_name,
            "node lost job, failing it over"
        );
        job.finish(crate::state::JobBase::NodeFail, 1, now)?;
        if job.details.requeue {
            job.set_requeue_flag(true);
        }
        let names = match &job.node_bitmap {
            Some(bm) => nodes.names_of(bm),
            None => Vec::new(),
        };
        for name in &names {
            if let Some(n) = nodes.find_mut(name) {
                n.begin_completing(job_id);
            }
        }
    }

    // Jobs the node reports that we do not know: tell it to abort them.
    for &job_id in &report.running_job_ids {
        let known_here = jobs
            .find(job_id)
            .and_then(|j| j.node_bitmap.as_ref())
            .map(|bm| bm.is_set(node_index))
            .unwrap_or(false);
        if !known_here {
            tracing::error!(job_id, node = %report.node_name, "unknown job on node, aborting");
            agent.send(report.node_name.clone(), AgentPayload::AbortJob { job_id });
        }
    }

    // Unknown steps ride on their job's fate; an unknown step of a known
    // job is aborted on its own.
    for &(job_id, step_id) in &report.running_steps {
        let known = jobs
            .find(job_id)
            .map(|j| j.steps.contains_key(&step_id) || step_id == crate::state::BATCH_SCRIPT_STEP)
            .unwrap_or(false);
        if !known && jobs.find(job_id).is_some() {
            tracing::warn!(job_id, step_id, node = %report.node_name, "unknown step on node");
            agent.send(
                report.node_name.clone(),
                AgentPayload::KillStep {
                    job_id,
                    step_id,
                    signal: 9,
                },
            );
        }
    }
    Ok(())
}

/// Watchdog sweep: NoRespond after `node_timeout_secs` without a
/// registration, Down after `node_down_secs` more. Returns downed node
/// names for accounting.
pub fn watchdog_sweep(
    nodes: &mut NodeStore,
    config: &ClusterConfig,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut downed = Vec::new();
    for node in nodes.iter_mut() {
        let Some(last) = node.last_registration else {
            continue; // never registered; stays Unknown until first contact
        };
        let silent_secs = now.signed_duration_since(last).num_seconds().max(0) as u64;
        if silent_secs >= config.node_timeout_secs + config.node_down_secs {
            if node.base() != crate::state::NodeBase::Down {
                node.set_down("not responding");
                downed.push(node.name.clone());
            }
        } else if silent_secs >= config.node_timeout_secs {
            node.set_no_respond();
        }
    }
    downed
}

/// Admin reboot: Maint-flags eligible nodes (blocking new allocations) and
/// queues the reboot signal. Empty list means every eligible node.
pub fn reboot_nodes(
    nodes: &mut NodeStore,
    agent: &AgentQueue,
    node_names: &[String],
) -> Result<u32> {
    let targets: Vec<String> = if node_names.is_empty() {
        nodes
            .iter()
            .filter(|n| n.is_rebootable())
            .map(|n| n.name.clone())
            .collect()
    } else {
        for name in node_names {
            if nodes.find(name).is_none() {
                return Err(SchedError::InvalidNodeName(name.clone()));
            }
        }
        node_names.to_vec()
    };

    let mut count = 0;
    for name in &targets {
        let node = nodes.get_mut(name)?;
        if !node.is_rebootable() {
            continue;
        }
        node.set_maint(true);
        agent.send(name.clone(), AgentPayload::Reboot);
        count += 1;
    }
    Ok(count)
}
