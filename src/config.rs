//! Cluster configuration snapshot.
//!
//! The running controller holds an `Arc<ClusterConfig>` behind the config
//! lock axis. Reconfigure loads a fresh snapshot and swaps the Arc; handlers
//! already in flight finish against the snapshot they captured.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Environment variable naming the primary config file.
pub const CONF_ENV: &str = "GRID_CONF";
/// Environment variable overriding the local node identity.
pub const NODENAME_ENV: &str = "GRID_NODENAME";

/// Privacy mask bits: when set, non-operators only see objects they own.
pub mod private_data {
    pub const JOBS: u32 = 0x0001;
    pub const NODES: u32 = 0x0002;
    pub const PARTITIONS: u32 = 0x0004;
    pub const RESERVATIONS: u32 = 0x0008;
}

/// Runtime-adjustable debug flag bits (set_debug_flags RPC).
pub mod debug_flags {
    pub const PROTOCOL: u64 = 0x0001;
    pub const NO_CONF_HASH: u64 = 0x0002;
    pub const BACKFILL: u64 = 0x0004;
    pub const STEPS: u64 = 0x0008;
}

/// How launch/kill messages reach compute resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Message every node of an allocation directly.
    #[default]
    PerNode,
    /// Message the front-end daemon owning the nodes.
    FrontEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default = "one_u16")]
    pub boards: u16,
    #[serde(default = "one_u16")]
    pub sockets: u16,
    #[serde(default = "one_u16")]
    pub cores_per_socket: u16,
    #[serde(default = "one_u16")]
    pub threads_per_core: u16,
    pub cpus: u32,
    pub real_memory_mb: u64,
    #[serde(default)]
    pub tmp_disk_mb: u64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default = "one_u32")]
    pub weight: u32,
    #[serde(default)]
    pub core_spec_cnt: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontEndDef {
    pub name: String,
    #[serde(default)]
    pub addr: Option<String>,
    /// Names of the compute nodes this front end owns.
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub max_time_minutes: Option<u32>,
    #[serde(default)]
    pub default_time_minutes: Option<u32>,
    #[serde(default = "one_u32")]
    pub priority: u32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub allowed_users: Vec<u32>,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
    #[serde(default)]
    pub preempt_mode: PreemptMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreemptMode {
    #[default]
    Off,
    Requeue,
    Cancel,
}

/// Immutable snapshot of the cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub listen_addr: SocketAddr,
    /// Identity of the controller host; overridden by `GRID_NODENAME`.
    #[serde(default)]
    pub node_name: Option<String>,

    pub nodes: Vec<NodeDef>,
    pub partitions: Vec<PartitionDef>,
    #[serde(default)]
    pub front_ends: Vec<FrontEndDef>,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    /// Uid the node daemons authenticate as.
    pub daemon_uid: u32,
    #[serde(default)]
    pub super_users: Vec<u32>,
    #[serde(default)]
    pub operators: Vec<u32>,
    #[serde(default)]
    pub private_data: u32,
    #[serde(default)]
    pub debug_flags: u64,

    #[serde(default = "default_first_job_id")]
    pub first_job_id: u32,
    #[serde(default = "default_max_job_id")]
    pub max_job_id: u32,
    /// Seconds a finished job record lingers before purge.
    #[serde(default = "default_min_job_age")]
    pub min_job_age_secs: u64,
    /// Seconds without registration before a node is marked NoRespond.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Further delay before a NoRespond node is downed.
    #[serde(default = "default_node_down")]
    pub node_down_secs: u64,
    /// Per-job restart budget for exit-code-driven requeues.
    #[serde(default = "default_restart_limit")]
    pub max_restarts: u32,
    /// When set, completion events save state but do not trigger a
    /// scheduling pass; the periodic timer drives scheduling.
    #[serde(default)]
    pub sched_defer: bool,
    /// Seconds between timer-driven scheduling passes.
    #[serde(default = "default_sched_interval")]
    pub sched_interval_secs: u64,
    /// Skip per-registration hardware comparison when set.
    #[serde(default)]
    pub fast_schedule: bool,

    pub state_save_dir: PathBuf,
    /// Key material for the credential signer.
    pub cred_key: String,
    /// Hash of the config file contents, compared against node reports.
    #[serde(default)]
    pub conf_hash: u32,
}

impl ClusterConfig {
    /// Loads a snapshot from `path`, or from `GRID_CONF` when `path` is
    /// `None`. Applies the `GRID_NODENAME` override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(CONF_ENV)
                .map(PathBuf::from)
                .map_err(|_| SchedError::Unexpected(format!("{CONF_ENV} not set")))?,
        };
        let raw = std::fs::read_to_string(&path)?;
        let mut config: ClusterConfig = serde_json::from_str(&raw)?;
        config.conf_hash = conf_hash(&raw);
        if let Ok(name) = std::env::var(NODENAME_ENV) {
            config.node_name = Some(name);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(SchedError::Unexpected("no nodes configured".into()));
        }
        if self.partitions.is_empty() {
            return Err(SchedError::Unexpected("no partitions configured".into()));
        }
        if self.first_job_id == 0 || self.first_job_id >= self.max_job_id {
            return Err(SchedError::Unexpected("invalid job id range".into()));
        }
        for part in &self.partitions {
            for node in &part.nodes {
                if !self.nodes.iter().any(|n| &n.name == node) {
                    return Err(SchedError::InvalidNodeName(node.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn is_super_user(&self, uid: u32) -> bool {
        uid == 0 || uid == self.daemon_uid || self.super_users.contains(&uid)
    }

    pub fn is_operator(&self, uid: u32) -> bool {
        self.is_super_user(uid) || self.operators.contains(&uid)
    }

    pub fn is_daemon_user(&self, uid: u32) -> bool {
        uid == 0 || uid == self.daemon_uid
    }

    pub fn default_partition(&self) -> Option<&PartitionDef> {
        self.partitions
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.partitions.first())
    }
}

/// FNV-1a over the raw config text; nodes report the hash of their copy.
pub fn conf_hash(raw: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in raw.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn one_u16() -> u16 {
    1
}

fn one_u32() -> u32 {
    1
}

fn default_first_job_id() -> u32 {
    1000
}

fn default_max_job_id() -> u32 {
    0x03ff_ffff
}

fn default_min_job_age() -> u64 {
    300
}

fn default_node_timeout() -> u64 {
    300
}

fn default_node_down() -> u64 {
    600
}

fn default_restart_limit() -> u32 {
    3
}

fn default_sched_interval() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            cluster_name: "test".into(),
            listen_addr: "127.0.0.1:6817".parse().unwrap(),
            node_name: None,
            nodes: vec![NodeDef {
                name: "n1".into(),
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
            }],
            partitions: vec![PartitionDef {
                name: "batch".into(),
                nodes: vec!["n1".into()],
                max_time_minutes: None,
                default_time_minutes: None,
                priority: 1,
                is_default: true,
                allowed_users: vec![],
                allowed_accounts: vec![],
                preempt_mode: PreemptMode::Off,
            }],
            front_ends: vec![],
            dispatch_mode: DispatchMode::PerNode,
            daemon_uid: 990,
            super_users: vec![],
            operators: vec![],
            private_data: 0,
            debug_flags: 0,
            first_job_id: 1000,
            max_job_id: 2000,
            min_job_age_secs: 300,
            node_timeout_secs: 300,
            node_down_secs: 600,
            max_restarts: 3,
            sched_defer: false,
            sched_interval_secs: 60,
            fast_schedule: false,
            state_save_dir: "/tmp/grid-lite".into(),
            cred_key: "test-key".into(),
            conf_hash: 0,
        }
    }

    #[test]
    fn validate_rejects_unknown_partition_node() {
        let mut config = test_config();
        config.partitions[0].nodes.push("ghost".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn role_checks() {
        let mut config = test_config();
        config.super_users.push(500);
        config.operators.push(600);
        assert!(config.is_super_user(0));
        assert!(config.is_super_user(500));
        assert!(!config.is_super_user(600));
        assert!(config.is_operator(600));
        assert!(!config.is_operator(700));
        assert!(config.is_daemon_user(990));
    }

    #[test]
    fn conf_hash_is_stable() {
        assert_eq!(conf_hash("abc"), conf_hash("abc"));
        assert_ne!(conf_hash("abc"), conf_hash("abd"));
    }
}
