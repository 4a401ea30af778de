pub mod agent;
pub mod bitmap;
pub mod config;
pub mod controller;
pub mod cred;
pub mod error;
pub mod health;
pub mod ids;
pub mod locks;
pub mod persist;
pub mod ports;
pub mod reconcile;
pub mod rpc;
pub mod sched;
pub mod shutdown;
pub mod state;
pub mod stepmgr;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod config_for_tests {
    use crate::config::*;

    /// Smallest valid cluster: one node, one partition.
    pub fn minimal() -> ClusterConfig {
        ClusterConfig {
            cluster_name: "test".into(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_name: None,
            nodes: vec![NodeDef {
                name: "n1".into(),
                addr: None,
                boards: 1,
                sockets: 1,
                cores_per_socket: 4,
                threads_per_core: 1,
                cpus: 4,
                real_memory_mb: 8192,
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
            max_job_id: 99999,
            min_job_age_secs: 300,
            node_timeout_secs: 300,
            node_down_secs: 600,
            max_restarts: 3,
            sched_defer: false,
            sched_interval_secs: 60,
            fast_schedule: false,
            state_save_dir: std::env::temp_dir().join("grid-lite-test"),
            cred_key: "test-key".into(),
            conf_hash: 0,
        }
    }
}
