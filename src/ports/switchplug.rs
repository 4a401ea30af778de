//! Switch/select port: opaque per-job and per-step plugin payloads packed
//! into credentials and records. The core never inspects the bytes.

use crate::state::PluginData;

pub trait SwitchPlugin: Send + Sync {
    /// Per-job payload created at allocation, if the plugin wants one.
    fn job_data(&self, job_id: u32) -> Option<PluginData>;

    /// Per-step payload created at step launch, if the plugin wants one.
    fn step_data(&self, job_id: u32, step_id: u32) -> Option<PluginData>;
}

/// No switch plugin configured.
pub struct NullSwitch;

impl SwitchPlugin for NullSwitch {
    fn job_data(&self, _job_id: u32) -> Option<PluginData> {
        None
    }

    fn step_data(&self, _job_id: u32, _step_id: u32) -> Option<PluginData> {
        None
    }
}
