//! Wire message vocabulary.
//!
//! Message types are 16-bit values drawn from closed numbered ranges:
//! 1001 cluster admin, 2001 info queries, 3001 configuration updates,
//! 4001 allocation, 5001 steps and completion, 6001 launch and signalling,
//! 7001 client notifications, 8001 generic return codes, 9001 forwarding
//! failures, 10001 accounting pushes. New types append to the end of their
//! range; renumbering breaks rolling upgrades.
//!
//! The codec that turns a [`Message`] into framed bytes is a port; the
//! default JSON codec here is enough for same-version clusters and tests.

pub mod dispatch;
pub mod handlers;
pub mod server;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PartitionDef;
use crate::error::{Result, SchedError};
use crate::ports::PriorityFactors;
use crate::state::AllocRequest;
use crate::telemetry::{DiagSnapshot, TelemetrySlot};

pub const PROTOCOL_VERSION: u16 = 3;

/// Initialization sentinel for the forward descriptor's count field.
pub const FORWARD_INIT: u16 = 0xfffe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MsgType {
    // 1001-series: cluster admin.
    RequestReconfigure = 1001,
    RequestShutdown = 1002,
    RequestTakeover = 1003,
    RequestPing = 1004,
    RequestSetDebugLevel = 1005,
    RequestSetDebugFlags = 1006,
    RequestSetSchedLogLevel = 1007,
    RequestRebootNodes = 1008,
    MessageNodeRegistration = 1009,

    // 2001-series: info queries.
    RequestJobInfo = 2001,
    ResponseJobInfo = 2002,
    RequestJobInfoSingle = 2003,
    RequestJobUserInfo = 2004,
    RequestNodeInfo = 2005,
    ResponseNodeInfo = 2006,
    RequestPartitionInfo = 2007,
    ResponsePartitionInfo = 2008,
    RequestReservationInfo = 2009,
    ResponseReservationInfo = 2010,
    RequestBuildInfo = 2011,
    ResponseBuildInfo = 2012,
    RequestPriorityFactors = 2013,
    ResponsePriorityFactors = 2014,
    RequestFrontEndInfo = 2015,
    ResponseFrontEndInfo = 2016,
    RequestStatsInfo = 2017,
    ResponseStatsInfo = 2018,
    RequestStatsReset = 2019,

    // 3001-series: configuration updates.
    RequestUpdateNode = 3001,
    RequestCreatePartition = 3002,
    RequestUpdatePartition = 3003,
    RequestDeletePartition = 3004,
    RequestCreateReservation = 3005,
    ResponseCreateReservation = 3006,
    RequestUpdateReservation = 3007,
    RequestDeleteReservation = 3008,

    // 4001-series: allocation.
    RequestResourceAllocation = 4001,
    ResponseResourceAllocation = 4002,
    RequestSubmitBatchJob = 4003,
    ResponseSubmitBatchJob = 4004,
    RequestJobWillRun = 4005,
    ResponseJobWillRun = 4006,
    RequestJobAllocInfo = 4007,
    ResponseJobAllocInfo = 4008,
    RequestJobReady = 4009,
    RequestJobSbcastCred = 4010,
    ResponseJobSbcastCred = 4011,
    RequestKillJob = 4012,
    RequestJobRequeue = 4013,

    // 5001-series: steps and completion.
    RequestJobStepCreate = 5001,
    ResponseJobStepCreate = 5002,
    RequestCancelJobStep = 5003,
    RequestStepComplete = 5004,
    RequestCompleteJobAllocation = 5005,
    RequestCompleteBatchScript = 5006,
    RequestCompleteProlog = 5007,
    RequestSuspend = 5008,
    RequestJobStepInfo = 5009,
    ResponseJobStepInfo = 5010,

    // 6001-series: launch and signalling (controller to node daemons).
    MessageEpilogComplete = 6001,
    RequestLaunchProlog = 6002,
    RequestBatchJobLaunch = 6003,
    RequestTerminateJob = 6004,
    RequestAbortJob = 6005,

    // 7001-series: client notifications.
    RequestJobNotify = 7001,

    // 8001-series: generic return codes.
    ResponseReturnCode = 8001,

    // 9001-series: forwarding failures.
    ResponseForwardFailure = 9001,

    // 10001-series: accounting pushes.
    MessageAccountingPush = 10001,
}

impl MsgType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Per-node result attached to a forwarded request's aggregate response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResult {
    pub node: String,
    pub return_code: u32,
}

/// Fan-out instruction carried in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardDescriptor {
    pub count: u16,
    pub nodelist: Vec<String>,
    pub timeout_ms: u32,
}

impl Default for ForwardDescriptor {
    fn default() -> Self {
        Self {
            count: FORWARD_INIT,
            nodelist: Vec::new(),
            timeout_ms: 0,
        }
    }
}

impl ForwardDescriptor {
    pub fn is_active(&self) -> bool {
        self.count != FORWARD_INIT && self.count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub msg_type: u16,
    pub body_length: u32,
    #[serde(default)]
    pub forward: ForwardDescriptor,
    #[serde(default)]
    pub orig_addr: Option<String>,
    #[serde(default)]
    pub ret_list: Vec<ForwardResult>,
}

impl Header {
    pub fn for_type(msg_type: MsgType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            msg_type: msg_type.code(),
            body_length: 0,
            forward: ForwardDescriptor::default(),
            orig_addr: None,
            ret_list: Vec::new(),
        }
    }
}

// Request payloads.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmitReq {
    pub name: String,
    pub user_id: u32,
    pub group_id: u32,
    pub request: AllocRequest,
    #[serde(default)]
    pub batch_script: Option<String>,
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub requeue: bool,
    #[serde(default)]
    pub hold: bool,
    #[serde(default)]
    pub spank_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIdReq {
    pub job_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepKillReq {
    pub job_id: u32,
    /// `BATCH_SCRIPT_STEP` targets the whole job.
    pub step_id: u32,
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueReq {
    pub job_id: u32,
    #[serde(default)]
    pub hold: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendOp {
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendReq {
    pub job_id: u32,
    pub op: SuspendOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCreateReq {
    pub job_id: u32,
    pub user_id: u32,
    pub name: String,
    pub node_cnt: u32,
    pub task_cnt: u32,
    pub cpus_per_task: u16,
    #[serde(default)]
    pub mem_per_node_mb: u64,
    /// Reserve an MPI port range for the step.
    #[serde(default)]
    pub want_ports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompleteReq {
    pub job_id: u32,
    pub step_id: u32,
    pub range_first: u32,
    pub range_last: u32,
    pub step_rc: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteJobAllocReq {
    pub job_id: u32,
    pub job_rc: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteBatchReq {
    pub job_id: u32,
    pub node_name: String,
    /// Exit code of the batch script itself.
    pub script_rc: i32,
    /// Node daemon's verdict on running it, as a wire code (0 = ok).
    pub daemon_rc: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePrologReq {
    pub job_id: u32,
    pub node_name: String,
    pub prolog_rc: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpilogCompleteMsg {
    pub job_id: u32,
    pub node_name: String,
    pub return_code: i32,
}

/// What a node says about itself when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistrationMsg {
    pub node_name: String,
    pub boards: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    pub cpus: u32,
    pub real_memory_mb: u64,
    pub tmp_disk_mb: u64,
    pub boot_time: Option<DateTime<Utc>>,
    pub cpu_load: Option<f32>,
    pub version: String,
    #[serde(default)]
    pub conf_hash: Option<u32>,
    /// Jobs the node believes it is running.
    #[serde(default)]
    pub running_job_ids: Vec<u32>,
    /// Steps the node believes it is running, as (job, step) pairs.
    #[serde(default)]
    pub running_steps: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateUpdate {
    Drain { reason: String },
    Resume,
    Down { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodeReq {
    pub node_names: Vec<String>,
    pub update: NodeStateUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootNodesReq {
    /// Empty list means every eligible node.
    #[serde(default)]
    pub node_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResvDescReq {
    pub name: String,
    pub node_names: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub users: Vec<u32>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub maint: bool,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameReq {
    pub name: String,
}

/// Info dumps short-circuit when nothing changed since `last_update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoReq {
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoReq {
    pub user_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityFactorsReq {
    #[serde(default)]
    pub job_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDebugLevelReq {
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDebugFlagsReq {
    pub set_bits: u64,
    pub clear_bits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReq {
    /// When set, skip the final state save.
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotifyReq {
    pub job_id: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingPushMsg {
    pub records: Vec<String>,
}

// Response payloads.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnCode {
    pub code: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ReturnCode {
    pub fn success() -> Self {
        Self {
            code: 0,
            detail: None,
        }
    }

    pub fn from_error(err: &SchedError) -> Self {
        Self {
            code: err.wire_code(),
            detail: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocationResp {
    pub job_id: u32,
    pub error_code: u32,
    pub node_list: Vec<String>,
    pub node_cnt: u32,
    pub cpus_per_node: Vec<u32>,
    #[serde(default)]
    pub pend_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchResp {
    pub job_id: u32,
    pub error_code: u32,
    #[serde(default)]
    pub pend_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WillRunResp {
    pub start_time: DateTime<Utc>,
    pub node_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAllocInfoResp {
    pub job_id: u32,
    pub node_list: Vec<String>,
    pub node_cnt: u32,
    pub cpus_per_node: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbcastCredResp {
    pub credential: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCreateResp {
    pub job_id: u32,
    pub step_id: u32,
    pub node_list: Vec<String>,
    pub tasks_per_node: Vec<u16>,
    pub port_range: Option<(u16, u16)>,
    pub credential: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfoItem {
    pub job_id: u32,
    pub name: String,
    pub user_id: u32,
    pub partition: String,
    pub state: String,
    pub state_flags: u16,
    pub reason: String,
    pub node_list: Vec<String>,
    pub node_cnt: u32,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub restart_cnt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfoResp {
    pub last_update: DateTime<Utc>,
    pub jobs: Vec<JobInfoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoItem {
    pub name: String,
    pub state: String,
    pub state_flags: u16,
    pub cpus: u32,
    pub real_memory_mb: u64,
    pub features: Vec<String>,
    pub reason: Option<String>,
    pub cpu_load: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoResp {
    pub last_update: DateTime<Utc>,
    pub nodes: Vec<NodeInfoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfoItem {
    pub name: String,
    pub nodes: Vec<String>,
    pub state: String,
    pub is_default: bool,
    pub priority: u32,
    pub max_time_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfoResp {
    pub last_update: DateTime<Utc>,
    pub partitions: Vec<PartitionInfoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationInfoItem {
    pub name: String,
    pub nodes: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub users: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationInfoResp {
    pub last_update: DateTime<Utc>,
    pub reservations: Vec<ReservationInfoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontEndInfoItem {
    pub name: String,
    pub state: String,
    pub job_cnt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontEndInfoResp {
    pub front_ends: Vec<FrontEndInfoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfoResp {
    pub cluster_name: String,
    pub protocol_version: u16,
    pub last_update: DateTime<Utc>,
    pub sched_defer: bool,
    pub min_job_age_secs: u64,
    pub node_timeout_secs: u64,
    pub partitions: Vec<PartitionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityFactorsResp {
    pub factors: Vec<(u32, PriorityFactors)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsInfoResp {
    pub by_type: Vec<TelemetrySlot>,
    pub by_user: Vec<TelemetrySlot>,
    pub diag: DiagSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfoItem {
    pub job_id: u32,
    pub step_id: u32,
    pub name: String,
    pub node_list: Vec<String>,
    pub task_cnt: u32,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfoResp {
    pub steps: Vec<StepInfoItem>,
}

/// The typed body of a message. The serde tag doubles as a sanity check
/// against the header's msg_type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Body {
    Empty,
    ReturnCode(ReturnCode),
    JobSubmit(JobSubmitReq),
    JobId(JobIdReq),
    StepKill(StepKillReq),
    Requeue(RequeueReq),
    Suspend(SuspendReq),
    StepCreate(StepCreateReq),
    StepComplete(StepCompleteReq),
    CompleteJobAlloc(CompleteJobAllocReq),
    CompleteBatch(CompleteBatchReq),
    CompleteProlog(CompletePrologReq),
    EpilogComplete(EpilogCompleteMsg),
    NodeRegistration(NodeRegistrationMsg),
    UpdateNode(UpdateNodeReq),
    RebootNodes(RebootNodesReq),
    ResvDesc(ResvDescReq),
    Name(NameReq),
    PartitionDesc(PartitionDef),
    Info(InfoReq),
    UserInfo(UserInfoReq),
    PriorityFactorsReq(PriorityFactorsReq),
    SetDebugLevel(SetDebugLevelReq),
    SetDebugFlags(SetDebugFlagsReq),
    Shutdown(ShutdownReq),
    JobNotify(JobNotifyReq),
    AccountingPush(AccountingPushMsg),

    ResourceAllocation(ResourceAllocationResp),
    SubmitBatch(SubmitBatchResp),
    WillRun(WillRunResp),
    JobAllocInfo(JobAllocInfoResp),
    SbcastCred(SbcastCredResp),
    StepCreateResp(StepCreateResp),
    JobInfo(JobInfoResp),
    NodeInfo(NodeInfoResp),
    PartitionInfo(PartitionInfoResp),
    ReservationInfo(ReservationInfoResp),
    FrontEndInfo(FrontEndInfoResp),
    BuildInfo(BuildInfoResp),
    PriorityFactors(PriorityFactorsResp),
    StatsInfo(StatsInfoResp),
    StepInfo(StepInfoResp),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn request(msg_type: MsgType, body: Body) -> Self {
        Self {
            header: Header::for_type(msg_type),
            body,
        }
    }

    pub fn response(msg_type: MsgType, body: Body) -> Self {
        Self {
            header: Header::for_type(msg_type),
            body,
        }
    }

    pub fn return_code(rc: ReturnCode) -> Self {
        Self::response(MsgType::ResponseReturnCode, Body::ReturnCode(rc))
    }

    pub fn msg_type(&self) -> Result<MsgType> {
        msg_type_from_code(self.header.msg_type)
    }
}

pub fn msg_type_from_code(code: u16) -> Result<MsgType> {
    use MsgType::*;
    let t = match code {
        1001 => RequestReconfigure,
        1002 => RequestShutdown,
        1003 => RequestTakeover,
        1004 => RequestPing,
        1005 => RequestSetDebugLevel,
        1006 => RequestSetDebugFlags,
        1007 => RequestSetSchedLogLevel,
        1008 => RequestRebootNodes,
        1009 => MessageNodeRegistration,
        2001 => RequestJobInfo,
        2002 => ResponseJobInfo,
        2003 => RequestJobInfoSingle,
        2004 => RequestJobUserInfo,
        2005 => RequestNodeInfo,
        2006 => ResponseNodeInfo,
        2007 => RequestPartitionInfo,
        2008 => ResponsePartitionInfo,
        2009 => RequestReservationInfo,
        2010 => ResponseReservationInfo,
        2011 => RequestBuildInfo,
        2012 => ResponseBuildInfo,
        2013 => RequestPriorityFactors,
        2014 => ResponsePriorityFactors,
        2015 => RequestFrontEndInfo,
        2016 => ResponseFrontEndInfo,
        2017 => RequestStatsInfo,
        2018 => ResponseStatsInfo,
        2019 => RequestStatsReset,
        3001 => RequestUpdateNode,
        3002 => RequestCreatePartition,
        3003 => RequestUpdatePartition,
        3004 => RequestDeletePartition,
        3005 => RequestCreateReservation,
        3006 => ResponseCreateReservation,
        3007 => RequestUpdateReservation,
        3008 => RequestDeleteReservation,
        4001 => RequestResourceAllocation,
        4002 => ResponseResourceAllocation,
        4003 => RequestSubmitBatchJob,
        4004 => ResponseSubmitBatchJob,
        4005 => RequestJobWillRun,
        4006 => ResponseJobWillRun,
        4007 => RequestJobAllocInfo,
        4008 => ResponseJobAllocInfo,
        4009 => RequestJobReady,
        4010 => RequestJobSbcastCred,
        4011 => ResponseJobSbcastCred,
        4012 => RequestKillJob,
        4013 => RequestJobRequeue,
        5001 => RequestJobStepCreate,
        5002 => ResponseJobStepCreate,
        5003 => RequestCancelJobStep,
        5004 => RequestStepComplete,
        5005 => RequestCompleteJobAllocation,
        5006 => RequestCompleteBatchScript,
        5007 => RequestCompleteProlog,
        5008 => RequestSuspend,
        5009 => RequestJobStepInfo,
        5010 => ResponseJobStepInfo,
        6001 => MessageEpilogComplete,
        6002 => RequestLaunchProlog,
        6003 => RequestBatchJobLaunch,
        6004 => RequestTerminateJob,
        6005 => RequestAbortJob,
        7001 => RequestJobNotify,
        8001 => ResponseReturnCode,
        9001 => ResponseForwardFailure,
        10001 => MessageAccountingPush,
        other => return Err(SchedError::Unexpected(format!("unknown msg_type {other}"))),
    };
    Ok(t)
}

/// Encode/decode seam: framing and versioned packing live outside the core.
pub trait WireCodec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Default codec: JSON body behind the length-prefixed frame the server
/// applies.
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut msg = msg.clone();
        let body_bytes = serde_json::to_vec(&msg.body)?;
        msg.header.body_length = body_bytes.len() as u32;
        Ok(serde_json::to_vec(&msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let msg: Message = serde_json::from_slice(bytes)?;
        if msg.header.version > PROTOCOL_VERSION {
            return Err(SchedError::ProtocolVersion(msg.header.version));
        }
        msg_type_from_code(msg.header.msg_type)?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_codes_roundtrip() {
        for t in [
            MsgType::RequestPing,
            MsgType::RequestJobInfo,
            MsgType::RequestResourceAllocation,
            MsgType::RequestStepComplete,
            MsgType::MessageEpilogComplete,
            MsgType::MessageAccountingPush,
        ] {
            assert_eq!(msg_type_from_code(t.code()).unwrap(), t);
        }
        assert!(msg_type_from_code(1234).is_err());
    }

    #[test]
    fn codec_roundtrip_sets_body_length() {
        let codec = JsonCodec;
        let msg = Message::request(
            MsgType::RequestKillJob,
            Body::StepKill(StepKillReq {
                job_id: 42,
                step_id: crate::state::BATCH_SCRIPT_STEP,
                signal: 9,
            }),
        );
        let bytes = codec.encode(&msg).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.header.msg_type, MsgType::RequestKillJob.code());
        assert!(back.header.body_length > 0);
        match back.body {
            Body::StepKill(k) => assert_eq!((k.job_id, k.signal), (42, 9)),
            other => panic!("wrong body {other:?}"),
        }
    }

    #[test]
    fn future_version_rejected() {
        let codec = JsonCodec;
        let mut msg = Message::request(MsgType::RequestPing, Body::Empty);
        msg.header.version = PROTOCOL_VERSION + 1;
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(
            codec.decode(&bytes),
            Err(SchedError::ProtocolVersion(_))
        ));
    }

    #[test]
    fn forward_descriptor_sentinel() {
        let fwd = ForwardDescriptor::default();
        assert_eq!(fwd.count, FORWARD_INIT);
        assert!(!fwd.is_active());
        let active = ForwardDescriptor {
            count: 2,
            nodelist: vec!["n1".into(), "n2".into()],
            timeout_ms: 1000,
        };
        assert!(active.is_active());
    }
}
