use thiserror::Error;

/// Controller-wide error type. Every variant that can cross the wire has a
/// stable numeric return code; see [`SchedError::wire_code`].
#[derive(Error, Debug)]
pub enum SchedError {
    #[error("user id missing or mismatched")]
    UserIdMissing,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid job id: {0}")]
    InvalidJobId(u32),

    #[error("invalid step id: {job_id}.{step_id}")]
    InvalidStepId { job_id: u32, step_id: u32 },

    #[error("invalid node name: {0}")]
    InvalidNodeName(String),

    #[error("invalid partition name: {0}")]
    InvalidPartitionName(String),

    #[error("invalid reservation name: {0}")]
    InvalidReservationName(String),

    #[error("already done")]
    AlreadyDone,

    #[error("operation disabled in current state")]
    Disabled,

    #[error("operation already in progress")]
    InProgress,

    #[error("no change in data")]
    NoChangeInData,

    #[error("job cannot start immediately")]
    CanNotStartImmediately,

    #[error("reservation busy")]
    ReservationBusy,

    #[error("reservation not usable")]
    ReservationNotUsable,

    #[error("resource busy")]
    ResourceBusy,

    #[error("duplicate job id: {0}")]
    DuplicateJobId(u32),

    #[error("required nodes not available")]
    NodeNotAvail,

    #[error("partition configuration unavailable")]
    PartConfigUnavailable,

    #[error("quality of service threshold reached")]
    QosThreshold,

    #[error("job is held")]
    JobHeld,

    #[error("prolog still running")]
    PrologRunning,

    #[error("credential invalid")]
    CredentialInvalid,

    #[error("credential revoked")]
    CredentialRevoked,

    #[error("communication error: {0}")]
    CommError(String),

    #[error("uid not found on node")]
    UidNotFound,

    #[error("gid not found on node")]
    GidNotFound,

    #[error("invalid accounting frequency")]
    InvalidAcctFreq,

    #[error("protocol version mismatch: peer {0}")]
    ProtocolVersion(u16),

    #[error("state file corrupt: {0}")]
    StateCorrupt(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode/decode error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

impl SchedError {
    /// Stable wire return code. Zero is reserved for success and never
    /// produced here.
    pub fn wire_code(&self) -> u32 {
        match self {
            SchedError::UserIdMissing => 2001,
            SchedError::AccessDenied => 2002,
            SchedError::InvalidJobId(_) => 2003,
            SchedError::InvalidStepId { .. } => 2004,
            SchedError::InvalidNodeName(_) => 2005,
            SchedError::InvalidPartitionName(_) => 2006,
            SchedError::InvalidReservationName(_) => 2007,
            SchedError::AlreadyDone => 2010,
            SchedError::Disabled => 2011,
            SchedError::InProgress => 2012,
            SchedError::NoChangeInData => 2013,
            SchedError::CanNotStartImmediately => 2014,
            SchedError::ReservationBusy => 2015,
            SchedError::ReservationNotUsable => 2016,
            SchedError::ResourceBusy => 2017,
            SchedError::DuplicateJobId(_) => 2018,
            SchedError::NodeNotAvail => 2020,
            SchedError::PartConfigUnavailable => 2021,
            SchedError::QosThreshold => 2022,
            SchedError::JobHeld => 2023,
            SchedError::PrologRunning => 2024,
            SchedError::CredentialInvalid => 2030,
            SchedError::CredentialRevoked => 2031,
            SchedError::CommError(_) => 2040,
            SchedError::UidNotFound => 2041,
            SchedError::GidNotFound => 2042,
            SchedError::InvalidAcctFreq => 2043,
            SchedError::ProtocolVersion(_) => 2050,
            SchedError::StateCorrupt(_) => 2060,
            SchedError::Io(_) => 2061,
            SchedError::Codec(_) => 2062,
            SchedError::Unexpected(_) => 2099,
        }
    }

    /// Transient capacity errors leave a non-immediate submit pending
    /// instead of failing it.
    pub fn leaves_job_pending(&self) -> bool {
        matches!(
            self,
            SchedError::NodeNotAvail
                | SchedError::PartConfigUnavailable
                | SchedError::QosThreshold
                | SchedError::JobHeld
                | SchedError::ReservationNotUsable
        )
    }
}
