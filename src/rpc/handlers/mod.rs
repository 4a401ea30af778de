//! RPC handlers, grouped the way the message ranges group them. Each
//! handler acquires its own lock subset and returns a fully-formed
//! response message; the dispatcher maps errors to return codes.

pub mod admin;
pub mod complete;
pub mod info;
pub mod job;
pub mod node;
pub mod resv;
pub mod step;

use crate::rpc::dispatch::ReqCtx;

/// Write access to a specific job: owner or operator.
pub fn can_modify_job(ctx: &ReqCtx, job_uid: u32) -> bool {
    ctx.uid == job_uid || ctx.is_operator
}

/// Read access under a privacy mask bit: operators always, owners always,
/// everyone when the bit is clear.
pub fn can_view(ctx: &ReqCtx, mask: u32, bit: u32, owner_uid: Option<u32>) -> bool {
    if ctx.is_operator || mask & bit == 0 {
        return true;
    }
    owner_uid == Some(ctx.uid)
}
