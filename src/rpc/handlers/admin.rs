//! Administrative handlers: ping, reconfigure, shutdown, takeover, and the
//! runtime debug knobs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use crate::controller::Controller;
use crate::error::Result;
use crate::rpc::{Message, ReturnCode, SetDebugFlagsReq, SetDebugLevelReq, ShutdownReq};

/// Hook installed by `main` to retarget the tracing filter at runtime.
/// Level 0 = error .. 4 = trace, matching the set_debug_level RPC.
static LOG_LEVEL_HOOK: OnceLock<Box<dyn Fn(u32) + Send + Sync>> = OnceLock::new();

/// Separate verbosity knob for scheduler-specific logging.
static SCHED_LOG_LEVEL: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

pub fn install_log_level_hook(hook: Box<dyn Fn(u32) + Send + Sync>) {
    let _ = LOG_LEVEL_HOOK.set(hook);
}

pub fn sched_log_level() -> u32 {
    SCHED_LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn ping() -> Result<Message> {
    Ok(Message::return_code(ReturnCode::success()))
}

pub async fn reconfigure(ctl: &Arc<Controller>) -> Result<Message> {
    ctl.reconfigure().await?;
    Ok(Message::return_code(ReturnCode::success()))
}

/// Responds first, then cancels the run token so the response still makes
/// it out before the accept loop dies.
pub async fn shutdown(ctl: &Arc<Controller>, req: &ShutdownReq) -> Result<Message> {
    tracing::info!(immediate = req.immediate, "shutdown requested");
    let token = ctl.shutdown.clone();
    let immediate = req.immediate;
    tokio::spawn(async move {
        if !immediate {
            // Let the response escape before the accept loop dies.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        token.cancel();
    });
    Ok(Message::return_code(ReturnCode::success()))
}

/// Primary/backup handoff. With a single active controller this reduces to
/// confirming we already hold the controllership.
pub async fn takeover(ctl: &Arc<Controller>) -> Result<Message> {
    tracing::info!(boot_time = %ctl.boot_time, "takeover requested; already primary");
    Ok(Message::return_code(ReturnCode::success()))
}

pub fn set_debug_level(req: &SetDebugLevelReq) -> Result<Message> {
    if let Some(hook) = LOG_LEVEL_HOOK.get() {
        hook(req.level);
        tracing::info!(level = req.level, "debug level set");
    } else {
        tracing::warn!(level = req.level, "no log reload hook installed");
    }
    Ok(Message::return_code(ReturnCode::success()))
}

pub fn set_debug_flags(ctl: &Arc<Controller>, req: &SetDebugFlagsReq) -> Result<Message> {
    let mut flags = ctl.debug_flags.load(Ordering::Relaxed);
    flags |= req.set_bits;
    flags &= !req.clear_bits;
    ctl.debug_flags.store(flags, Ordering::Relaxed);
    tracing::info!(flags = format!("0x{flags:x}"), "debug flags updated");
    Ok(Message::return_code(ReturnCode::success()))
}

pub fn set_schedlog_level(req: &SetDebugLevelReq) -> Result<Message> {
    SCHED_LOG_LEVEL.store(req.level, Ordering::Relaxed);
    tracing::info!(level = req.level, "sched log level set");
    Ok(Message::return_code(ReturnCode::success()))
}
