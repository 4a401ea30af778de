//! Outbound agent queue.
//!
//! Handlers never talk to node daemons while holding the lock domain; they
//! enqueue messages here and the pump task delivers them through the
//! transport port, retrying transient failures with jittered backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedError};

const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Messages the controller sends to node daemons (or front ends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPayload {
    /// Run the job prolog; the node answers with a prolog-complete RPC.
    PrologLaunch { job_id: u32, credential: Vec<u8> },
    /// Launch the batch script on the batch host.
    BatchLaunch {
        job_id: u32,
        script: String,
        credential: Vec<u8>,
    },
    /// Signal every task of a job (or its whole allocation).
    KillJob { job_id: u32, signal: i32 },
    /// Signal one step.
    KillStep {
        job_id: u32,
        step_id: u32,
        signal: i32,
    },
    /// The node reported a job the controller does not know; abort it.
    AbortJob { job_id: u32 },
    /// Text delivered to a job's stderr via the node daemon.
    UserMessage { job_id: u32, message: String },
    /// Reboot request issued by the admin reboot RPC.
    Reboot,
    /// A forwarded wire message, relayed verbatim for fan-out requests.
    Relay { msg_type: u16, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMsg {
    pub target: String,
    pub payload: AgentPayload,
}

/// Delivery seam. Real deployments speak the wire protocol to the node's
/// daemon port; tests capture messages.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn deliver(&self, msg: &AgentMsg) -> Result<()>;
}

/// Default transport: log and succeed. Useful for bring-up without nodes.
pub struct LogTransport;

#[async_trait]
impl NodeTransport for LogTransport {
    async fn deliver(&self, msg: &AgentMsg) -> Result<()> {
        tracing::info!(target = %msg.target, payload = ?msg.payload, "agent deliver");
        Ok(())
    }
}

/// Capturing transport for tests.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: std::sync::Mutex<Vec<AgentMsg>>,
}

#[async_trait]
impl NodeTransport for RecordingTransport {
    async fn deliver(&self, msg: &AgentMsg) -> Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Handle the handlers use to enqueue outbound traffic.
#[derive(Clone)]
pub struct AgentQueue {
    tx: mpsc::UnboundedSender<AgentMsg>,
}

impl AgentQueue {
    /// Creates the queue and spawns its pump task.
    pub fn start(transport: Arc<dyn NodeTransport>, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(rx, transport, shutdown));
        Self { tx }
    }

    pub fn send(&self, target: impl Into<String>, payload: AgentPayload) {
        let msg = AgentMsg {
            target: target.into(),
            payload,
        };
        if self.tx.send(msg).is_err() {
            tracing::warn!("agent queue closed; dropping outbound message");
        }
    }

    /// Fans one payload out to a node list.
    pub fn broadcast(&self, targets: &[String], payload: AgentPayload) {
        for t in targets {
            self.send(t.clone(), payload.clone());
        }
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<AgentMsg>,
    transport: Arc<dyn NodeTransport>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        deliver_with_retry(transport.as_ref(), &msg).await;
    }
    tracing::debug!("agent queue pump stopped");
}

async fn deliver_with_retry(transport: &dyn NodeTransport, msg: &AgentMsg) {
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match transport.deliver(msg).await {
            Ok(()) => return,
            Err(SchedError::CommError(e)) if attempt < MAX_DELIVERY_ATTEMPTS => {
                let jitter_ms = rand::thread_rng().gen_range(50..250) * attempt as u64;
                tracing::debug!(
                    target = %msg.target,
                    attempt,
                    error = %e,
                    "agent delivery failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
            Err(e) => {
                tracing::warn!(target = %msg.target, error = %e, "agent delivery dropped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let token = CancellationToken::new();
        let queue = AgentQueue::start(transport.clone(), token.clone());
        queue.send("n1", AgentPayload::KillJob { job_id: 7, signal: 9 });
        queue.broadcast(
            &["n1".into(), "n2".into()],
            AgentPayload::AbortJob { job_id: 8 },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].target, "n1");
        assert_eq!(sent[2].target, "n2");
        token.cancel();
    }

    struct FlakyTransport {
        fails_left: std::sync::Mutex<u32>,
        inner: RecordingTransport,
    }

    #[async_trait]
    impl NodeTransport for FlakyTransport {
        async fn deliver(&self, msg: &AgentMsg) -> Result<()> {
            let should_fail = {
                let mut fails = self.fails_left.lock().unwrap();
                if *fails > 0 {
                    *fails -= 1;
                    true
                } else {
                    false
                }
            };
            if should_fail {
                return Err(SchedError::CommError("connect refused".into()));
            }
            self.inner.deliver(msg).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = Arc::new(FlakyTransport {
            fails_left: std::sync::Mutex::new(2),
            inner: RecordingTransport::default(),
        });
        let token = CancellationToken::new();
        let queue = AgentQueue::start(transport.clone(), token.clone());
        queue.send("n1", AgentPayload::Reboot);
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.inner.sent.lock().unwrap().len(), 1);
        token.cancel();
    }
}
