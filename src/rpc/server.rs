//! Framed RPC server.
//!
//! Frame layout on the wire: `u32 auth_len | auth bytes | u32 msg_len |
//! msg bytes`, both lengths big-endian. The auth blob goes to the auth
//! port; the message bytes go through the codec port. Handlers run as one
//! task per connection, many connections in parallel; the response is
//! written on the same connection the request arrived on.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::controller::Controller;
use crate::error::{Result, SchedError};
use crate::rpc::dispatch::dispatch;
use crate::rpc::{Message, ReturnCode};

/// One frame section cannot exceed this; anything larger is a protocol
/// error, not a real message.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

pub struct RpcServer {
    ctl: Arc<Controller>,
    listener: TcpListener,
}

impl RpcServer {
    /// Binds the listen socket. Failure to bind is fatal and propagates.
    pub async fn bind(ctl: Arc<Controller>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "rpc server listening");
        Ok(Self { ctl, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.ctl.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let ctl = Arc::clone(&self.ctl);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(ctl, stream, peer).await {
                            tracing::debug!(peer = %peer, error = %e, "connection closed");
                        }
                    });
                }
            }
        }
        tracing::info!("rpc server stopped");
        Ok(())
    }
}

async fn serve_connection(
    ctl: Arc<Controller>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    loop {
        let (auth_blob, msg_bytes) = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // clean EOF
            Err(e) => return Err(e),
        };

        let identity = match ctl.ports.auth.verify(&auth_blob) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    peer = %peer,
                    detail = %ctl.ports.auth.error_string(&auth_blob),
                    "authentication failed"
                );
                let resp = Message::return_code(ReturnCode::from_error(&e));
                write_response(&ctl, &mut stream, &resp).await?;
                continue;
            }
        };

        let msg = match ctl.codec.decode(&msg_bytes) {
            Ok(m) => m,
            Err(e) => {
                let resp = Message::return_code(ReturnCode::from_error(&e));
                write_response(&ctl, &mut stream, &resp).await?;
                continue;
            }
        };

        let response = dispatch(&ctl, identity, msg).await;
        // The handler's state changes are committed; a failed response
        // write is logged, never rolled back. The one exception is a fresh
        // allocation whose owner vanished before learning its job id.
        if let Err(e) = write_response(&ctl, &mut stream, &response).await {
            tracing::warn!(peer = %peer, error = %e, "response write failed");
            if let crate::rpc::Body::ResourceAllocation(alloc) = &response.body {
                if alloc.error_code == 0 {
                    kill_job_on_msg_fail(&ctl, alloc.job_id).await;
                }
            }
            return Err(e);
        }
    }
}

/// The allocate response never reached the client, so nobody owns the new
/// allocation; cancel it and let the epilogs reclaim the nodes.
async fn kill_job_on_msg_fail(ctl: &Controller, job_id: u32) {
    tracing::error!(job_id, "allocate response lost, killing job");
    let now = ctl.now();
    let mut guard = ctl.state.acquire(crate::locks::sets::JOB_WRITE).await;
    let config = guard.config_snapshot();
    let split = crate::controller::split_guard(&mut guard);
    if let Err(e) =
        crate::reconcile::cancel_job(split.jobs, split.nodes, &config, &ctl.agent, job_id, now)
    {
        tracing::warn!(job_id, error = %e, "kill on message failure");
    }
    drop(guard);
    ctl.request_job_save();
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let auth_len = match stream.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if auth_len > MAX_FRAME {
        return Err(SchedError::CommError("auth frame too large".into()));
    }
    let mut auth = vec![0u8; auth_len as usize];
    stream.read_exact(&mut auth).await?;

    let msg_len = stream.read_u32().await?;
    if msg_len > MAX_FRAME {
        return Err(SchedError::CommError("message frame too large".into()));
    }
    let mut msg = vec![0u8; msg_len as usize];
    stream.read_exact(&mut msg).await?;
    Ok(Some((auth, msg)))
}

async fn write_response(
    ctl: &Controller,
    stream: &mut TcpStream,
    response: &Message,
) -> Result<()> {
    let bytes = ctl.codec.encode(response)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Minimal client used by tools and tests: one request, one response.
pub struct RpcClient {
    stream: TcpStream,
    auth: Vec<u8>,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr, auth: Vec<u8>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream, auth })
    }

    pub async fn call(&mut self, codec: &dyn crate::rpc::WireCodec, msg: &Message) -> Result<Message> {
        let bytes = codec.encode(msg)?;
        self.stream.write_u32(self.auth.len() as u32).await?;
        self.stream.write_all(&self.auth).await?;
        self.stream.write_u32(bytes.len() as u32).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        let len = self.stream.read_u32().await?;
        if len > MAX_FRAME {
            return Err(SchedError::CommError("response too large".into()));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).await?;
        codec.decode(&buf)
    }
}
