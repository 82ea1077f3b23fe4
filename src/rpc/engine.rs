//! RPC engine serve loop
//!
//! Listens on the session-manager pipe, serves one front end at a
//! time and multiplexes frame reading with the outgoing queue. A pipe
//! error tears the client down, aborts every pending out-call and
//! resets the connection store.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::protocol::{
    status, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, SESSION_MANAGER_PIPE,
};
use crate::rpc::envelope::{Framer, RpcEnvelope, RpcStatus, VersionInfo};
use crate::rpc::{CallOutcome, OutboundItem, PeerCredentials, RpcError};

enum ServeEnd {
    ClientGone,
    Shutdown,
}

pub struct RpcEngine {
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RpcEngine {
    /// Bind the endpoint and spawn the serve loop.
    pub fn start(ctx: Arc<AppContext>) -> anyhow::Result<Self> {
        let path = ctx.pipe_path(SESSION_MANAGER_PIPE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!(endpoint = %path.display(), "RPC engine listening");

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            listener_loop(ctx, listener, loop_cancel).await;
        });

        Ok(Self {
            cancel,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    pub async fn stop(&self, ctx: &Arc<AppContext>) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        ctx.rpc.abort_all_pending(status::TRANSPORT_ERROR);
        ctx.rpc.fail_queued_requests(status::TRANSPORT_ERROR);
    }
}

async fn listener_loop(ctx: Arc<AppContext>, listener: UnixListener, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    error!(%err, "accept on RPC endpoint failed");
                    break;
                }
            },
        };

        match stream.peer_cred() {
            Ok(cred) => {
                debug!(uid = cred.uid(), pid = ?cred.pid(), "front end connected");
                ctx.rpc.set_peer(Some(PeerCredentials {
                    uid: cred.uid(),
                    gid: cred.gid(),
                    pid: cred.pid(),
                }));
            }
            Err(err) => warn!(%err, "could not read peer credentials"),
        }

        let end = serve_client(&ctx, stream, &cancel).await;

        ctx.rpc.set_peer(None);
        ctx.rpc.abort_all_pending(status::TRANSPORT_ERROR);
        ctx.rpc_disconnected();

        match end {
            ServeEnd::Shutdown => break,
            ServeEnd::ClientGone => {
                info!("front end disconnected, awaiting reconnect");
            }
        }
    }
    info!("RPC engine stopped");
}

async fn serve_client(
    ctx: &Arc<AppContext>,
    stream: UnixStream,
    cancel: &CancellationToken,
) -> ServeEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut framer = Framer::new();
    let mut buffer = vec![0u8; 16 * 1024];
    let mut handshaken = false;

    loop {
        // a wakeup can get consumed by a select branch that loses the
        // race; draining up front keeps the queue moving regardless
        if !ctx.rpc.outgoing().is_empty()
            && flush_outgoing(ctx, &mut writer).await.is_err()
        {
            return ServeEnd::ClientGone;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ServeEnd::Shutdown,

            read = reader.read(&mut buffer) => {
                let n = match read {
                    Ok(0) => return ServeEnd::ClientGone,
                    Ok(n) => n,
                    Err(err) => {
                        warn!(%err, "pipe read failed");
                        return ServeEnd::ClientGone;
                    }
                };
                framer.extend(&buffer[..n]);
                loop {
                    let body = match framer.next_frame() {
                        Ok(Some(body)) => body,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "framing error, dropping client");
                            return ServeEnd::ClientGone;
                        }
                    };
                    let env = match RpcEnvelope::decode_body(&body) {
                        Ok(env) => env,
                        Err(err) => {
                            warn!(%err, "undecodable envelope, dropping client");
                            return ServeEnd::ClientGone;
                        }
                    };

                    if !handshaken {
                        if let Err(err) = handshake(env, &mut writer).await {
                            warn!(%err, "version handshake failed");
                            return ServeEnd::ClientGone;
                        }
                        handshaken = true;
                        continue;
                    }

                    process_envelope(ctx, env).await;
                }
            }

            _ = ctx.rpc.outgoing().ready() => {
                if flush_outgoing(ctx, &mut writer).await.is_err() {
                    return ServeEnd::ClientGone;
                }
            }
        }
    }
}

/// First frame must carry version info. Exactly one version reply is
/// written; a differing remote major closes the pipe afterwards.
async fn handshake(env: RpcEnvelope, writer: &mut OwnedWriteHalf) -> Result<(), RpcError> {
    let Some(remote) = env.versioninfo else {
        return Err(RpcError::MissingVersionInfo);
    };
    debug!(
        remote_major = remote.vmajor,
        remote_minor = remote.vminor,
        "front end version received"
    );

    let reply = RpcEnvelope {
        tag: env.tag,
        msgtype: env.msgtype,
        isresponse: true,
        status: RpcStatus::Success as i32,
        payload: None,
        errordescription: None,
        versioninfo: Some(VersionInfo {
            vmajor: PROTOCOL_VERSION_MAJOR,
            vminor: PROTOCOL_VERSION_MINOR,
        }),
    };
    writer.write_all(&reply.to_frame()).await?;

    if remote.vmajor != PROTOCOL_VERSION_MAJOR {
        return Err(RpcError::VersionMismatch {
            remote: remote.vmajor,
            local: PROTOCOL_VERSION_MAJOR,
        });
    }
    Ok(())
}

async fn process_envelope(ctx: &Arc<AppContext>, env: RpcEnvelope) {
    if env.isresponse {
        let Some(shared) = ctx.rpc.take_pending(env.tag) else {
            warn!(tag = env.tag, "response for unknown call, dropping");
            return;
        };
        let outcome = match env.status_decoded() {
            RpcStatus::Success => {
                CallOutcome::success(env.payload.unwrap_or_default().into())
            }
            RpcStatus::Failed => CallOutcome::failed(env.errordescription),
            RpcStatus::NotFound => CallOutcome::error(status::NOT_FOUND),
        };
        shared.complete(outcome);
        return;
    }

    let call = crate::rpc::calls::IncomingCall::new(
        env.tag,
        env.msgtype as u16,
        env.payload.unwrap_or_default().into(),
        ctx.rpc.clone(),
    );
    ctx.calls.dispatch(call, ctx).await;
}

async fn flush_outgoing(
    ctx: &Arc<AppContext>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), RpcError> {
    let items = ctx.rpc.outgoing().drain();
    let mut iter = items.into_iter();

    while let Some(item) = iter.next() {
        let result = write_item(ctx, writer, item).await;
        if let Err(err) = result {
            warn!(%err, "pipe write failed");
            // everything already drained but unsent dies with the pipe
            for item in iter {
                if let OutboundItem::Request { shared, .. } = item {
                    shared.complete(CallOutcome::error(status::TRANSPORT_ERROR));
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

async fn write_item(
    ctx: &Arc<AppContext>,
    writer: &mut OwnedWriteHalf,
    item: OutboundItem,
) -> Result<(), RpcError> {
    match item {
        OutboundItem::Response {
            tag,
            call_type,
            status,
            payload,
            error_description,
        } => {
            let env = RpcEnvelope {
                tag,
                msgtype: call_type as u32,
                isresponse: true,
                status: status as i32,
                payload: (status == RpcStatus::Success).then_some(payload),
                errordescription: error_description,
                versioninfo: None,
            };
            writer.write_all(&env.to_frame()).await?;
            Ok(())
        }
        OutboundItem::Request {
            call_type,
            payload,
            shared,
        } => {
            if shared.is_completed() {
                // timed out before it was ever written
                return Ok(());
            }
            let tag = ctx.rpc.allocate_tag();
            shared.set_tag(tag);
            ctx.rpc.insert_pending(tag, shared.clone());

            let env = RpcEnvelope {
                tag,
                msgtype: call_type as u32,
                isresponse: false,
                status: RpcStatus::Success as i32,
                payload: Some(payload),
                errordescription: None,
                versioninfo: None,
            };
            match writer.write_all(&env.to_frame()).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    ctx.rpc.take_pending(tag);
                    shared.complete(CallOutcome::error(status::TRANSPORT_ERROR));
                    Err(err.into())
                }
            }
        }
    }
}
