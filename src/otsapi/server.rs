//! OTSAPI endpoint
//!
//! Accept loop on the administrative socket; every client is served by
//! its own task. Frames are 4-byte big-endian length plus a JSON
//! document, one request per frame, one response per request.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::otsapi::{OtsApiHandler, OtsRequest, OtsResponse};

/// Windows-style name of the administrative endpoint.
pub const OTSAPI_PIPE: &str = "\\\\.\\pipe\\ogon_SessionManager_otsapi";

const MAX_REQUEST_SIZE: u32 = 1024 * 1024;

pub struct OtsApiServer {
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

impl OtsApiServer {
    pub fn start(ctx: Arc<AppContext>) -> anyhow::Result<Self> {
        let path = ctx.pipe_path(OTSAPI_PIPE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!(endpoint = %path.display(), "OTSAPI listening");

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        let worker = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            warn!(%err, "accept on OTSAPI endpoint failed");
                            break;
                        }
                    },
                };
                let ctx = ctx.clone();
                let client_cancel = loop_cancel.clone();
                loop_tracker.spawn(async move {
                    serve_client(ctx, stream, client_cancel).await;
                });
            }
            info!("OTSAPI stopped");
        });

        Ok(Self {
            cancel,
            worker: parking_lot::Mutex::new(Some(worker)),
            tracker,
        })
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn serve_client(ctx: Arc<AppContext>, mut stream: UnixStream, cancel: CancellationToken) {
    let handler = OtsApiHandler::new(ctx);
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            read = read_frame(&mut stream) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    debug!(%err, "OTSAPI client read failed");
                    return;
                }
            },
        };

        let response = match serde_json::from_slice::<OtsRequest>(&request) {
            Ok(request) => handler.handle(request).await,
            Err(err) => OtsResponse::Error {
                message: format!("malformed request: {}", err),
            },
        };

        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "response serialization failed");
                return;
            }
        };
        if write_frame(&mut stream, &body).await.is_err() {
            return;
        }
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let length = u32::from_be_bytes(header);
    if length > MAX_REQUEST_SIZE {
        return Err(std::io::Error::other("request too large"));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut UnixStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await
}
