//! RPC engine
//!
//! Carries the internal communication protocol (ICP) between the
//! session manager and the RDP front end, and the relayed subprocess
//! backend protocol (SBP). One duplex pipe, length-prefixed protobuf
//! envelopes, request/response correlation by tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::status;
use crate::queue::SignalingQueue;
use crate::rpc::envelope::RpcStatus;

pub mod calls;
pub mod engine;
pub mod envelope;
pub mod messages;

pub use engine::RpcEngine;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),

    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("pipe i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("first frame carried no version info")]
    MissingVersionInfo,

    #[error("protocol major version mismatch (remote {remote}, local {local})")]
    VersionMismatch { remote: u32, local: u32 },
}

/// Identity of the connected front-end process, read from the socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// Final result of an out-call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// One of the [`crate::protocol::status`] codes.
    pub code: u32,
    pub payload: Bytes,
    pub error_description: Option<String>,
}

impl CallOutcome {
    pub fn success(payload: Bytes) -> Self {
        Self {
            code: status::SUCCESS,
            payload,
            error_description: None,
        }
    }

    pub fn error(code: u32) -> Self {
        Self {
            code,
            payload: Bytes::new(),
            error_description: None,
        }
    }

    pub fn failed(description: Option<String>) -> Self {
        Self {
            code: status::FAILED,
            payload: Bytes::new(),
            error_description: description,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }

    /// Decode the response payload of a successful call.
    pub fn decode<M: prost::Message + Default>(&self) -> Result<M, RpcError> {
        M::decode(self.payload.as_ref()).map_err(RpcError::Decode)
    }
}

/// Shared state of one out-call, referenced by the waiter, the writer
/// loop and the pending-call map. Completion is once-only.
pub struct OutCallShared {
    tag: Mutex<Option<u32>>,
    tx: Mutex<Option<oneshot::Sender<CallOutcome>>>,
}

impl OutCallShared {
    fn new(tx: oneshot::Sender<CallOutcome>) -> Self {
        Self {
            tag: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn tag(&self) -> Option<u32> {
        *self.tag.lock()
    }

    pub(crate) fn set_tag(&self, tag: u32) {
        *self.tag.lock() = Some(tag);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub(crate) fn complete(&self, outcome: CallOutcome) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

/// An element of the outgoing queue.
pub enum OutboundItem {
    /// Finished in-call: a response to the peer.
    Response {
        tag: u32,
        call_type: u16,
        status: RpcStatus,
        payload: Vec<u8>,
        error_description: Option<String>,
    },
    /// New out-call; the tag is assigned when it is actually written.
    Request {
        call_type: u16,
        payload: Vec<u8>,
        shared: Arc<OutCallShared>,
    },
}

/// State shared between the engine loop and everyone producing or
/// awaiting calls.
pub struct RpcCore {
    outgoing: SignalingQueue<OutboundItem>,
    pending: Mutex<HashMap<u32, Arc<OutCallShared>>>,
    next_tag: AtomicU32,
    peer: Mutex<Option<PeerCredentials>>,
}

impl RpcCore {
    pub fn new() -> Self {
        Self {
            outgoing: SignalingQueue::new(),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU32::new(1),
            peer: Mutex::new(None),
        }
    }

    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        *self.peer.lock()
    }

    pub(crate) fn set_peer(&self, peer: Option<PeerCredentials>) {
        *self.peer.lock() = peer;
    }

    /// The outgoing queue: responses and out-call requests awaiting
    /// the writer.
    pub fn outgoing(&self) -> &SignalingQueue<OutboundItem> {
        &self.outgoing
    }

    pub(crate) fn allocate_tag(&self) -> u32 {
        let mut tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if tag == 0 {
            tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        }
        tag
    }

    pub(crate) fn insert_pending(&self, tag: u32, shared: Arc<OutCallShared>) {
        self.pending.lock().insert(tag, shared);
    }

    pub(crate) fn take_pending(&self, tag: u32) -> Option<Arc<OutCallShared>> {
        self.pending.lock().remove(&tag)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a response produced by an in-call handler.
    pub fn queue_response(
        &self,
        tag: u32,
        call_type: u16,
        status: RpcStatus,
        payload: Vec<u8>,
        error_description: Option<String>,
    ) {
        self.outgoing.push(OutboundItem::Response {
            tag,
            call_type,
            status,
            payload,
            error_description,
        });
    }

    /// Queue an out-call without waiting for its result.
    pub fn post(&self, call_type: u16, payload: Vec<u8>) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(OutCallShared::new(tx));
        self.outgoing.push(OutboundItem::Request {
            call_type,
            payload,
            shared,
        });
        rx
    }

    /// Queue an out-call and wait for the response.
    ///
    /// A wait that expires while the call is still pending removes the
    /// pending slot and reports `CALL_TIMEOUT`. If the slot is already
    /// gone the response path is servicing the call concurrently; the
    /// wait then continues unbounded, which is safe because completion
    /// is imminent and once-only.
    pub async fn call(
        &self,
        call_type: u16,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> CallOutcome {
        let (tx, mut rx) = oneshot::channel();
        let shared = Arc::new(OutCallShared::new(tx));
        self.outgoing.push(OutboundItem::Request {
            call_type,
            payload,
            shared: shared.clone(),
        });

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CallOutcome::error(status::TRANSPORT_ERROR),
            Err(_elapsed) => {
                let still_pending = match shared.tag() {
                    Some(tag) => self.take_pending(tag).is_some(),
                    // never written to the pipe
                    None => true,
                };
                if still_pending {
                    debug!(call_type, "out-call timed out");
                    shared.complete(CallOutcome::error(status::CALL_TIMEOUT));
                }
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => CallOutcome::error(status::TRANSPORT_ERROR),
                }
            }
        }
    }

    /// Queue an out-call and wait without a deadline. Only for
    /// internal paths where completion is guaranteed: the response, a
    /// transport reset and engine shutdown all resolve the wait.
    pub async fn call_unbounded(&self, call_type: u16, payload: Vec<u8>) -> CallOutcome {
        let rx = self.post(call_type, payload);
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => CallOutcome::error(status::TRANSPORT_ERROR),
        }
    }

    /// Fail out-calls still sitting unsent in the outgoing queue
    /// (engine shutdown). Responses are dropped.
    pub fn fail_queued_requests(&self, code: u32) {
        for item in self.outgoing.drain() {
            if let OutboundItem::Request { shared, .. } = item {
                shared.complete(CallOutcome::error(code));
            }
        }
    }

    /// Fail every pending out-call (transport reset).
    pub fn abort_all_pending(&self, code: u32) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "aborting pending out-calls");
        }
        for (_tag, shared) in drained {
            shared.complete(CallOutcome::error(code));
        }
    }
}

impl Default for RpcCore {
    fn default() -> Self {
        Self::new()
    }
}
