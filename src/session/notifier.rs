//! Session notification sink
//!
//! State transitions are announced to an external notifier (the
//! production deployment forwards them to the system bus; that sink
//! lives outside this crate). The default implementation just traces.

use tracing::info;

use crate::session::state::NotificationReason;

/// Receiver of session state-change notifications.
pub trait SessionNotifier: Send + Sync {
    fn notify(&self, reason: NotificationReason, session_id: u32);
}

/// Notifier that logs every event.
pub struct LogNotifier;

impl SessionNotifier for LogNotifier {
    fn notify(&self, reason: NotificationReason, session_id: u32) {
        info!(
            session = session_id,
            reason = ?reason,
            code = reason.as_wts(),
            "session notification"
        );
    }
}

/// Notifier that forwards events into an unbounded channel; used by
/// tests to assert on emitted transitions.
pub struct ChannelNotifier {
    tx: tokio::sync::mpsc::UnboundedSender<(NotificationReason, u32)>,
}

impl ChannelNotifier {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<(NotificationReason, u32)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionNotifier for ChannelNotifier {
    fn notify(&self, reason: NotificationReason, session_id: u32) {
        let _ = self.tx.send((reason, session_id));
    }
}
