//! Connection objects
//!
//! A connection is the pre-session representation of an RDP client: it
//! carries the client information reported by the front end, the
//! authentication outcome, and a parking lot for calls that arrive
//! before a session is bound to the connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::context::AppContext;
use crate::module::auth::AuthStatus;
use crate::permission::local_groups;
use crate::properties::PropertyValue;
use crate::rpc::calls::IncomingCall;

/// Client parameters delivered with the logon request.
#[derive(Debug, Clone, Default)]
pub struct ClientInformation {
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
    pub initial_width: u32,
    pub initial_height: u32,
    pub client_host_name: String,
    pub client_address: String,
    pub client_build_number: u32,
    pub client_product_id: u16,
    pub client_hardware_id: u32,
    pub client_protocol_type: u16,
}

/// Authentication state of a connection. A connection is authenticated
/// at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Failed,
}

/// Parking state for early calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    HasSession,
    SessionFailed,
}

struct Identity {
    auth_state: AuthState,
    user_name: String,
    domain: String,
    client: ClientInformation,
}

struct ParkingLot {
    state: ConnectionState,
    parked: Vec<IncomingCall>,
}

pub struct Connection {
    id: u32,
    session_id: AtomicU32,
    identity: Mutex<Identity>,
    lot: Mutex<ParkingLot>,
}

impl Connection {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            session_id: AtomicU32::new(0),
            identity: Mutex::new(Identity {
                auth_state: AuthState::Unauthenticated,
                user_name: String::new(),
                domain: String::new(),
                client: ClientInformation::default(),
            }),
            lot: Mutex::new(ParkingLot {
                state: ConnectionState::Init,
                parked: Vec::new(),
            }),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn bind_session(&self, session_id: u32) {
        self.session_id.store(session_id, Ordering::SeqCst);
        debug!(
            session = session_id,
            connection = self.id,
            "session bound to connection"
        );
    }

    pub fn user_name(&self) -> String {
        self.identity.lock().user_name.clone()
    }

    pub fn domain(&self) -> String {
        self.identity.lock().domain.clone()
    }

    pub fn auth_state(&self) -> AuthState {
        self.identity.lock().auth_state
    }

    pub fn client_information(&self) -> ClientInformation {
        self.identity.lock().client.clone()
    }

    pub fn update_client_information(&self, update: impl FnOnce(&mut ClientInformation)) {
        update(&mut self.identity.lock().client);
    }

    /// Authenticate the connection's user against the configured auth
    /// module, after the group allow/deny policy. At most one
    /// successful authentication per connection; repeated attempts
    /// fail with `AlreadyAuthenticated`.
    ///
    /// On success the (possibly rewritten) identity is recorded on the
    /// connection.
    pub async fn authenticate_user(
        &self,
        ctx: &Arc<AppContext>,
        user_name: &str,
        domain: &str,
        password: &str,
        session_id: u32,
    ) -> AuthStatus {
        if self.auth_state() == AuthState::Authenticated {
            return AuthStatus::AlreadyAuthenticated;
        }

        let user_for_groups = user_name.to_string();
        let groups = tokio::task::spawn_blocking(move || local_groups(&user_for_groups))
            .await
            .unwrap_or_default();
        if !ctx.permissions.is_logon_allowed(&groups) {
            debug!(
                session = session_id,
                user = user_name,
                "logon rejected by group policy"
            );
            self.identity.lock().auth_state = AuthState::Failed;
            return AuthStatus::NotAllowed;
        }

        let module_name = ctx
            .properties
            .get_string(Some(user_name), "auth.module")
            .unwrap_or_else(|| {
                debug!(
                    session = session_id,
                    "property auth.module not set, using PAM"
                );
                "PAM".to_string()
            });

        let Some(auth) = ctx.modules.auth_module(&module_name) else {
            warn!(
                session = session_id,
                module = %module_name,
                "auth module not registered"
            );
            self.identity.lock().auth_state = AuthState::Failed;
            return AuthStatus::InternalError;
        };

        let password = Zeroizing::new(password.to_string());
        let outcome = auth.logon_user(user_name, domain, &password).await;

        let mut identity = self.identity.lock();
        match outcome.status {
            AuthStatus::Success => {
                identity.auth_state = AuthState::Authenticated;
                identity.user_name = user_name.to_string();
                identity.domain = outcome
                    .rewritten_domain
                    .unwrap_or_else(|| domain.to_string());
                debug!(
                    session = session_id,
                    user = user_name,
                    "user authenticated"
                );
                AuthStatus::Success
            }
            status => {
                identity.auth_state = AuthState::Failed;
                status
            }
        }
    }

    /// Forget the authenticated identity (re-auth after a failed module
    /// start).
    pub fn reset_authenticated_user(&self) {
        let mut identity = self.identity.lock();
        identity.auth_state = AuthState::Unauthenticated;
        identity.user_name.clear();
        identity.domain.clear();
    }

    /// Synthetic property scope resolved against the client
    /// information.
    pub fn connection_property(&self, path: &str) -> Option<PropertyValue> {
        let client = &self.identity.lock().client;
        let value = match path {
            "XRES" => client.width as i64,
            "YRES" => client.height as i64,
            "COLORDEPTH" => client.color_depth as i64,
            "INITIALXRES" => client.initial_width as i64,
            "INITIALYRES" => client.initial_height as i64,
            _ => return None,
        };
        Some(PropertyValue::Number(value))
    }

    /// Park a call that arrived before the connection has a session.
    /// Returns the call unchanged when a session is already bound (the
    /// caller routes it to the session executor). Calls arriving after
    /// a failed session bind are answered with an error immediately.
    pub fn park_or_route(&self, call: IncomingCall) -> Option<IncomingCall> {
        let mut lot = self.lot.lock();
        match lot.state {
            ConnectionState::Init => {
                lot.parked.push(call);
                None
            }
            ConnectionState::SessionFailed => {
                drop(lot);
                call.respond_failed("no session available for connection");
                None
            }
            ConnectionState::HasSession => Some(call),
        }
    }

    /// Move the parking lot to `state` and return the calls to drain.
    /// On `SessionFailed` every parked call is answered with an error
    /// and the returned list is empty.
    pub fn set_state_take_parked(&self, state: ConnectionState) -> Vec<IncomingCall> {
        let mut lot = self.lot.lock();
        lot.state = state;
        match state {
            ConnectionState::Init => Vec::new(),
            ConnectionState::HasSession => std::mem::take(&mut lot.parked),
            ConnectionState::SessionFailed => {
                let failed = std::mem::take(&mut lot.parked);
                drop(lot);
                for call in failed {
                    call.respond_failed("session binding failed");
                }
                Vec::new()
            }
        }
    }
}
