//! Session store
//!
//! Process-wide session index. Ids are allocated monotonically,
//! skipping 0 and everything still live. Lookups iterate in id order so
//! the reconnect policy picks deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::context::AppContext;
use crate::session::session::Session;
use crate::session::state::ConnectState;

const COOKIE_LENGTH: usize = 50;

pub struct SessionStore {
    sessions: Mutex<BTreeMap<u32, Arc<Session>>>,
    next_id: Mutex<u32>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Create a session in state Init: fresh id, fresh cookies,
    /// registered token, running executor.
    pub fn create(&self, ctx: &Arc<AppContext>) -> Arc<Session> {
        let id = {
            let mut next = self.next_id.lock();
            let sessions = self.sessions.lock();
            loop {
                *next = next.wrapping_add(1);
                if *next == 0 {
                    *next = 1;
                }
                if !sessions.contains_key(&*next) {
                    break *next;
                }
            }
        };

        let ogon_cookie = ctx.permissions.generate_random(COOKIE_LENGTH);
        let backend_cookie = ctx.permissions.generate_random(COOKIE_LENGTH);
        let session = Arc::new(Session::new(id, ogon_cookie, backend_cookie));
        session.init(ctx);
        self.sessions.lock().insert(id, session.clone());
        info!(session = id, "session created");
        session
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Remove a session from the index and queue its shutdown.
    pub fn remove(&self, session_id: u32) {
        let session = self.sessions.lock().remove(&session_id);
        if let Some(session) = session {
            info!(session = session_id, "session removed");
            session.shutdown();
        }
    }

    fn find(
        &self,
        user_name: &str,
        domain: &str,
        client_host: Option<&str>,
        accept: impl Fn(&Session) -> bool,
    ) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .find(|s| {
                s.user_name() == user_name
                    && s.domain() == domain
                    && client_host.map_or(true, |host| s.client_host_name() == host)
                    && accept(s)
            })
            .cloned()
    }

    /// First session of the user regardless of state.
    pub fn first_session(
        &self,
        user_name: &str,
        domain: &str,
        client_host: Option<&str>,
    ) -> Option<Arc<Session>> {
        self.find(user_name, domain, client_host, |_| true)
    }

    /// First disconnected session of the user; the match is moved to
    /// ConnectQuery so no second logon can grab it.
    pub fn first_disconnected_session(
        &self,
        user_name: &str,
        domain: &str,
        client_host: Option<&str>,
    ) -> Option<Arc<Session>> {
        let session = self.find(user_name, domain, client_host, |s| {
            s.connect_state() == ConnectState::Disconnected
        })?;
        session.try_mark_connect_query().then_some(session)
    }

    /// First live (logged-in) session of the user.
    pub fn first_logged_in_session(
        &self,
        user_name: &str,
        domain: &str,
        client_host: Option<&str>,
    ) -> Option<Arc<Session>> {
        self.find(user_name, domain, client_host, |s| {
            matches!(
                s.connect_state(),
                ConnectState::Disconnected
                    | ConnectState::Active
                    | ConnectState::Init
                    | ConnectState::Shadow
            )
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
