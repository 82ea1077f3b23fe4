//! Connection store
//!
//! Process-wide index of connections keyed by the front end's
//! connection id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::connection::Connection;

pub struct ConnectionStore {
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, connection_id: u32) -> Arc<Connection> {
        self.connections
            .lock()
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Connection::new(connection_id)))
            .clone()
    }

    pub fn get(&self, connection_id: u32) -> Option<Arc<Connection>> {
        self.connections.lock().get(&connection_id).cloned()
    }

    pub fn connection_for_session(&self, session_id: u32) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .find(|c| c.session_id() == session_id)
            .cloned()
    }

    /// Connection id bound to a session, 0 if none.
    pub fn connection_id_for_session(&self, session_id: u32) -> u32 {
        self.connection_for_session(session_id)
            .map(|c| c.connection_id())
            .unwrap_or(0)
    }

    pub fn remove(&self, connection_id: u32) {
        self.connections.lock().remove(&connection_id);
    }

    /// Wipe all connections (transport reset).
    pub fn reset(&self) {
        self.connections.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}
