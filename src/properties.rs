//! Property store
//!
//! Layered typed key/value configuration: a global scope and per-user
//! overrides. Paths are dotted, case-insensitive (stored upper-cased).
//! A lookup returns the first hit whose type matches the request; a
//! value of the wrong type is treated as a miss.
//!
//! The synthetic `CURRENT.CONNECTION.` scope needs the session and
//! connection stores and is resolved in [`crate::context::AppContext`].

use std::collections::HashMap;

use parking_lot::RwLock;

/// Prefix of the synthetic per-connection scope.
pub const CONNECTION_PREFIX: &str = "CURRENT.CONNECTION.";

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Number(i64),
    Text(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Scope a property is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLevel<'a> {
    Global,
    User(&'a str),
}

/// Global + per-user property maps.
pub struct PropertyStore {
    global: RwLock<HashMap<String, PropertyValue>>,
    users: RwLock<HashMap<String, HashMap<String, PropertyValue>>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self {
            global: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Store a value at the given level, replacing any previous entry.
    pub fn set(&self, level: PropertyLevel<'_>, path: &str, value: PropertyValue) {
        let key = path.to_uppercase();
        match level {
            PropertyLevel::Global => {
                self.global.write().insert(key, value);
            }
            PropertyLevel::User(user) => {
                self.users
                    .write()
                    .entry(user.to_string())
                    .or_default()
                    .insert(key, value);
            }
        }
    }

    /// Raw layered lookup: user override first, then global.
    pub fn lookup(&self, user: Option<&str>, path: &str) -> Option<PropertyValue> {
        let key = path.to_uppercase();
        if let Some(user) = user {
            if let Some(map) = self.users.read().get(user) {
                if let Some(value) = map.get(&key) {
                    return Some(value.clone());
                }
            }
        }
        self.global.read().get(&key).cloned()
    }

    pub fn get_bool(&self, user: Option<&str>, path: &str) -> Option<bool> {
        self.lookup(user, path).and_then(|v| v.as_bool())
    }

    pub fn get_number(&self, user: Option<&str>, path: &str) -> Option<i64> {
        self.lookup(user, path).and_then(|v| v.as_number())
    }

    pub fn get_string(&self, user: Option<&str>, path: &str) -> Option<String> {
        self.lookup(user, path)
            .and_then(|v| v.as_text().map(str::to_string))
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_scope_shadows_global() {
        let store = PropertyStore::new();
        store.set(
            PropertyLevel::Global,
            "session.reconnect",
            PropertyValue::Bool(true),
        );
        store.set(
            PropertyLevel::User("alice"),
            "session.reconnect",
            PropertyValue::Bool(false),
        );

        assert_eq!(store.get_bool(None, "session.reconnect"), Some(true));
        assert_eq!(
            store.get_bool(Some("alice"), "session.reconnect"),
            Some(false)
        );
        assert_eq!(store.get_bool(Some("bob"), "session.reconnect"), Some(true));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let store = PropertyStore::new();
        store.set(
            PropertyLevel::Global,
            "Module.X11.ModuleName",
            PropertyValue::Text("x11".into()),
        );
        assert_eq!(
            store.get_string(None, "module.x11.modulename").as_deref(),
            Some("x11")
        );
    }

    #[test]
    fn type_mismatch_is_a_miss() {
        let store = PropertyStore::new();
        store.set(
            PropertyLevel::Global,
            "session.maxXRes",
            PropertyValue::Number(1920),
        );
        assert_eq!(store.get_bool(None, "session.maxXRes"), None);
        assert_eq!(store.get_string(None, "session.maxXRes"), None);
        assert_eq!(store.get_number(None, "session.maxXRes"), Some(1920));
    }

    #[test]
    fn user_value_of_wrong_type_does_not_fall_through() {
        // a shadowing entry with the wrong type hides nothing: the
        // typed getters report a miss for the whole lookup
        let store = PropertyStore::new();
        store.set(
            PropertyLevel::Global,
            "session.timeout",
            PropertyValue::Number(60),
        );
        store.set(
            PropertyLevel::User("carol"),
            "session.timeout",
            PropertyValue::Text("never".into()),
        );
        assert_eq!(store.get_number(Some("carol"), "session.timeout"), None);
    }
}
