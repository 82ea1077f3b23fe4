//! Permission and token store
//!
//! Issues the opaque tokens that authenticate administrative (OTSAPI)
//! callers and binds them to either a live session or a logon record
//! carrying a permission mask. Also evaluates the group allow/deny
//! policy consulted before any logon attempt.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, warn};

use crate::properties::PropertyStore;
use crate::protocol::TOKEN_FILE_PREFIX;

/// Permission bits (wire-stable WTS values).
pub const PERM_QUERY_INFORMATION: u32 = 0x0000_0001;
pub const PERM_SET_INFORMATION: u32 = 0x0000_0002;
pub const PERM_RESET: u32 = 0x0000_0004;
pub const PERM_VIRTUAL_CHANNEL: u32 = 0x0000_0008;
pub const PERM_REMOTE_CONTROL: u32 = 0x0000_0010;
pub const PERM_LOGON: u32 = 0x0000_0020;
pub const PERM_LOGOFF: u32 = 0x0000_0040;
pub const PERM_MESSAGE: u32 = 0x0000_0080;
pub const PERM_CONNECT: u32 = 0x0000_0100;
pub const PERM_DISCONNECT: u32 = 0x0000_0200;

/// Everything.
pub const PERM_FLAGS_FULL: u32 = 0x0000_03ff;
/// Regular interactive user.
pub const PERM_FLAGS_USER: u32 = PERM_LOGON
    | PERM_QUERY_INFORMATION
    | PERM_MESSAGE
    | PERM_CONNECT
    | PERM_DISCONNECT
    | PERM_LOGOFF;
/// Default level: may log on, nothing else.
pub const PERM_FLAGS_GUEST: u32 = PERM_LOGON;

const TOKEN_LENGTH: usize = 10;
const TOKEN_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// `true` iff every bit of `requested` is present in `granted`.
pub fn check_permission(granted: u32, requested: u32) -> bool {
    (granted & requested) == requested
}

/// Permission record backing a logon token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonPermission {
    pub user: String,
    pub domain: String,
    pub mask: u32,
}

/// What a token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenBinding {
    /// The token belongs to a live session (held by id, resolved
    /// through the session store on use).
    Session(u32),
    /// The token was issued to an API client for a user logon.
    Logon(LogonPermission),
}

#[derive(Default)]
struct GroupPolicy {
    /// group name -> allowed (true) / denied (false)
    groups: HashMap<String, bool>,
    unknown_groups_allowed: bool,
}

/// Token issuance and group policy evaluation.
pub struct PermissionStore {
    scratch_dir: PathBuf,
    tokens: Mutex<HashMap<String, TokenBinding>>,
    policy: RwLock<GroupPolicy>,
}

impl PermissionStore {
    /// Create the store and purge stale token files left in the
    /// scratch directory by a previous run.
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        let store = Self {
            scratch_dir: scratch_dir.into(),
            tokens: Mutex::new(HashMap::new()),
            policy: RwLock::new(GroupPolicy::default()),
        };
        store.purge_token_files();
        store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Random alphanumeric string from the system CSPRNG. Tokens
    /// authenticate administrative access, so `OsRng` is mandatory
    /// here.
    pub fn generate_random(&self, length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| {
                let idx = rng.gen_range(0..TOKEN_ALPHABET.len());
                TOKEN_ALPHABET[idx] as char
            })
            .collect()
    }

    /// Issue a fresh token bound to `session_id`. Collisions are
    /// re-rolled.
    pub fn register_session(&self, session_id: u32) -> String {
        let mut tokens = self.tokens.lock();
        loop {
            let token = self.generate_random(TOKEN_LENGTH);
            if !tokens.contains_key(&token) {
                tokens.insert(token.clone(), TokenBinding::Session(session_id));
                return token;
            }
        }
    }

    /// Issue a fresh token backed by a logon record.
    pub fn register_logon(&self, user: &str, domain: &str, mask: u32) -> String {
        let mut tokens = self.tokens.lock();
        loop {
            let token = self.generate_random(TOKEN_LENGTH);
            if !tokens.contains_key(&token) {
                tokens.insert(
                    token.clone(),
                    TokenBinding::Logon(LogonPermission {
                        user: user.to_string(),
                        domain: domain.to_string(),
                        mask,
                    }),
                );
                return token;
            }
        }
    }

    /// Drop a token. Used at session teardown and at API logoff.
    pub fn unregister(&self, token: &str) {
        self.tokens.lock().remove(token);
    }

    pub fn binding(&self, token: &str) -> Option<TokenBinding> {
        self.tokens.lock().get(token).cloned()
    }

    /// Remove every `ogon.session.*` file under the scratch dir.
    pub fn purge_token_files(&self) {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %self.scratch_dir.display(), %err, "cannot scan scratch dir");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TOKEN_FILE_PREFIX) {
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(file = %entry.path().display(), %err, "failed to remove stale token file");
                }
            }
        }
    }

    /// Rebuild the group allow/deny policy from
    /// `permission.groups.whiteList` / `permission.groups.blackList`.
    /// A `*` in the white list allows users whose groups are all
    /// unknown; a `*` in the black list revokes that.
    pub fn reload_group_policy(&self, properties: &PropertyStore) {
        let mut policy = GroupPolicy::default();

        if let Some(value) = properties.get_string(None, "permission.groups.whiteList") {
            for name in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                if name == "*" {
                    policy.unknown_groups_allowed = true;
                } else {
                    policy.groups.insert(name.to_string(), true);
                }
            }
        }

        if let Some(value) = properties.get_string(None, "permission.groups.blackList") {
            for name in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                if name == "*" {
                    policy.unknown_groups_allowed = false;
                } else {
                    policy.groups.insert(name.to_string(), false);
                }
            }
        }

        *self.policy.write() = policy;
    }

    /// Evaluate the group policy over a user's group list. Any denied
    /// group rejects; otherwise any allowed group accepts; otherwise
    /// the unknown-groups default applies.
    pub fn is_logon_allowed(&self, groups: &[String]) -> bool {
        let policy = self.policy.read();
        let mut allowed = false;
        for group in groups {
            match policy.groups.get(group) {
                Some(false) => return false,
                Some(true) => allowed = true,
                None => {}
            }
        }
        if !allowed {
            return policy.unknown_groups_allowed;
        }
        true
    }
}

/// Enumerate the local group names of a user. Blocking; call from a
/// blocking-capable context.
pub fn local_groups(username: &str) -> Vec<String> {
    let Some(user) = uzers::get_user_by_name(username) else {
        return Vec::new();
    };
    uzers::get_user_groups(username, user.primary_group_id())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|g| g.name().to_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{PropertyLevel, PropertyValue};

    fn store() -> PermissionStore {
        PermissionStore::new(std::env::temp_dir())
    }

    #[test]
    fn tokens_are_unique_and_resolvable() {
        let store = store();
        let t1 = store.register_session(2);
        let t2 = store.register_session(3);
        assert_ne!(t1, t2);
        assert_eq!(t1.len(), 10);
        assert_eq!(store.binding(&t1), Some(TokenBinding::Session(2)));

        store.unregister(&t1);
        assert_eq!(store.binding(&t1), None);
        assert_eq!(store.binding(&t2), Some(TokenBinding::Session(3)));
    }

    #[test]
    fn logon_tokens_carry_mask() {
        let store = store();
        let token = store.register_logon("alice", "DOM", PERM_FLAGS_USER);
        match store.binding(&token) {
            Some(TokenBinding::Logon(perm)) => {
                assert_eq!(perm.user, "alice");
                assert!(check_permission(perm.mask, PERM_DISCONNECT));
                assert!(!check_permission(perm.mask, PERM_REMOTE_CONTROL));
            }
            other => panic!("unexpected binding: {:?}", other),
        }
    }

    #[test]
    fn group_policy_deny_wins() {
        let store = store();
        let props = PropertyStore::new();
        props.set(
            PropertyLevel::Global,
            "permission.groups.whiteList",
            PropertyValue::Text("staff; rdp-users".into()),
        );
        props.set(
            PropertyLevel::Global,
            "permission.groups.blackList",
            PropertyValue::Text("blocked".into()),
        );
        store.reload_group_policy(&props);

        assert!(store.is_logon_allowed(&["staff".into()]));
        assert!(!store.is_logon_allowed(&["staff".into(), "blocked".into()]));
        // unknown groups only, no wildcard
        assert!(!store.is_logon_allowed(&["other".into()]));
    }

    #[test]
    fn wildcard_allows_unknown_groups() {
        let store = store();
        let props = PropertyStore::new();
        props.set(
            PropertyLevel::Global,
            "permission.groups.whiteList",
            PropertyValue::Text("*".into()),
        );
        store.reload_group_policy(&props);
        assert!(store.is_logon_allowed(&["anything".into()]));
        assert!(store.is_logon_allowed(&[]));
    }

    #[test]
    fn permission_check_is_monotone() {
        let mask = PERM_FLAGS_USER;
        let requested = PERM_DISCONNECT | PERM_LOGOFF;
        assert!(check_permission(mask, requested));
        // every subset of a granted mask is granted
        assert!(check_permission(mask, PERM_DISCONNECT));
        assert!(check_permission(mask, 0));
        assert!(!check_permission(PERM_FLAGS_GUEST, requested));
    }
}
