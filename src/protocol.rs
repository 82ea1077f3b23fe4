//! Wire-level protocol constants
//!
//! Call-type ids, protocol version, pipe naming and the numeric error
//! codes shared with the RDP front end. The string and numeric values in
//! this module are part of the platform ABI and must not change between
//! releases.

use std::path::{Path, PathBuf};

/// Protocol version sent in the first-frame handshake.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
/// Minor protocol version, informational only.
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

/// Version of the subprocess backend protocol (SBP) spoken with
/// launched backend modules.
pub const SBP_VERSION_MAJOR: u32 = 1;

/// Call types at or above this value belong to the SBP family and are
/// only accepted from version-compatible backends.
pub const SBP_CALL_TYPE_BASE: u16 = 200;

/// Call-type registry for the internal communication protocol (ICP).
///
/// The ids are stable 16-bit tags; both peers index their dispatch
/// tables with them.
pub mod icp {
    pub const PING: u16 = 100;
    pub const SWITCH_TO: u16 = 101;
    pub const LOGOFF_USER_SESSION: u16 = 102;
    pub const DISCONNECT_USER_SESSION: u16 = 103;
    pub const LOGON_USER: u16 = 104;
    pub const OTSAPI_VIRTUAL_CHANNEL_OPEN: u16 = 105;
    pub const OTSAPI_VIRTUAL_CHANNEL_CLOSE: u16 = 106;
    pub const OTSAPI_START_REMOTE_CONTROL: u16 = 107;
    pub const OTSAPI_STOP_REMOTE_CONTROL: u16 = 108;
    pub const MESSAGE: u16 = 109;
    pub const LOGON_INFO: u16 = 110;
    pub const CONNECTION_STATS: u16 = 111;
    pub const PROPERTY_BOOL: u16 = 112;
    pub const PROPERTY_NUMBER: u16 = 113;
    pub const PROPERTY_STRING: u16 = 114;
    pub const PROPERTY_BULK: u16 = 115;
    pub const REMOTE_CONTROL_ENDED: u16 = 116;
}

/// Call-type registry for the subprocess backend protocol (SBP).
pub mod sbp {
    pub const VERSION: u16 = 200;
    pub const AUTHENTICATE_USER: u16 = 201;
    pub const END_SESSION: u16 = 202;
}

/// Numeric call result codes, preserved for wire compatibility.
pub mod status {
    pub const SUCCESS: u32 = 0;
    pub const FAILED: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
    pub const BAD_REQUEST_DATA: u32 = 100;
    pub const BAD_RESPONSE: u32 = 101;
    pub const TRANSPORT_ERROR: u32 = 102;
    pub const CALL_TIMEOUT: u32 = 103;
    pub const OUT_OF_MEMORY: u32 = 104;
}

/// Message-box style and result codes used by the `Message` call
/// (values match the Windows constants the front end expects).
pub mod message {
    pub const MB_OK: u32 = 0x0000_0000;
    pub const MB_YESNO: u32 = 0x0000_0004;

    pub const IDYES: u32 = 6;
    pub const IDTIMEOUT: u32 = 32000;

    /// Message type asking the target user to allow remote control.
    pub const REQUEST_REMOTE_CONTROL: u32 = 2;
}

/// Default timeout for a synchronous out-call to the front end.
pub const CALL_TIMEOUT_DEFAULT_MS: u64 = 10_000;
/// Timeout applied to OTSAPI-initiated out-calls.
pub const OTSAPI_TIMEOUT_MS: u64 = 10_000;
/// Bound on logoff/shutdown waits.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 20_000;
/// Poll interval of the process monitor.
pub const PROCESS_MONITOR_INTERVAL_MS: u64 = 200;

/// Windows-style name of the session manager RPC endpoint.
pub const SESSION_MANAGER_PIPE: &str = "\\\\.\\pipe\\ogon_SessionManager";

/// Prefix of per-session auth token files in the scratch directory.
pub const TOKEN_FILE_PREFIX: &str = "ogon.session.";

/// Default scratch directory for token files.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";

/// Default directory the Windows-style pipe namespace is mapped onto.
pub const DEFAULT_PIPE_DIR: &str = "/tmp/.pipe";

/// Default PATH injected into backend environments when none is present.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Windows-style pipe name for a per-session backend endpoint.
pub fn backend_pipe_name(session_id: u32, endpoint: &str) -> String {
    format!("\\\\.\\pipe\\ogon_{}_{}", session_id, endpoint)
}

/// Map a Windows-style pipe name onto its unix socket path below
/// `pipe_dir`. Only the last path component of the pipe name is used.
pub fn pipe_path(pipe_dir: &Path, pipe_name: &str) -> PathBuf {
    let leaf = pipe_name.rsplit('\\').next().unwrap_or(pipe_name);
    pipe_dir.join(leaf)
}

/// Path of the auth token file for a session.
pub fn token_file_path(scratch_dir: &Path, session_id: u32) -> PathBuf {
    scratch_dir.join(format!("{}{}", TOKEN_FILE_PREFIX, session_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_map_to_pipe_dir() {
        let dir = Path::new("/run/wrd/.pipe");
        assert_eq!(
            pipe_path(dir, SESSION_MANAGER_PIPE),
            PathBuf::from("/run/wrd/.pipe/ogon_SessionManager")
        );
        assert_eq!(
            pipe_path(dir, &backend_pipe_name(7, "X11")),
            PathBuf::from("/run/wrd/.pipe/ogon_7_X11")
        );
    }

    #[test]
    fn sbp_family_is_disjoint_from_icp() {
        assert!(icp::REMOTE_CONTROL_ENDED < SBP_CALL_TYPE_BASE);
        assert!(sbp::VERSION >= SBP_CALL_TYPE_BASE);
    }
}
