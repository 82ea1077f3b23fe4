//! Administrative API (OTSAPI)
//!
//! Token-authenticated operations on sessions, served out-of-process
//! over a local socket. The heavyweight RPC transport of the full
//! platform is external; this module carries the operation set over a
//! length-prefixed JSON protocol and enforces the per-operation
//! permission bits.

use serde::{Deserialize, Serialize};

pub mod handler;
pub mod remote_control;
pub mod server;

pub use handler::OtsApiHandler;
pub use server::OtsApiServer;

/// Wire value for "the message box timed out".
pub use crate::protocol::message::IDTIMEOUT;

/// Summary entry of `enumerateSessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: u32,
    pub win_station_name: String,
    pub connect_state: u32,
}

/// Full record of `querySessionInformation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session_id: u32,
    pub user_name: String,
    pub domain: String,
    pub client_host_name: String,
    pub win_station_name: String,
    pub connect_state: u32,
    pub connect_time: Option<u64>,
    pub disconnect_time: Option<u64>,
    pub logon_time: Option<u64>,
    pub max_width: u32,
    pub max_height: u32,
    pub shadowed_by: Vec<u32>,
    /// Transport counters reported by the front end; absent while the
    /// session has no connection (or the front end does not answer).
    pub stats: Option<ConnectionStats>,
}

/// Transport counters of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub incoming_frames: u64,
    pub outgoing_frames: u64,
}

/// Requests accepted by the OTSAPI endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OtsRequest {
    Ping {
        value: u32,
    },
    GetVersionInfo,
    LogonConnection {
        user_name: String,
        domain: String,
        password: String,
    },
    LogoffConnection {
        token: String,
    },
    EnumerateSessions {
        token: String,
    },
    QuerySessionInformation {
        token: String,
        session_id: u32,
    },
    DisconnectSession {
        token: String,
        session_id: u32,
        wait: bool,
    },
    LogoffSession {
        token: String,
        session_id: u32,
        wait: bool,
    },
    StartRemoteControlSession {
        token: String,
        session_id: u32,
        target_session_id: u32,
        hotkey_vk: u8,
        hotkey_modifiers: u16,
        flags: u32,
    },
    StopRemoteControlSession {
        token: String,
        session_id: u32,
    },
    VirtualChannelOpen {
        token: String,
        session_id: u32,
        virtual_name: String,
        dynamic: bool,
        flags: u32,
    },
    VirtualChannelClose {
        token: String,
        session_id: u32,
        virtual_name: String,
        instance: u32,
    },
    SendMessage {
        token: String,
        session_id: u32,
        title: String,
        message: String,
        style: u32,
        timeout: u32,
        wait: bool,
    },
}

/// Responses of the OTSAPI endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum OtsResponse {
    Pong { value: u32 },
    Version { major: u32, minor: u32 },
    Token { token: Option<String> },
    Done { success: bool },
    Sessions { sessions: Vec<SessionInfo> },
    SessionInformation { info: Option<SessionDetails> },
    Channel { pipe_name: String, instance: u32 },
    MessageResult { response: u32 },
    Error { message: String },
}
