//! Session connect states and notification reasons

use std::fmt;

/// WTS-compatible connect state of a session.
///
/// `Idle`, `Listen` and `Reset` are reserved for reporting
/// compatibility and are never entered by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Active,
    Connected,
    ConnectQuery,
    Shadow,
    Disconnected,
    Idle,
    Listen,
    Reset,
    Down,
    Init,
}

impl ConnectState {
    /// Numeric WTS_CONNECTSTATE_CLASS value used in API reporting.
    pub fn as_wts(self) -> u32 {
        match self {
            ConnectState::Active => 0,
            ConnectState::Connected => 1,
            ConnectState::ConnectQuery => 2,
            ConnectState::Shadow => 3,
            ConnectState::Disconnected => 4,
            ConnectState::Idle => 5,
            ConnectState::Listen => 6,
            ConnectState::Reset => 7,
            ConnectState::Down => 8,
            ConnectState::Init => 9,
        }
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::Active => "Active",
            ConnectState::Connected => "Connected",
            ConnectState::ConnectQuery => "ConnectQuery",
            ConnectState::Shadow => "Shadow",
            ConnectState::Disconnected => "Disconnected",
            ConnectState::Idle => "Idle",
            ConnectState::Listen => "Listen",
            ConnectState::Reset => "Reset",
            ConnectState::Down => "Down",
            ConnectState::Init => "Init",
        };
        f.write_str(name)
    }
}

/// Reason codes delivered to the session notifier (WTS notification
/// values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    RemoteConnect,
    RemoteDisconnect,
    SessionLogon,
    SessionLogoff,
    SessionRemoteControl,
}

impl NotificationReason {
    pub fn as_wts(self) -> u32 {
        match self {
            NotificationReason::RemoteConnect => 0x3,
            NotificationReason::RemoteDisconnect => 0x4,
            NotificationReason::SessionLogon => 0x5,
            NotificationReason::SessionLogoff => 0x6,
            NotificationReason::SessionRemoteControl => 0x9,
        }
    }
}
