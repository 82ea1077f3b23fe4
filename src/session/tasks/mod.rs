//! Session tasks
//!
//! The units of work queued on session executors: logon, re-auth,
//! disconnect, end, switch-to, shutdown and the disconnect-timeout
//! reaper.

pub mod authenticate;
pub mod disconnect;
pub mod end;
pub mod logon;
pub mod shutdown;
pub mod switch_to;
pub mod timeout;

pub use authenticate::TaskAuthenticateUser;
pub use disconnect::{disconnect_connection, disconnect_session, TaskDisconnect};
pub use end::{end_session, TaskEnd};
pub use logon::{LogonParams, TaskLogonUser};
pub use shutdown::TaskShutdown;
pub use switch_to::TaskSwitchTo;
pub use timeout::TaskSessionTimeout;
