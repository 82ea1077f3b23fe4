//! Sessions, connections and their stores

pub mod connection;
pub mod connection_store;
pub mod executor;
pub mod notifier;
pub mod session;
pub mod state;
pub mod store;
pub mod tasks;

pub use connection::{ClientInformation, Connection, ConnectionState};
pub use connection_store::ConnectionStore;
pub use notifier::{ChannelNotifier, LogNotifier, SessionNotifier};
pub use session::{Session, SessionError};
pub use state::{ConnectState, NotificationReason};
pub use store::SessionStore;
