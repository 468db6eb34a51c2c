//! TCP transport between nodes.

pub mod connection;

pub use connection::{Connection, ConnectionInfo, ConnectionSender, HEARTBEAT_INTERVAL};
