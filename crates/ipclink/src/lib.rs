//! Typed message passing between cooperating processes.
//!
//! ipclink carries named, typed messages over a local socket pair with
//! synchronous, asynchronous and promise-based request/reply, plus OS
//! handle passing.
//!
//! # Crate Structure
//!
//! - [`transport`]: identifier pairs, streams and attachments
//! - [`message`]: message names, the registry and the typed encoder/decoder
//! - [`connection`]: connections, run loops and reply correlation (behind `connection` feature)

/// Re-export transport types.
pub mod transport {
    pub use ipclink_transport::*;
}

/// Re-export message types.
pub mod message {
    pub use ipclink_message::*;
}

/// Re-export connection types (requires `connection` feature).
#[cfg(feature = "connection")]
pub mod connection {
    pub use ipclink_connection::*;
}
