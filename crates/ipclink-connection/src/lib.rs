//! Peer connections for ipclink.
//!
//! A [`Connection`] carries typed messages between two processes over one
//! end of an identifier pair. Incoming traffic is handed to a [`Client`] on
//! the [`RunLoop`] the connection was opened on. Requests can be answered
//! three ways:
//!
//! - synchronously, with [`Connection::send_sync`] blocking for the reply
//! - through a completion handler, with [`Connection::send_with_async_reply`]
//! - through a [`ReplyPromise`], with [`Connection::send_with_promised_reply`]
//!
//! Every pending reply resolves exactly once, with
//! [`Error::InvalidConnection`] if the connection goes away first.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod options;
pub mod reply;
pub mod run_loop;
mod throttler;
pub mod work_queue;

pub use client::Client;
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionId, Role};
pub use dispatcher::{run_or_dispatch, Dispatcher, Task};
pub use error::{Error, Result};
pub use options::{SendOptions, SendSyncOptions};
pub use reply::ReplyPromise;
pub use run_loop::RunLoop;
pub use work_queue::WorkQueue;
