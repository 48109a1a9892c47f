//! Local IPC transport for ipclink.
//!
//! Connections are built from a pair of [`Identifier`]s backed by a Unix
//! socket pair. Bytes travel over the stream; OS handles travel out of band
//! as [`Attachment`]s using `SCM_RIGHTS`.
//!
//! This is the lowest layer of ipclink. Everything else builds on top of
//! the [`IpcStream`] type provided here.

pub mod attachment;
pub mod error;
pub mod identifier;
pub mod traits;

pub use attachment::{Attachment, AttachmentKind};
pub use error::{Result, TransportError};
pub use identifier::{create_identifier_pair, Identifier, IdentifierPair};
pub use traits::{AttachmentRead, AttachmentWrite, IpcStream, MAX_ATTACHMENTS_PER_MESSAGE};
