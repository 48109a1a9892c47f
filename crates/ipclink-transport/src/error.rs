/// Errors that can occur in IPC transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create the connected socket pair.
    #[error("failed to create socket pair: {0}")]
    Pair(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An attachment was handed over with the wrong kind.
    #[error("attachment kind mismatch (expected {expected:?}, got {actual:?})")]
    AttachmentKindMismatch {
        expected: crate::AttachmentKind,
        actual: crate::AttachmentKind,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
