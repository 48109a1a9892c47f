use crate::name::MessageName;

/// Errors that can occur while framing messages or building registries.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x494C \"IL\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame announced more attachments than a single send may carry.
    #[error("too many attachments ({count}, max {max})")]
    TooManyAttachments { count: usize, max: usize },

    /// A frame announced an attachment kind this build does not know.
    #[error("unknown attachment kind {0}")]
    UnknownAttachmentKind(u8),

    /// A frame announced more attachments than arrived with it.
    #[error("frame announced {expected} attachments but {received} arrived")]
    MissingAttachments { expected: usize, received: usize },

    /// A message is shorter than its fixed header.
    #[error("message truncated ({size} bytes, header needs {needed})")]
    TruncatedMessage { size: usize, needed: usize },

    /// A name in the built-in range was registered by the application.
    #[error("message name {0} is reserved")]
    ReservedMessageName(MessageName),

    /// The same name was registered twice.
    #[error("message name {0} registered twice")]
    DuplicateMessageName(MessageName),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, MessageError>;

impl From<ipclink_transport::TransportError> for MessageError {
    fn from(err: ipclink_transport::TransportError) -> Self {
        match err {
            ipclink_transport::TransportError::Io(io)
            | ipclink_transport::TransportError::Pair(io) => MessageError::Io(io),
            other => MessageError::Io(std::io::Error::other(other.to_string())),
        }
    }
}
