/// Errors returned by connection operations.
///
/// Success is `Ok`; there is no "no error" variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// No reply or matching message arrived before the deadline.
    #[error("timed out")]
    Timeout,

    /// The connection is unopened, invalidated, or its peer is gone.
    #[error("connection is not valid")]
    InvalidConnection,

    /// The receiver declined the synchronous message or failed to decode it.
    #[error("sync message was cancelled by the receiver")]
    SyncMessageCancelled,

    /// A reply arrived but its arguments did not decode.
    #[error("failed to decode reply arguments")]
    FailedToDecodeReplyArguments,

    /// The message exceeds what the transport can carry.
    #[error("message cannot be encoded for transport")]
    CantEncodeMessage,
}

pub type Result<T> = std::result::Result<T, Error>;
