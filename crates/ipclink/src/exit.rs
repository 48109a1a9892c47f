use std::fmt;
use std::io;

use ipclink_connection::Error as ConnectionError;
use ipclink_message::MessageError;
use ipclink_transport::TransportError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Pair(source) | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn message_error(context: &str, err: MessageError) -> CliError {
    match err {
        MessageError::Io(source) => io_error(context, source),
        MessageError::PayloadTooLarge { .. } | MessageError::TooManyAttachments { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        MessageError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn connection_error(context: &str, err: ConnectionError) -> CliError {
    let code = match err {
        ConnectionError::Timeout => TIMEOUT,
        ConnectionError::InvalidConnection => TRANSPORT_ERROR,
        ConnectionError::SyncMessageCancelled => FAILURE,
        ConnectionError::FailedToDecodeReplyArguments | ConnectionError::CantEncodeMessage => {
            DATA_INVALID
        }
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_map_to_exit_codes() {
        assert_eq!(connection_error("x", ConnectionError::Timeout).code, TIMEOUT);
        assert_eq!(
            connection_error("x", ConnectionError::InvalidConnection).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            connection_error("x", ConnectionError::CantEncodeMessage).code,
            DATA_INVALID
        );
    }

    #[test]
    fn io_errors_keep_their_context() {
        let err = io_error(
            "socket pair",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert!(err.message.starts_with("socket pair: "));
    }
}
