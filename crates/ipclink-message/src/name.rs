//! Message names.
//!
//! Names 0-255 are reserved for built-in messages.
//! Names 256-65535 are available for application-defined messages.

use std::fmt;

/// Tag identifying the kind of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageName(pub u16);

impl MessageName {
    /// First message sent on a newly opened connection.
    pub const INITIALIZE_CONNECTION: Self = Self(0);

    /// Reply to a synchronous message; destination is the sync request id.
    pub const SYNC_MESSAGE_REPLY: Self = Self(1);

    /// The receiver declined a synchronous message.
    pub const CANCEL_SYNC_MESSAGE_REPLY: Self = Self(2);

    /// Envelope carrying another encoded message, unwrapped on receipt.
    pub const WRAPPED_ASYNC_MESSAGE_FOR_TESTING: Self = Self(3);

    /// Wire value.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns true if the name is in the reserved range.
    pub const fn is_builtin(self) -> bool {
        self.0 < USER_MESSAGE_START
    }
}

/// First application-defined message name.
pub const USER_MESSAGE_START: u16 = 256;

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for MessageName {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_reserved() {
        for name in [
            MessageName::INITIALIZE_CONNECTION,
            MessageName::SYNC_MESSAGE_REPLY,
            MessageName::CANCEL_SYNC_MESSAGE_REPLY,
            MessageName::WRAPPED_ASYNC_MESSAGE_FOR_TESTING,
        ] {
            assert!(name.is_builtin());
        }
        assert!(!MessageName(USER_MESSAGE_START).is_builtin());
    }
}
