use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MessageError, Result};
use crate::name::{MessageName, USER_MESSAGE_START};

/// How a message participates in request/reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget, or the request half of an async exchange.
    Async,
    /// Sender blocks for a correlated reply.
    Sync,
    /// Reply half of an async exchange; destination is the reply id.
    AsyncReply,
    /// Connection bookkeeping, never handed to a client as-is.
    Internal,
}

/// Static dispatch metadata for one message name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub description: &'static str,
    pub receiver: &'static str,
    pub kind: MessageKind,
    pub can_dispatch_out_of_order: bool,
    pub allowed_when_waiting_for_sync_reply: bool,
    pub allowed_when_waiting_for_unbounded_sync_reply: bool,
}

impl MessageInfo {
    pub const fn new(description: &'static str, receiver: &'static str, kind: MessageKind) -> Self {
        Self {
            description,
            receiver,
            kind,
            can_dispatch_out_of_order: false,
            allowed_when_waiting_for_sync_reply: false,
            allowed_when_waiting_for_unbounded_sync_reply: false,
        }
    }

    pub const fn asynchronous(description: &'static str, receiver: &'static str) -> Self {
        Self::new(description, receiver, MessageKind::Async)
    }

    pub const fn synchronous(description: &'static str, receiver: &'static str) -> Self {
        Self::new(description, receiver, MessageKind::Sync)
    }

    pub const fn async_reply(description: &'static str, receiver: &'static str) -> Self {
        Self::new(description, receiver, MessageKind::AsyncReply)
    }

    /// Allow the peer to run this message ahead of earlier queued messages.
    pub const fn out_of_order(mut self) -> Self {
        self.can_dispatch_out_of_order = true;
        self
    }

    /// Allow dispatch on a thread blocked in a bounded synchronous send.
    pub const fn when_waiting_for_sync_reply(mut self) -> Self {
        self.allowed_when_waiting_for_sync_reply = true;
        self
    }

    /// Allow dispatch on a thread blocked in a synchronous send without timeout.
    pub const fn when_waiting_for_unbounded_sync_reply(mut self) -> Self {
        self.allowed_when_waiting_for_unbounded_sync_reply = true;
        self
    }

    pub const fn is_sync(&self) -> bool {
        matches!(self.kind, MessageKind::Sync)
    }
}

const BUILTIN_MESSAGES: [(MessageName, MessageInfo); 4] = [
    (
        MessageName::INITIALIZE_CONNECTION,
        MessageInfo::new("InitializeConnection", "IPC", MessageKind::Internal),
    ),
    (
        MessageName::SYNC_MESSAGE_REPLY,
        MessageInfo::new("SyncMessageReply", "IPC", MessageKind::Internal),
    ),
    (
        MessageName::CANCEL_SYNC_MESSAGE_REPLY,
        MessageInfo::new("CancelSyncMessageReply", "IPC", MessageKind::Internal),
    ),
    (
        MessageName::WRAPPED_ASYNC_MESSAGE_FOR_TESTING,
        MessageInfo::new("WrappedAsyncMessageForTesting", "IPC", MessageKind::Internal),
    ),
];

/// Immutable table of message metadata.
///
/// Built once with [`MessageRegistryBuilder`] and shared by every connection
/// that speaks the same protocol. Built-in names are always present.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    entries: HashMap<MessageName, MessageInfo>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder::new()
    }

    /// Registry holding only the built-in messages.
    pub fn builtin() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, name: MessageName) -> Option<&MessageInfo> {
        self.entries.get(&name)
    }

    pub fn contains(&self, name: MessageName) -> bool {
        self.entries.contains_key(&name)
    }

    /// Human-readable name for logs.
    pub fn description(&self, name: MessageName) -> &'static str {
        self.get(name)
            .map(|info| info.description)
            .unwrap_or("<unknown message>")
    }

    pub fn is_sync(&self, name: MessageName) -> bool {
        self.get(name).is_some_and(MessageInfo::is_sync)
    }

    pub fn can_dispatch_out_of_order(&self, name: MessageName) -> bool {
        self.get(name).is_some_and(|info| info.can_dispatch_out_of_order)
    }

    pub fn is_allowed_when_waiting_for_sync_reply(&self, name: MessageName) -> bool {
        self.get(name)
            .is_some_and(|info| info.allowed_when_waiting_for_sync_reply)
    }

    pub fn is_allowed_when_waiting_for_unbounded_sync_reply(&self, name: MessageName) -> bool {
        self.get(name)
            .is_some_and(|info| info.allowed_when_waiting_for_unbounded_sync_reply)
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> Vec<(MessageName, MessageInfo)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self {
            entries: BUILTIN_MESSAGES.into_iter().collect(),
        }
    }
}

/// Collects application message metadata before freezing it.
#[derive(Debug, Default)]
pub struct MessageRegistryBuilder {
    entries: Vec<(MessageName, MessageInfo)>,
}

impl MessageRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<MessageName>, info: MessageInfo) -> Self {
        self.entries.push((name.into(), info));
        self
    }

    /// Freeze the table.
    ///
    /// Fails if a name is registered twice or falls in the built-in range.
    pub fn build(self) -> Result<Arc<MessageRegistry>> {
        let mut registry = MessageRegistry::default();
        for (name, info) in self.entries {
            if name.get() < USER_MESSAGE_START {
                return Err(MessageError::ReservedMessageName(name));
            }
            if registry.entries.insert(name, info).is_some() {
                return Err(MessageError::DuplicateMessageName(name));
            }
        }
        Ok(Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_always_present() {
        let registry = MessageRegistry::builder().build().unwrap();
        assert_eq!(registry.len(), BUILTIN_MESSAGES.len());
        assert_eq!(
            registry.get(MessageName::SYNC_MESSAGE_REPLY).map(|i| i.kind),
            Some(MessageKind::Internal)
        );
    }

    #[test]
    fn flags_are_looked_up_per_name() {
        let ping = MessageName(300);
        let pong = MessageName(301);
        let registry = MessageRegistry::builder()
            .register(ping, MessageInfo::asynchronous("Ping", "Test").out_of_order())
            .register(
                pong,
                MessageInfo::synchronous("Pong", "Test").when_waiting_for_sync_reply(),
            )
            .build()
            .unwrap();

        assert!(registry.can_dispatch_out_of_order(ping));
        assert!(!registry.is_sync(ping));
        assert!(registry.is_sync(pong));
        assert!(registry.is_allowed_when_waiting_for_sync_reply(pong));
        assert!(!registry.is_allowed_when_waiting_for_unbounded_sync_reply(pong));
        assert_eq!(registry.description(MessageName(999)), "<unknown message>");
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        let err = MessageRegistry::builder()
            .register(5u16, MessageInfo::asynchronous("Bad", "Test"))
            .build()
            .unwrap_err();
        assert!(matches!(err, MessageError::ReservedMessageName(MessageName(5))));

        let err = MessageRegistry::builder()
            .register(400u16, MessageInfo::asynchronous("A", "Test"))
            .register(400u16, MessageInfo::asynchronous("B", "Test"))
            .build()
            .unwrap_err();
        assert!(matches!(err, MessageError::DuplicateMessageName(MessageName(400))));
    }

    #[test]
    fn entries_are_sorted() {
        let registry = MessageRegistry::builder()
            .register(900u16, MessageInfo::asynchronous("Z", "Test"))
            .register(300u16, MessageInfo::asynchronous("A", "Test"))
            .build()
            .unwrap();
        let names: Vec<u16> = registry.entries().iter().map(|(n, _)| n.get()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
