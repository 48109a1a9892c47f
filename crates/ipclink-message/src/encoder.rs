use bytes::Bytes;
use ipclink_transport::Attachment;

use crate::buffer::MessageBuffer;
use crate::coder::{Encode, Scalar};
use crate::header::{
    MessageFlags, MessageHeader, ShouldDispatchWhenWaitingForSyncReply, HEADER_SIZE,
};
use crate::name::MessageName;
use crate::registry::MessageRegistry;

/// Serializes one message into a contiguous buffer plus attachments.
///
/// The header region is reserved up front and filled in by
/// [`finish`](Self::finish), so flags may change until the message is handed
/// to the transport.
#[derive(Debug)]
pub struct Encoder {
    name: MessageName,
    destination_id: u64,
    flags: MessageFlags,
    buffer: MessageBuffer,
    attachments: Vec<Attachment>,
}

/// A finished message ready for framing.
#[derive(Debug)]
pub struct EncodedMessage {
    pub name: MessageName,
    pub destination_id: u64,
    pub flags: MessageFlags,
    /// Header followed by payload.
    pub bytes: Bytes,
    pub attachments: Vec<Attachment>,
}

impl Encoder {
    pub fn new(name: MessageName, destination_id: u64) -> Self {
        let mut buffer = MessageBuffer::new();
        buffer.grow(1, HEADER_SIZE);
        Self {
            name,
            destination_id,
            flags: MessageFlags::empty(),
            buffer,
            attachments: Vec::new(),
        }
    }

    pub fn message_name(&self) -> MessageName {
        self.name
    }

    pub fn destination_id(&self) -> u64 {
        self.destination_id
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(MessageFlags::SYNC)
    }

    pub fn set_is_sync(&mut self, is_sync: bool) {
        self.flags.set(MessageFlags::SYNC, is_sync);
    }

    /// Append a value using its [`Encode`] impl.
    pub fn encode<T: Encode>(&mut self, value: T) -> &mut Self {
        value.encode(self);
        self
    }

    /// Append one scalar at its natural alignment.
    pub fn encode_object<T: Scalar>(&mut self, value: T) -> &mut Self {
        let slot = self.grow_aligned(T::SIZE, T::SIZE);
        value.write_le(slot);
        self
    }

    /// Append a run of scalars, aligned for the element type.
    pub fn encode_span<T: Scalar>(&mut self, values: &[T]) -> &mut Self {
        let size = T::SIZE * values.len();
        let slot = self.grow_aligned(T::SIZE, size);
        for (value, chunk) in values.iter().zip(slot.chunks_exact_mut(T::SIZE)) {
            (*value).write_le(chunk);
        }
        self
    }

    /// Append already-serialized bytes with no alignment.
    pub fn encode_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    fn grow_aligned(&mut self, alignment: usize, size: usize) -> &mut [u8] {
        self.buffer.grow(alignment, size)
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        self.attachments.push(attachment);
        self
    }

    /// Drain the attachments; ownership moves to the caller.
    pub fn release_attachments(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.attachments)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn set_fully_synchronous_mode_for_testing(&mut self) {
        self.flags.insert(MessageFlags::FULLY_SYNCHRONOUS_MODE_FOR_TESTING);
    }

    pub fn is_fully_synchronous_mode_for_testing(&self) -> bool {
        self.flags
            .contains(MessageFlags::FULLY_SYNCHRONOUS_MODE_FOR_TESTING)
    }

    pub fn set_should_maintain_ordering_with_async_messages(&mut self) {
        self.flags
            .insert(MessageFlags::MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES);
    }

    pub fn should_maintain_ordering_with_async_messages(&self) -> bool {
        self.flags
            .contains(MessageFlags::MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES)
    }

    pub fn set_should_dispatch_message_when_waiting_for_sync_reply(
        &mut self,
        value: ShouldDispatchWhenWaitingForSyncReply,
    ) {
        let (bounded, unbounded) = match value {
            ShouldDispatchWhenWaitingForSyncReply::No => (false, false),
            ShouldDispatchWhenWaitingForSyncReply::Yes => (true, false),
            ShouldDispatchWhenWaitingForSyncReply::YesDuringUnboundedSyncReply => (false, true),
        };
        self.flags
            .set(MessageFlags::DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY, bounded);
        self.flags.set(
            MessageFlags::DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY,
            unbounded,
        );
    }

    pub fn is_allowed_when_waiting_for_sync_reply(&self, registry: &MessageRegistry) -> bool {
        registry.is_allowed_when_waiting_for_sync_reply(self.name)
            || self
                .flags
                .contains(MessageFlags::DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY)
    }

    pub fn is_allowed_when_waiting_for_unbounded_sync_reply(
        &self,
        registry: &MessageRegistry,
    ) -> bool {
        registry.is_allowed_when_waiting_for_unbounded_sync_reply(self.name)
            || self
                .flags
                .contains(MessageFlags::DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY)
    }

    /// Header plus payload written so far. The header bytes stay zero until
    /// [`finish`](Self::finish).
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len() == HEADER_SIZE
    }

    /// Write the header and hand the message over for transmission.
    pub fn finish(mut self) -> EncodedMessage {
        let header = MessageHeader {
            flags: self.flags,
            name: self.name,
            destination_id: self.destination_id,
        };
        header.write(self.buffer.as_mut_slice());
        EncodedMessage {
            name: self.name,
            destination_id: self.destination_id,
            flags: self.flags,
            bytes: self.buffer.into_bytes(),
            attachments: self.attachments,
        }
    }

    /// Wrap an encoded message in a `WRAPPED_ASYNC_MESSAGE_FOR_TESTING`
    /// envelope. The receiving connection unwraps and dispatches the inner
    /// message in order with ordinary async messages.
    pub fn wrap_for_testing(mut inner: Encoder) -> Encoder {
        inner.set_fully_synchronous_mode_for_testing();
        let destination_id = inner.destination_id;
        let message = inner.finish();

        let mut wrapper =
            Encoder::new(MessageName::WRAPPED_ASYNC_MESSAGE_FOR_TESTING, destination_id);
        wrapper.set_fully_synchronous_mode_for_testing();
        wrapper.encode(message.bytes.as_ref());
        for attachment in message.attachments {
            wrapper.add_attachment(attachment);
        }
        wrapper
    }
}

impl EncodedMessage {
    /// Payload bytes after the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }
}
