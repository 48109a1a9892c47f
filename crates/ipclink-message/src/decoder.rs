use std::collections::VecDeque;

use bytes::Bytes;
use ipclink_transport::{Attachment, AttachmentKind};

use crate::coder::{Decode, Scalar};
use crate::error::{MessageError, Result};
use crate::header::{MessageFlags, MessageHeader, HEADER_SIZE};
use crate::name::MessageName;

/// Reads typed values back out of a received message, in encode order.
///
/// The header is parsed up front, so name, destination and flags can be
/// inspected without touching the payload. Any failed read poisons the
/// decoder: it and every later read return `None`.
#[derive(Debug)]
pub struct Decoder {
    bytes: Bytes,
    cursor: usize,
    attachments: VecDeque<Attachment>,
    header: MessageHeader,
    valid: bool,
}

impl Decoder {
    /// Parse a received message.
    pub fn new(bytes: Bytes, attachments: Vec<Attachment>) -> Result<Self> {
        let header = MessageHeader::read(&bytes).ok_or(MessageError::TruncatedMessage {
            size: bytes.len(),
            needed: HEADER_SIZE,
        })?;
        Ok(Self {
            bytes,
            cursor: HEADER_SIZE,
            attachments: attachments.into(),
            header,
            valid: true,
        })
    }

    pub fn message_name(&self) -> MessageName {
        self.header.name
    }

    pub fn destination_id(&self) -> u64 {
        self.header.destination_id
    }

    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    pub fn is_sync(&self) -> bool {
        self.header.flags.contains(MessageFlags::SYNC)
    }

    pub fn is_fully_synchronous_mode_for_testing(&self) -> bool {
        self.header
            .flags
            .contains(MessageFlags::FULLY_SYNCHRONOUS_MODE_FOR_TESTING)
    }

    pub fn should_maintain_ordering_with_async_messages(&self) -> bool {
        self.header
            .flags
            .contains(MessageFlags::MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES)
    }

    pub fn should_dispatch_when_waiting_for_sync_reply(&self) -> bool {
        self.header
            .flags
            .contains(MessageFlags::DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY)
    }

    pub fn should_dispatch_when_waiting_for_unbounded_sync_reply(&self) -> bool {
        self.header
            .flags
            .contains(MessageFlags::DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY)
    }

    /// False once any read has failed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Poison the decoder, e.g. when a handler finds a semantically bad value.
    pub fn mark_invalid(&mut self) {
        self.valid = false;
    }

    /// Payload bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn remaining_attachments(&self) -> usize {
        self.attachments.len()
    }

    /// The whole message, header included.
    pub fn buffer(&self) -> &Bytes {
        &self.bytes
    }

    /// Read the next value using its [`Decode`] impl.
    pub fn decode<T: Decode>(&mut self) -> Option<T> {
        if !self.valid {
            return None;
        }
        let value = T::decode(self);
        if value.is_none() {
            self.valid = false;
        }
        value
    }

    /// Read one scalar at its natural alignment.
    pub fn decode_object<T: Scalar>(&mut self) -> Option<T> {
        let start = self.take_aligned(T::SIZE, T::SIZE)?;
        match T::read_le(&self.bytes[start..start + T::SIZE]) {
            Some(value) => Some(value),
            None => self.fail(),
        }
    }

    /// Read `count` scalars laid out by [`Encoder::encode_span`](crate::Encoder::encode_span).
    pub fn decode_span<T: Scalar>(&mut self, count: usize) -> Option<Vec<T>> {
        let Some(size) = T::SIZE.checked_mul(count) else {
            return self.fail();
        };
        let start = self.take_aligned(T::SIZE, size)?;
        let data = self.bytes.slice(start..start + size);
        let mut values = Vec::with_capacity(count);
        for chunk in data.chunks_exact(T::SIZE) {
            match T::read_le(chunk) {
                Some(value) => values.push(value),
                None => return self.fail(),
            }
        }
        Some(values)
    }

    /// Take `len` unaligned bytes as a zero-copy slice of the message.
    pub fn decode_raw(&mut self, len: usize) -> Option<Bytes> {
        let start = self.take_aligned(1, len)?;
        Some(self.bytes.slice(start..start + len))
    }

    /// Take the next attachment, which must be of `kind`.
    pub fn take_attachment(&mut self, kind: AttachmentKind) -> Option<Attachment> {
        if !self.valid {
            return None;
        }
        let matches = self
            .attachments
            .front()
            .is_some_and(|next| next.kind() == kind);
        if matches {
            self.attachments.pop_front()
        } else {
            self.fail()
        }
    }

    /// Take the next attachment whatever its kind.
    pub fn take_any_attachment(&mut self) -> Option<Attachment> {
        if !self.valid {
            return None;
        }
        match self.attachments.pop_front() {
            Some(attachment) => Some(attachment),
            None => self.fail(),
        }
    }

    /// Open a `WRAPPED_ASYNC_MESSAGE_FOR_TESTING` envelope.
    ///
    /// The inner decoder receives every attachment left in this one.
    pub fn unwrap_for_testing(&mut self) -> Option<Decoder> {
        if self.message_name() != MessageName::WRAPPED_ASYNC_MESSAGE_FOR_TESTING {
            return self.fail();
        }
        let inner: Bytes = self.decode()?;
        let attachments: Vec<Attachment> = self.attachments.drain(..).collect();
        match Decoder::new(inner, attachments) {
            Ok(decoder) => Some(decoder),
            Err(_) => self.fail(),
        }
    }

    fn take_aligned(&mut self, alignment: usize, size: usize) -> Option<usize> {
        if !self.valid {
            return None;
        }
        debug_assert!(alignment.is_power_of_two());
        let start = match self.cursor.checked_add(alignment - 1) {
            Some(end) => end & !(alignment - 1),
            None => return self.fail(),
        };
        match start.checked_add(size) {
            Some(end) if end <= self.bytes.len() => {
                self.cursor = end;
                Some(start)
            }
            _ => self.fail(),
        }
    }

    fn fail<T>(&mut self) -> Option<T> {
        self.valid = false;
        None
    }
}
