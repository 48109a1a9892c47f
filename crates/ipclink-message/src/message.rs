use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::coder::{Decode, Encode};
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::name::MessageName;

/// A typed message with a fixed name.
///
/// Arguments are written by [`encode`](Message::encode) in the same order
/// [`decode`](Message::decode) reads them back.
pub trait Message: Sized {
    const NAME: MessageName;

    fn encode(self, encoder: &mut Encoder);

    fn decode(decoder: &mut Decoder) -> Option<Self>;
}

/// A message answered with a reply, either synchronously or asynchronously.
pub trait MessageWithReply: Message {
    /// Name of the reply message for async exchanges.
    ///
    /// Synchronous replies always travel as
    /// [`MessageName::SYNC_MESSAGE_REPLY`], which is the default.
    const REPLY_NAME: MessageName = MessageName::SYNC_MESSAGE_REPLY;

    type Reply: Encode + Decode + Send + 'static;
}

/// Correlates a synchronous request with its reply. Minted per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncRequestId(u64);

impl SyncRequestId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Correlates an async request with its reply. Minted process-wide, so a
/// reply can never be matched against a request on a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncReplyId(u64);

static NEXT_ASYNC_REPLY_ID: AtomicU64 = AtomicU64::new(1);

impl AsyncReplyId {
    pub fn generate() -> Self {
        Self(NEXT_ASYNC_REPLY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SyncRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync:{}", self.0)
    }
}

impl fmt::Display for AsyncReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "async:{}", self.0)
    }
}

impl Encode for SyncRequestId {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_object(self.0);
    }
}

impl Decode for SyncRequestId {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode_object().map(Self)
    }
}

impl Encode for AsyncReplyId {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_object(self.0);
    }
}

impl Decode for AsyncReplyId {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode_object().map(Self)
    }
}

impl Encoder {
    /// Start the reply to an async request of type `M`.
    pub fn for_async_reply<M: MessageWithReply>(reply_id: AsyncReplyId) -> Self {
        Encoder::new(M::REPLY_NAME, reply_id.get())
    }
}
