//! Message layer for ipclink.
//!
//! A message is a 16-byte header (flags, name, destination id) followed by
//! a payload of naturally aligned little-endian values, built with an
//! [`Encoder`] and read back with a [`Decoder`]. OS handles ride alongside
//! as attachments.
//!
//! On the wire every message is framed with:
//! - A 2-byte magic number ("IL") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian attachment count, then one kind byte each
//!
//! No partial reads, no buffer management in user code.

pub mod buffer;
pub mod codec;
pub mod coder;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod header;
pub mod message;
pub mod name;
pub mod reader;
pub mod registry;
pub mod writer;

pub use buffer::{MessageBuffer, INLINE_CAPACITY};
pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD};
pub use coder::{Decode, Encode, Scalar};
pub use decoder::Decoder;
pub use encoder::{EncodedMessage, Encoder};
pub use error::{MessageError, Result};
pub use header::{MessageFlags, MessageHeader, ShouldDispatchWhenWaitingForSyncReply, HEADER_SIZE};
pub use message::{AsyncReplyId, Message, MessageWithReply, SyncRequestId};
pub use name::{MessageName, USER_MESSAGE_START};
pub use reader::FrameReader;
pub use registry::{MessageInfo, MessageKind, MessageRegistry, MessageRegistryBuilder};
pub use writer::FrameWriter;
