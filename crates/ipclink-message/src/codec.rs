use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipclink_transport::{Attachment, AttachmentKind, MAX_ATTACHMENTS_PER_MESSAGE};

use crate::encoder::EncodedMessage;
use crate::error::{MessageError, Result};

/// Fixed frame header: magic (2) + length (4) + attachment count (2) = 8 bytes.
///
/// One kind byte per attachment follows the fixed part.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "IL" (0x49 0x4C).
pub const MAGIC: [u8; 2] = [0x49, 0x4C];

/// Default maximum payload size: 256 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// One message as carried by the transport.
#[derive(Debug)]
pub struct Frame {
    /// Encoded message, header included.
    pub payload: Bytes,
    /// Out-of-band handles, in encode order.
    pub attachments: Vec<Attachment>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>, attachments: Vec<Attachment>) -> Self {
        Self {
            payload: payload.into(),
            attachments,
        }
    }

    /// The total wire size of this frame (headers + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.attachments.len() + self.payload.len()
    }
}

impl From<EncodedMessage> for Frame {
    fn from(message: EncodedMessage) -> Self {
        Self {
            payload: message.bytes,
            attachments: message.attachments,
        }
    }
}

/// Encode a frame header plus payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬───────────┬───────────┬──────────────┬──────────────────┐
/// │ Magic (2B) │ Length    │ Count     │ Kinds        │ Payload          │
/// │ 0x49 0x4C  │ (4B LE)   │ (2B LE)   │ (Count × 1B) │ (Length bytes)   │
/// │ "IL"       │           │           │              │                  │
/// └────────────┴───────────┴───────────┴──────────────┴──────────────────┘
/// ```
///
/// The descriptors themselves are not written here; the writer passes them
/// as ancillary data with the first byte of the frame.
pub fn encode_frame(payload: &[u8], kinds: &[AttachmentKind], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(MessageError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    if kinds.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(MessageError::TooManyAttachments {
            count: kinds.len(),
            max: MAX_ATTACHMENTS_PER_MESSAGE,
        });
    }
    dst.reserve(HEADER_SIZE + kinds.len() + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u16_le(kinds.len() as u16);
    for kind in kinds {
        dst.put_u8(kind.as_u8());
    }
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// `fds` holds descriptors received so far, oldest first; the frame takes
/// as many as it announces. Returns `Ok(None)` if the buffer doesn't
/// contain a complete frame yet. On success, consumes the frame bytes.
pub fn decode_frame(
    src: &mut BytesMut,
    fds: &mut VecDeque<OwnedFd>,
    max_payload: usize,
) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    // Check magic
    if src[0..2] != MAGIC {
        return Err(MessageError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let count = u16::from_le_bytes([src[6], src[7]]) as usize;

    if payload_len > max_payload {
        return Err(MessageError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if count > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(MessageError::TooManyAttachments {
            count,
            max: MAX_ATTACHMENTS_PER_MESSAGE,
        });
    }

    let total = HEADER_SIZE + count + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let mut kinds = Vec::with_capacity(count);
    for byte in &src[HEADER_SIZE..HEADER_SIZE + count] {
        let kind =
            AttachmentKind::from_u8(*byte).ok_or(MessageError::UnknownAttachmentKind(*byte))?;
        kinds.push(kind);
    }
    if fds.len() < count {
        return Err(MessageError::MissingAttachments {
            expected: count,
            received: fds.len(),
        });
    }

    src.advance(HEADER_SIZE + count);
    let payload = src.split_to(payload_len).freeze();
    let attachments = kinds
        .into_iter()
        .zip(fds.drain(..count))
        .map(|(kind, fd)| Attachment::new(kind, fd))
        .collect();

    Ok(Some(Frame {
        payload,
        attachments,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 256 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
