use crate::name::MessageName;

/// Message header: flags (1) + reserved (1) + name (2) + reserved (4) + destination (8).
pub const HEADER_SIZE: usize = 16;

bitflags::bitflags! {
    /// Per-message flag byte carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const SYNC = 1 << 0;
        const DISPATCH_WHEN_WAITING_FOR_SYNC_REPLY = 1 << 1;
        const DISPATCH_WHEN_WAITING_FOR_UNBOUNDED_SYNC_REPLY = 1 << 2;
        const FULLY_SYNCHRONOUS_MODE_FOR_TESTING = 1 << 3;
        const MAINTAIN_ORDERING_WITH_ASYNC_MESSAGES = 1 << 4;
    }
}

/// Per-send override for dispatching a message on a thread blocked in a
/// synchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShouldDispatchWhenWaitingForSyncReply {
    #[default]
    No,
    Yes,
    YesDuringUnboundedSyncReply,
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub flags: MessageFlags,
    pub name: MessageName,
    pub destination_id: u64,
}

impl MessageHeader {
    /// Write the header into the first [`HEADER_SIZE`] bytes of `dst`.
    ///
    /// Reserved bytes are zeroed.
    pub fn write(&self, dst: &mut [u8]) {
        let dst = &mut dst[..HEADER_SIZE];
        dst.fill(0);
        dst[0] = self.flags.bits();
        dst[2..4].copy_from_slice(&self.name.get().to_le_bytes());
        dst[8..16].copy_from_slice(&self.destination_id.to_le_bytes());
    }

    /// Parse a header. Returns `None` if `src` is too short.
    ///
    /// Unknown flag bits are dropped.
    pub fn read(src: &[u8]) -> Option<Self> {
        let src = src.get(..HEADER_SIZE)?;
        let mut name = [0u8; 2];
        name.copy_from_slice(&src[2..4]);
        let mut destination = [0u8; 8];
        destination.copy_from_slice(&src[8..16]);
        Some(Self {
            flags: MessageFlags::from_bits_truncate(src[0]),
            name: MessageName(u16::from_le_bytes(name)),
            destination_id: u64::from_le_bytes(destination),
        })
    }
}
