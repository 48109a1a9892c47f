use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// What an out-of-band handle stands for.
///
/// The kind travels on the wire next to the frame so the receiver can
/// reject a handle decoded as the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttachmentKind {
    /// A generic duplicated descriptor (file, pipe, shared memory).
    File = 1,
    /// One end of an established socket pair, used to bootstrap a sub-connection.
    Connection = 2,
}

impl AttachmentKind {
    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte. Returns `None` for unknown kinds.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::File),
            2 => Some(Self::Connection),
            _ => None,
        }
    }
}

/// An OS resource handle that travels alongside a message's byte payload.
///
/// Attachments are moved, never copied: the encoder owns them until the
/// transport takes them, and the decoder hands ownership to whoever
/// consumes them. Dropping an attachment closes the descriptor.
#[derive(Debug)]
pub struct Attachment {
    kind: AttachmentKind,
    fd: OwnedFd,
}

impl Attachment {
    /// Wrap an owned descriptor.
    pub fn new(kind: AttachmentKind, fd: impl Into<OwnedFd>) -> Self {
        Self {
            kind,
            fd: fd.into(),
        }
    }

    /// Wrap a generic file-like descriptor.
    pub fn file(fd: impl Into<OwnedFd>) -> Self {
        Self::new(AttachmentKind::File, fd)
    }

    /// Duplicate a borrowed descriptor into a new attachment.
    pub fn duplicate(kind: AttachmentKind, fd: BorrowedFd<'_>) -> std::io::Result<Self> {
        Ok(Self::new(kind, fd.try_clone_to_owned()?))
    }

    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    /// Release the descriptor to the caller.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for Attachment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Attachment {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn kind_roundtrips_through_wire_byte() {
        for kind in [AttachmentKind::File, AttachmentKind::Connection] {
            assert_eq!(AttachmentKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(AttachmentKind::from_u8(0), None);
        assert_eq!(AttachmentKind::from_u8(200), None);
    }

    #[test]
    fn duplicate_keeps_original_usable() {
        let (mut left, right) = UnixStream::pair().unwrap();
        let attachment = Attachment::duplicate(AttachmentKind::File, right.as_fd()).unwrap();
        assert_ne!(attachment.as_raw_fd(), right.as_raw_fd());

        let mut dup = UnixStream::from(attachment.into_fd());
        left.write_all(b"dup").unwrap();
        let mut buf = [0u8; 3];
        dup.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"dup");
        drop(right);
    }
}
