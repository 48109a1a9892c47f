use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use tracing::debug;

use crate::attachment::{Attachment, AttachmentKind};
use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// One endpoint of an unconnected-yet channel.
///
/// An identifier owns its socket until a connection takes it with
/// [`Identifier::into_stream`], or until it is sent to another process as a
/// [`AttachmentKind::Connection`] attachment.
#[derive(Debug)]
pub struct Identifier {
    stream: IpcStream,
}

/// The two endpoints created together by [`create_identifier_pair`].
///
/// Both ends are symmetric in capability; the names only say which side is
/// expected to stay in the creating process.
#[derive(Debug)]
pub struct IdentifierPair {
    pub server: Identifier,
    pub client: Identifier,
}

/// Create a connected pair of identifiers backed by a socket pair.
pub fn create_identifier_pair() -> Result<IdentifierPair> {
    let (server, client) = IpcStream::pair()?;
    debug!(
        server_fd = server.as_fd().as_raw_fd(),
        client_fd = client.as_fd().as_raw_fd(),
        "created identifier pair"
    );
    Ok(IdentifierPair {
        server: Identifier { stream: server },
        client: Identifier { stream: client },
    })
}

impl Identifier {
    /// Take the stream out of the identifier.
    pub fn into_stream(self) -> IpcStream {
        self.stream
    }

    /// Package this identifier for transfer to another process.
    pub fn into_attachment(self) -> Attachment {
        Attachment::new(AttachmentKind::Connection, self.stream)
    }

    /// Rebuild an identifier received as an attachment.
    pub fn from_attachment(attachment: Attachment) -> Result<Self> {
        if attachment.kind() != AttachmentKind::Connection {
            return Err(TransportError::AttachmentKindMismatch {
                expected: AttachmentKind::Connection,
                actual: attachment.kind(),
            });
        }
        Ok(Self {
            stream: IpcStream::from(attachment.into_fd()),
        })
    }
}

impl AsFd for Identifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
