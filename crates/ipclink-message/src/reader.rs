use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::fd::OwnedFd;

use bytes::BytesMut;
use ipclink_transport::{AttachmentRead, IpcStream};

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{MessageError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames, with their attachments, from a stream.
///
/// Handles partial reads internally, so callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
    config: FrameConfig,
}

impl<T: AttachmentRead> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            fds: VecDeque::new(),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(MessageError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut received = Vec::new();
        loop {
            if let Some(frame) =
                decode_frame(&mut self.buf, &mut self.fds, self.config.max_payload_size)?
            {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read_with_attachments(&mut chunk, &mut received) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(MessageError::Io(err)),
            };
            self.fds.extend(received.drain(..));

            if read == 0 {
                return Err(MessageError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
