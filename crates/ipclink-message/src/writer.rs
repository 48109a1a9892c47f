use std::io::ErrorKind;
use std::os::fd::{AsFd, BorrowedFd};

use bytes::BytesMut;
use ipclink_transport::{Attachment, AttachmentKind, AttachmentWrite, IpcStream};

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::encoder::EncodedMessage;
use crate::error::{MessageError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames, with their attachments, to a stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: AttachmentWrite> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: Frame) -> Result<()> {
        self.send(frame.payload.as_ref(), frame.attachments)
    }

    /// Write a finished message (blocking).
    pub fn write_message(&mut self, message: EncodedMessage) -> Result<()> {
        self.send(message.bytes.as_ref(), message.attachments)
    }

    /// Encode and send a payload with its attachments.
    ///
    /// The attachments are closed locally once the kernel has taken its
    /// copies.
    pub fn send(&mut self, payload: &[u8], attachments: Vec<Attachment>) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(MessageError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let kinds: Vec<AttachmentKind> = attachments.iter().map(Attachment::kind).collect();
        self.buf.clear();
        encode_frame(payload, &kinds, &mut self.buf)?;

        let mut fds: Vec<BorrowedFd<'_>> = attachments.iter().map(AsFd::as_fd).collect();
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write_with_attachments(&self.buf[offset..], &fds) {
                Ok(0) => return Err(MessageError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    fds.clear();
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // A write timeout surfaces as WouldBlock; the frame is torn either way.
                Err(err) => return Err(MessageError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(MessageError::Io(err)),
            }
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

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
