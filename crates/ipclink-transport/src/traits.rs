use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::warn;

use crate::error::Result;

/// Maximum number of descriptors carried by a single `sendmsg` call.
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 64;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// A connected IPC stream: one end of a socket pair.
///
/// Implements `Read + Write` for plain bytes, and
/// [`AttachmentRead`]/[`AttachmentWrite`] for bytes plus descriptors.
pub struct IpcStream {
    stream: UnixStream,
}

/// Streams that can receive descriptors alongside bytes.
///
/// The default implementation carries no descriptors, which is what
/// in-memory test streams need.
pub trait AttachmentRead: Read {
    fn read_with_attachments(
        &mut self,
        buf: &mut [u8],
        _fds: &mut Vec<OwnedFd>,
    ) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Streams that can send descriptors alongside bytes.
///
/// Descriptors are attached to the first byte written; callers retry the
/// remainder of a partial write with an empty descriptor list.
pub trait AttachmentWrite: Write {
    fn write_with_attachments(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        if fds.is_empty() {
            self.write(buf)
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream cannot carry attachments",
            ))
        }
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_attachments(buf, &[])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl AttachmentRead for IpcStream {
    fn read_with_attachments(
        &mut self,
        buf: &mut [u8],
        fds: &mut Vec<OwnedFd>,
    ) -> io::Result<usize> {
        recv_with_fds(self.stream.as_raw_fd(), buf, fds)
    }
}

impl AttachmentWrite for IpcStream {
    fn write_with_attachments(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        send_with_fds(self.stream.as_raw_fd(), buf, fds)
    }
}

impl<T: AsRef<[u8]>> AttachmentRead for io::Cursor<T> {}

impl AttachmentWrite for io::Cursor<Vec<u8>> {}

impl AttachmentWrite for Vec<u8> {}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    pub(crate) fn from_unix(stream: UnixStream) -> Self {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        disable_sigpipe(&stream);
        Self { stream }
    }

    /// Create a connected, anonymous pair of streams.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair().map_err(crate::TransportError::Pair)?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.stream.try_clone()?;
        Ok(Self::from_unix(cloned))
    }

    /// Shut down both directions. Blocked readers on any clone wake with EOF.
    pub fn shutdown(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let fd = self.stream.as_raw_fd();

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<IpcStream> for OwnedFd {
    fn from(stream: IpcStream) -> Self {
        stream.stream.into()
    }
}

impl From<OwnedFd> for IpcStream {
    fn from(fd: OwnedFd) -> Self {
        Self::from_unix(UnixStream::from(fd))
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("fd", &self.stream.as_raw_fd())
            .finish()
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn disable_sigpipe(stream: &UnixStream) {
    let one: libc::c_int = 1;
    // SAFETY: `one` outlives the call and the descriptor is open.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(error = %io::Error::last_os_error(), "failed to disable SIGPIPE on socket");
    }
}

/// Control buffer for `SCM_RIGHTS`; `u64` storage keeps `cmsghdr` aligned.
fn control_buffer(fd_count: usize) -> (Vec<u64>, usize) {
    let payload = fd_count * std::mem::size_of::<RawFd>();
    #[allow(unused_unsafe)]
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(payload as libc::c_uint) } as usize;
    (vec![0u64; space.div_ceil(8)], space)
}

fn send_with_fds(socket: RawFd, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    if fds.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "too many attachments ({}, max {MAX_ATTACHMENTS_PER_MESSAGE})",
                fds.len()
            ),
        ));
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let (mut control, space) = control_buffer(fds.len());

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let payload = std::mem::size_of_val(raw.as_slice());
        msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = space as _;

        // SAFETY: `control` holds CMSG_SPACE(payload) zeroed, aligned bytes, so
        // the first header exists and its data area fits `raw`.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as libc::c_uint) as _;
            std::ptr::copy_nonoverlapping(
                raw.as_ptr().cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                payload,
            );
        }
    }

    loop {
        // SAFETY: `msg` points at live iovec and control buffers for the call.
        let rc = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn recv_with_fds(socket: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let (mut control, space) = control_buffer(MAX_ATTACHMENTS_PER_MESSAGE);

    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = space as _;

    let read = loop {
        // SAFETY: `msg` points at live iovec and control buffers for the call.
        let rc = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    };

    // SAFETY: the kernel filled `control` with `msg_controllen` bytes of
    // well-formed cmsg records; each SCM_RIGHTS record owns its descriptors.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                #[allow(unused_unsafe)]
                let header = unsafe { libc::CMSG_LEN(0) } as usize;
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header)
                    / std::mem::size_of::<RawFd>();
                for index in 0..count {
                    let raw =
                        std::ptr::read_unaligned(data.add(index * std::mem::size_of::<RawFd>()).cast::<RawFd>());
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!("ancillary data truncated; some attachments were dropped by the kernel");
    }

    Ok(read)
}
