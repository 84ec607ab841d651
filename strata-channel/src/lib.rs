//! The socket transport between the window server and its clients.
//!
//! One Unix-domain connection per client.  Requests and replies are framed
//! with the fixed headers from `strata-wire`; a frame may carry one file
//! descriptor out of band (`SCM_RIGHTS`), which is how surface descriptors
//! travel.  All receive operations take a timeout in 10 ms ticks; zero
//! means block indefinitely and is reserved for the server side.
//!
//! The peer is untrusted: every length field is validated against the
//! frame limit before any buffer is sized from it.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use strata_wire::{ReplyHeader, RequestHeader, MAX_FRAME_LEN, TIMEOUT_TICK_MS};
use thiserror::Error;

/// Transport errors.  Each maps to a stable negative wire code.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A read or write failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection.
    #[error("peer closed the channel")]
    Closed,
    /// A frame or argument violated the protocol (oversized length,
    /// unknown id).
    #[error("invalid channel argument")]
    InvalidArg,
    /// The timeout expired before a full frame arrived.
    #[error("channel timeout expired")]
    Timeout,
}

impl ChannelError {
    /// The negative wire code for this error.
    pub fn wire_code(&self) -> i32 {
        match self {
            ChannelError::Io(_) => strata_wire::ERR_IO,
            ChannelError::Closed => strata_wire::ERR_CLOSED,
            ChannelError::InvalidArg => strata_wire::ERR_INVARG,
            ChannelError::Timeout => strata_wire::ERR_TIMEOUT,
        }
    }
}

/// A received frame: the leading header word pair, the body, and the
/// descriptor that rode along, if any.
pub struct Frame {
    /// First header word (request id, or reply code as `u32`).
    pub word0: u32,
    /// The frame body.
    pub body: Vec<u8>,
    /// Descriptor received with the frame.
    pub fd: Option<OwnedFd>,
}

// CMSG_SPACE(sizeof(int)): one aligned cmsg header plus one descriptor.
const CMSG_BUF_LEN: usize = 24;

/// One connection between a client and the server.
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Connects to the server's listening socket.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Channel, ChannelError> {
        Ok(Channel {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: UnixStream) -> Channel {
        Channel { stream }
    }

    /// Sends a request frame, optionally with a descriptor.
    pub fn send_request(
        &self,
        id: u32,
        body: &[u8],
        fd: Option<RawFd>,
    ) -> Result<(), ChannelError> {
        let header = RequestHeader {
            id,
            untrusted_len: body.len() as u32,
        };
        self.send_frame(bytemuck::bytes_of(&header), body, fd)
    }

    /// Sends a reply frame, optionally with a descriptor.
    pub fn send_reply(
        &self,
        code: i32,
        body: &[u8],
        fd: Option<RawFd>,
    ) -> Result<(), ChannelError> {
        let header = ReplyHeader {
            code,
            untrusted_len: body.len() as u32,
        };
        self.send_frame(bytemuck::bytes_of(&header), body, fd)
    }

    /// Receives a request frame.  The id is validated only for length
    /// bounds here; dispatch-level validation is the server's job.
    pub fn recv_request(&self, timeout_ticks: u32) -> Result<Frame, ChannelError> {
        self.recv_frame(timeout_ticks)
    }

    /// Receives a reply frame.  The first word is the reply code.
    pub fn recv_reply(&self, timeout_ticks: u32) -> Result<Frame, ChannelError> {
        self.recv_frame(timeout_ticks)
    }

    fn send_frame(
        &self,
        header: &[u8],
        body: &[u8],
        fd: Option<RawFd>,
    ) -> Result<(), ChannelError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(ChannelError::InvalidArg);
        }
        // The descriptor rides on the header bytes; the body follows as a
        // plain write.
        self.sendmsg(header, fd)?;
        if !body.is_empty() {
            self.write_all(body)?;
        }
        Ok(())
    }

    fn recv_frame(&self, timeout_ticks: u32) -> Result<Frame, ChannelError> {
        let mut header = [0u8; 8];
        let fd = self.recvmsg_exact(&mut header, timeout_ticks)?;
        let words: &[u32] = bytemuck::cast_slice(&header);
        let word0 = words[0];
        let untrusted_len = words[1] as usize;
        // Length is untrusted; bound it before allocating.
        if untrusted_len > MAX_FRAME_LEN {
            return Err(ChannelError::InvalidArg);
        }
        let mut body = vec![0u8; untrusted_len];
        if untrusted_len > 0 {
            self.read_exact(&mut body, timeout_ticks)?;
        }
        Ok(Frame { word0, body, fd })
    }

    fn poll_readable(&self, timeout_ticks: u32) -> Result<(), ChannelError> {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = if timeout_ticks == 0 {
            -1
        } else {
            (timeout_ticks * TIMEOUT_TICK_MS) as libc::c_int
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc > 0 {
                if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
                    && pfd.revents & libc::POLLIN == 0
                {
                    return Err(ChannelError::Closed);
                }
                return Ok(());
            }
            if rc == 0 {
                return Err(ChannelError::Timeout);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    fn read_exact(&self, buf: &mut [u8], timeout_ticks: u32) -> Result<(), ChannelError> {
        let mut done = 0;
        while done < buf.len() {
            self.poll_readable(timeout_ticks)?;
            let rc = unsafe {
                libc::read(
                    self.stream.as_raw_fd(),
                    buf[done..].as_mut_ptr().cast(),
                    buf.len() - done,
                )
            };
            match rc {
                0 => return Err(ChannelError::Closed),
                n if n > 0 => done += n as usize,
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), ChannelError> {
        let mut done = 0;
        while done < buf.len() {
            let rc = unsafe {
                libc::write(
                    self.stream.as_raw_fd(),
                    buf[done..].as_ptr().cast(),
                    buf.len() - done,
                )
            };
            match rc {
                0 => return Err(ChannelError::Closed),
                n if n > 0 => done += n as usize,
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::Interrupted => {}
                        io::ErrorKind::BrokenPipe => return Err(ChannelError::Closed),
                        _ => return Err(err.into()),
                    }
                }
            }
        }
        Ok(())
    }

    fn sendmsg(&self, bytes: &[u8], fd: Option<RawFd>) -> Result<(), ChannelError> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some(fd) = fd {
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_buf.len() as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(4) as _;
                std::ptr::copy_nonoverlapping(
                    (&fd as *const RawFd).cast::<u8>(),
                    libc::CMSG_DATA(cmsg),
                    4,
                );
            }
        }
        loop {
            let rc = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if rc >= 0 {
                if rc as usize != bytes.len() {
                    // Header frames are tiny; a short sendmsg on a stream
                    // socket here means the peer vanished mid-frame.
                    return Err(ChannelError::Closed);
                }
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::BrokenPipe => return Err(ChannelError::Closed),
                _ => return Err(err.into()),
            }
        }
    }

    fn recvmsg_exact(
        &self,
        buf: &mut [u8],
        timeout_ticks: u32,
    ) -> Result<Option<OwnedFd>, ChannelError> {
        let mut received_fd = None;
        let mut done = 0;
        while done < buf.len() {
            self.poll_readable(timeout_ticks)?;
            let mut iov = libc::iovec {
                iov_base: buf[done..].as_mut_ptr().cast(),
                iov_len: buf.len() - done,
            };
            let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_buf.len() as _;
            let rc = unsafe {
                libc::recvmsg(self.stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
            };
            match rc {
                0 => return Err(ChannelError::Closed),
                n if n > 0 => {
                    done += n as usize;
                    unsafe {
                        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                        while !cmsg.is_null() {
                            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                            {
                                let mut fd: RawFd = -1;
                                std::ptr::copy_nonoverlapping(
                                    libc::CMSG_DATA(cmsg),
                                    (&mut fd as *mut RawFd).cast::<u8>(),
                                    4,
                                );
                                if fd >= 0 {
                                    received_fd = Some(OwnedFd::from_raw_fd(fd));
                                }
                            }
                            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                        }
                    }
                }
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(received_fd)
    }
}

/// The server's listening socket.  Removes a stale socket file on bind
/// and the live one on drop.
pub struct Listener {
    listener: UnixListener,
    path: std::path::PathBuf,
}

impl Listener {
    /// Binds the well-known server socket.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Listener, ChannelError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => log::warn!("removed stale socket {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&path)?;
        log::info!("listening on {}", path.display());
        Ok(Listener { listener, path })
    }

    /// Accepts one client connection, blocking.
    pub fn accept(&self) -> Result<Channel, ChannelError> {
        let (stream, _) = self.listener.accept()?;
        Ok(Channel::from_stream(stream))
    }

    /// The raw descriptor, for polling alongside client connections.
    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
