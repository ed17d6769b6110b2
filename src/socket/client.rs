//! UNIX-domain socket client.
//!
//! Same asynchronous task contract as the server side, plus non-blocking
//! `connect` (with the `SO_ERROR` check parked on a oneshot WRITE job when
//! the kernel answers `EINPROGRESS`) and `reconnect`, which re-opens the
//! socket to the stored peer path while preserving upper-level state.

use super::{
    drive_recv, drive_send, Completion, DriveOutcome, SocketError, TaskState,
};
use crate::io_service::{IoOp, IoService, JobMode};
use nix::errno::Errno;
use nix::sys::socket::{
    connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, UnixAddr,
};
use std::cell::RefCell;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Invoked once the connection is established.
pub type ConnectorFn = Box<dyn FnMut(&Client)>;

/// Completion callback of an asynchronous send or receive.
pub type ClientCompletionFn = Box<dyn FnMut(&Client, Completion)>;

struct Inner {
    iosvc: Rc<IoService>,
    fd: Option<OwnedFd>,
    peer: Option<PathBuf>,
    eof: bool,
    read: TaskState,
    read_cb: Option<ClientCompletionFn>,
    write: TaskState,
    write_cb: Option<ClientCompletionFn>,
    pending_connector: Option<ConnectorFn>,
}

/// Cheaply clonable handle over the single connection a client owns.
///
/// `deinit` is the deterministic teardown: it removes both I/O jobs before
/// the fd is closed and drops every stored callback.
#[derive(Clone)]
pub struct Client {
    inner: Rc<RefCell<Inner>>,
}

impl Client {
    pub fn new(iosvc: Rc<IoService>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                iosvc,
                fd: None,
                peer: None,
                eof: false,
                read: TaskState::new(),
                read_cb: None,
                write: TaskState::new(),
                write_cb: None,
                pending_connector: None,
            })),
        }
    }

    fn open_socket() -> Result<OwnedFd, SocketError> {
        socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| SocketError::syscall("socket", e))
    }

    /// Connects to the socket node at `path`. `connector` fires on success —
    /// immediately for a local connect that completes in place, otherwise
    /// from a oneshot WRITE job once the kernel reports the outcome.
    pub fn connect(&self, path: &Path, connector: ConnectorFn) -> Result<(), SocketError> {
        let addr = UnixAddr::new(path).map_err(|e| SocketError::syscall("sockaddr", e))?;
        let fd = Self::open_socket()?;
        let raw = fd.as_raw_fd();

        let result = connect(raw, &addr);
        let iosvc = {
            let mut inner = self.inner.borrow_mut();
            inner.fd = Some(fd);
            inner.peer = Some(path.to_path_buf());
            inner.eof = false;
            Rc::clone(&inner.iosvc)
        };

        match result {
            Ok(()) => {
                debug!(peer = %path.display(), "connected");
                let mut connector = connector;
                connector(self);
                Ok(())
            }
            Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {
                self.inner.borrow_mut().pending_connector = Some(connector);
                let client = self.clone();
                iosvc.post_job(
                    raw,
                    IoOp::Write,
                    JobMode::Oneshot,
                    Box::new(move |_, _| client.on_connect_ready()),
                );
                Ok(())
            }
            Err(errno) => {
                self.inner.borrow_mut().fd = None;
                Err(SocketError::syscall("connect", errno))
            }
        }
    }

    fn on_connect_ready(&self) {
        let status = {
            let inner = self.inner.borrow();
            let Some(fd) = inner.fd.as_ref() else { return };
            getsockopt(fd, sockopt::SocketError)
        };

        match status {
            Ok(0) => {
                let connector = self.inner.borrow_mut().pending_connector.take();
                if let Some(mut connector) = connector {
                    connector(self);
                }
            }
            Ok(raw) => {
                let errno = Errno::from_raw(raw);
                warn!(peer = ?self.peer_path(), %errno, "connect failed");
            }
            Err(errno) => {
                warn!(peer = ?self.peer_path(), %errno, "can't read connect status");
            }
        }
    }

    /// Closes the current socket and opens a fresh connection to the stored
    /// peer path. Task buffers are reset; the connector is not re-fired —
    /// re-arming reads is the caller's move.
    pub fn reconnect(&self) -> Result<(), SocketError> {
        let (iosvc, peer, old_fd) = {
            let mut inner = self.inner.borrow_mut();
            let peer = inner.peer.clone().ok_or(SocketError::NotConnected)?;
            (Rc::clone(&inner.iosvc), peer, inner.fd.take())
        };

        if let Some(fd) = old_fd {
            iosvc.remove_job(fd.as_raw_fd(), IoOp::Read);
            iosvc.remove_job(fd.as_raw_fd(), IoOp::Write);
        }

        let fd = Self::open_socket()?;
        let raw = fd.as_raw_fd();
        let addr = UnixAddr::new(&peer).map_err(|e| SocketError::syscall("sockaddr", e))?;
        let result = connect(raw, &addr);

        let mut inner = self.inner.borrow_mut();
        inner.read.reset();
        inner.write.reset();
        inner.read_cb = None;
        inner.write_cb = None;
        inner.eof = false;

        match result {
            Ok(()) | Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {
                inner.fd = Some(fd);
                debug!(peer = %peer.display(), "reconnected");
                Ok(())
            }
            Err(errno) => Err(SocketError::syscall("connect", errno)),
        }
    }

    /// Copies `data` into the write task and registers a persistent WRITE
    /// job; rejects an overlapping send with [`SocketError::Busy`].
    pub fn send(&self, data: &[u8], writer: ClientCompletionFn) -> Result<(), SocketError> {
        let (iosvc, raw) = {
            let mut inner = self.inner.borrow_mut();
            let raw = inner
                .fd
                .as_ref()
                .map(|fd| fd.as_raw_fd())
                .ok_or(SocketError::NotConnected)?;
            if inner.write.active {
                return Err(SocketError::Busy(IoOp::Write));
            }

            inner.write.buf.realloc(data.len());
            inner.write.buf.bytes_mut()[..data.len()].copy_from_slice(data);
            inner.write.progress = 0;
            inner.write.active = true;
            inner.write_cb = Some(writer);
            (Rc::clone(&inner.iosvc), raw)
        };

        let client = self.clone();
        iosvc.post_job(
            raw,
            IoOp::Write,
            JobMode::Persistent,
            Box::new(move |_, _| client.on_writable()),
        );

        Ok(())
    }

    /// Grows the read task by `size` bytes past the buffer's offset and
    /// registers a persistent READ job; rejects an overlapping recv with
    /// [`SocketError::Busy`].
    pub fn recv(&self, size: usize, reader: ClientCompletionFn) -> Result<(), SocketError> {
        let (iosvc, raw) = {
            let mut inner = self.inner.borrow_mut();
            let raw = inner
                .fd
                .as_ref()
                .map(|fd| fd.as_raw_fd())
                .ok_or(SocketError::NotConnected)?;
            if inner.read.active {
                return Err(SocketError::Busy(IoOp::Read));
            }

            let append_at = inner.read.buf.user_size();
            inner.read.buf.set_offset(append_at);
            inner.read.buf.realloc(append_at + size);
            inner.read.progress = 0;
            inner.read.active = true;
            inner.read_cb = Some(reader);
            (Rc::clone(&inner.iosvc), raw)
        };

        let client = self.clone();
        iosvc.post_job(
            raw,
            IoOp::Read,
            JobMode::Persistent,
            Box::new(move |_, _| client.on_readable()),
        );

        Ok(())
    }

    fn on_writable(&self) {
        let (outcome, raw) = {
            let mut inner = self.inner.borrow_mut();
            let Some(raw) = inner.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            let inner = &mut *inner;
            (drive_send(raw, &mut inner.write), raw)
        };

        let err = match outcome {
            DriveOutcome::Pending => return,
            DriveOutcome::Complete(err) | DriveOutcome::Eof(err) => err,
        };

        let (iosvc, cb) = {
            let mut inner = self.inner.borrow_mut();
            inner.write.active = false;
            (Rc::clone(&inner.iosvc), inner.write_cb.take())
        };

        iosvc.remove_job(raw, IoOp::Write);
        if let Some(mut cb) = cb {
            cb(self, Completion { err, eof: false });
        }
    }

    fn on_readable(&self) {
        let (outcome, raw) = {
            let mut inner = self.inner.borrow_mut();
            let Some(raw) = inner.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            let inner = &mut *inner;
            (drive_recv(raw, &mut inner.read), raw)
        };

        let (err, eof) = match outcome {
            DriveOutcome::Pending => return,
            DriveOutcome::Complete(err) => (err, false),
            DriveOutcome::Eof(err) => (err, true),
        };

        let (iosvc, cb) = {
            let mut inner = self.inner.borrow_mut();
            inner.eof = eof;
            inner.read.active = false;
            (Rc::clone(&inner.iosvc), inner.read_cb.take())
        };

        iosvc.remove_job(raw, IoOp::Read);
        if let Some(mut cb) = cb {
            cb(self, Completion { err, eof });
        }
    }

    pub fn read_active(&self) -> bool {
        self.inner.borrow().read.active
    }

    pub fn eof(&self) -> bool {
        self.inner.borrow().eof
    }

    pub fn peer_path(&self) -> Option<PathBuf> {
        self.inner.borrow().peer.clone()
    }

    /// Borrows the accumulated read bytes.
    pub fn with_read_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.borrow().read.buf.bytes())
    }

    pub fn read_buf_len(&self) -> usize {
        self.inner.borrow().read.buf.user_size()
    }

    pub fn reset_read_buffer(&self) {
        self.inner.borrow_mut().read.reset();
    }

    pub fn reset_write_buffer(&self) {
        self.inner.borrow_mut().write.reset();
    }

    /// Best-effort teardown: deregisters both jobs before the fd is closed
    /// and drops every stored callback. No callback fires afterwards.
    pub fn deinit(&self) {
        let (iosvc, fd) = {
            let mut inner = self.inner.borrow_mut();
            inner.read_cb = None;
            inner.write_cb = None;
            inner.pending_connector = None;
            inner.read.reset();
            inner.write.reset();
            (Rc::clone(&inner.iosvc), inner.fd.take())
        };

        if let Some(fd) = fd {
            let raw = fd.as_raw_fd();
            iosvc.remove_job(raw, IoOp::Read);
            iosvc.remove_job(raw, IoOp::Write);
            let _ = nix::sys::socket::shutdown(raw, nix::sys::socket::Shutdown::Both);
        }
    }
}
