//! UNIX-domain socket server with a keyed connection table.
//!
//! The listening socket carries a persistent READ job (the acceptor). Each
//! accepted connection lands in a `fd → Conn` map; upper layers refer to
//! connections by that fd key, a non-owning handle invalidated by
//! `close_connection`.

use super::{
    drive_recv, drive_send, Completion, DriveOutcome, SocketError, TaskState, BACKLOG,
};
use crate::io_service::{IoOp, IoService, JobMode};
use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Hook invoked for every accepted connection. Returning `false` makes the
/// server close the connection immediately.
pub type AcceptorFn = Box<dyn FnMut(&Server, RawFd) -> bool>;

/// Completion callback of an asynchronous send or receive.
pub type CompletionFn = Box<dyn FnMut(&Server, RawFd, Completion)>;

struct Conn {
    fd: OwnedFd,
    eof: bool,
    read: TaskState,
    read_cb: Option<CompletionFn>,
    write: TaskState,
    write_cb: Option<CompletionFn>,
}

struct Inner {
    iosvc: Rc<IoService>,
    fd: OwnedFd,
    path: PathBuf,
    connections: HashMap<RawFd, Conn>,
    acceptor: Option<AcceptorFn>,
    closed: bool,
}

/// Cheaply clonable handle; job callbacks capture clones of it, the way the
/// C passed the server as callback context. `close` is the deterministic
/// teardown and removes every I/O job before any fd is released.
#[derive(Clone)]
pub struct Server {
    inner: Rc<RefCell<Inner>>,
}

impl Server {
    /// Creates the socket node at `path` (replacing a stale one) and binds
    /// a non-blocking listener to it.
    pub fn bind(iosvc: Rc<IoService>, path: &Path) -> Result<Self, SocketError> {
        if path.exists() {
            let _ = fs::remove_file(path);
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| SocketError::syscall("socket", e))?;

        let addr = UnixAddr::new(path).map_err(|e| SocketError::syscall("sockaddr", e))?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| SocketError::syscall("bind", e))?;

        // Owner read/write only, like the directory that carries it.
        if let Ok(meta) = fs::metadata(path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = fs::set_permissions(path, perms);
        }

        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                iosvc,
                fd,
                path: path.to_path_buf(),
                connections: HashMap::new(),
                acceptor: None,
                closed: false,
            })),
        })
    }

    /// Starts listening (backlog 50) and registers the acceptor as a
    /// persistent READ job on the listening socket.
    pub fn listen(&self, acceptor: AcceptorFn) -> Result<(), SocketError> {
        let (iosvc, listen_fd) = {
            let mut inner = self.inner.borrow_mut();
            inner.acceptor = Some(acceptor);

            let backlog = Backlog::new(BACKLOG).unwrap_or(Backlog::MAXCONN);
            listen(&inner.fd, backlog).map_err(|e| SocketError::syscall("listen", e))?;

            (Rc::clone(&inner.iosvc), inner.fd.as_raw_fd())
        };

        let server = self.clone();
        iosvc.post_job(
            listen_fd,
            IoOp::Read,
            JobMode::Persistent,
            Box::new(move |_, _| server.on_acceptable()),
        );

        Ok(())
    }

    fn on_acceptable(&self) {
        let conn_fd = {
            let inner = self.inner.borrow();
            match accept4(
                inner.fd.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => fd,
                Err(Errno::EAGAIN) => return,
                Err(errno) => {
                    error!(%errno, "can't accept connection");
                    return;
                }
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.connections.insert(
                conn_fd,
                Conn {
                    fd: unsafe { OwnedFd::from_raw_fd(conn_fd) },
                    eof: false,
                    read: TaskState::new(),
                    read_cb: None,
                    write: TaskState::new(),
                    write_cb: None,
                },
            );
        }
        debug!(fd = conn_fd, "connection accepted");

        // The hook may start I/O on the new connection, so it runs with the
        // table unborrowed.
        let hook = self.inner.borrow_mut().acceptor.take();
        if let Some(mut hook) = hook {
            let keep = hook(self, conn_fd);
            let mut inner = self.inner.borrow_mut();
            if inner.acceptor.is_none() {
                inner.acceptor = Some(hook);
            }
            drop(inner);
            if !keep {
                self.close_connection(conn_fd);
            }
        }
    }

    /// Copies `data` into the connection's write task and registers a
    /// persistent WRITE job. `writer` fires once everything is sent or on
    /// the first hard error.
    ///
    /// A send while the previous one is still in flight is rejected with
    /// [`SocketError::Busy`].
    pub fn send(
        &self,
        conn: RawFd,
        data: &[u8],
        writer: CompletionFn,
    ) -> Result<(), SocketError> {
        let iosvc = {
            let mut inner = self.inner.borrow_mut();
            let iosvc = Rc::clone(&inner.iosvc);
            let c = inner
                .connections
                .get_mut(&conn)
                .ok_or(SocketError::UnknownConnection(conn))?;
            if c.write.active {
                return Err(SocketError::Busy(IoOp::Write));
            }

            c.write.buf.realloc(data.len());
            c.write.buf.bytes_mut()[..data.len()].copy_from_slice(data);
            c.write.progress = 0;
            c.write.active = true;
            c.write_cb = Some(writer);
            iosvc
        };

        let server = self.clone();
        iosvc.post_job(
            conn,
            IoOp::Write,
            JobMode::Persistent,
            Box::new(move |fd, _| server.on_writable(fd)),
        );

        Ok(())
    }

    /// Grows the connection's read task by `size` bytes past the buffer's
    /// current offset and registers a persistent READ job. `reader` fires
    /// when all bytes arrived, on EOF, or on the first hard error.
    ///
    /// A recv while the previous one is still in flight is rejected with
    /// [`SocketError::Busy`].
    pub fn recv(
        &self,
        conn: RawFd,
        size: usize,
        reader: CompletionFn,
    ) -> Result<(), SocketError> {
        let iosvc = {
            let mut inner = self.inner.borrow_mut();
            let iosvc = Rc::clone(&inner.iosvc);
            let c = inner
                .connections
                .get_mut(&conn)
                .ok_or(SocketError::UnknownConnection(conn))?;
            if c.read.active {
                return Err(SocketError::Busy(IoOp::Read));
            }

            let append_at = c.read.buf.user_size();
            c.read.buf.set_offset(append_at);
            c.read.buf.realloc(append_at + size);
            c.read.progress = 0;
            c.read.active = true;
            c.read_cb = Some(reader);
            iosvc
        };

        let server = self.clone();
        iosvc.post_job(
            conn,
            IoOp::Read,
            JobMode::Persistent,
            Box::new(move |fd, _| server.on_readable(fd)),
        );

        Ok(())
    }

    fn on_writable(&self, conn: RawFd) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let Some(c) = inner.connections.get_mut(&conn) else {
                return;
            };
            drive_send(c.fd.as_raw_fd(), &mut c.write)
        };

        let err = match outcome {
            DriveOutcome::Pending => return,
            DriveOutcome::Complete(err) | DriveOutcome::Eof(err) => err,
        };

        let (iosvc, cb) = {
            let mut inner = self.inner.borrow_mut();
            let iosvc = Rc::clone(&inner.iosvc);
            let cb = inner
                .connections
                .get_mut(&conn)
                .and_then(|c| {
                    c.write.active = false;
                    c.write_cb.take()
                });
            (iosvc, cb)
        };

        iosvc.remove_job(conn, IoOp::Write);
        if let Some(mut cb) = cb {
            cb(self, conn, Completion { err, eof: false });
        }
    }

    fn on_readable(&self, conn: RawFd) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let Some(c) = inner.connections.get_mut(&conn) else {
                return;
            };
            drive_recv(c.fd.as_raw_fd(), &mut c.read)
        };

        let (err, eof) = match outcome {
            DriveOutcome::Pending => return,
            DriveOutcome::Complete(err) => (err, false),
            DriveOutcome::Eof(err) => (err, true),
        };

        let (iosvc, cb) = {
            let mut inner = self.inner.borrow_mut();
            let iosvc = Rc::clone(&inner.iosvc);
            let cb = inner.connections.get_mut(&conn).and_then(|c| {
                c.eof = eof;
                c.read.active = false;
                c.read_cb.take()
            });
            (iosvc, cb)
        };

        iosvc.remove_job(conn, IoOp::Read);
        if let Some(mut cb) = cb {
            cb(self, conn, Completion { err, eof });
        }
    }

    /// Borrows the connection's accumulated read bytes.
    pub fn with_read_buf<R>(
        &self,
        conn: RawFd,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, SocketError> {
        let inner = self.inner.borrow();
        let c = inner
            .connections
            .get(&conn)
            .ok_or(SocketError::UnknownConnection(conn))?;
        Ok(f(c.read.buf.bytes()))
    }

    /// Releases the connection's read-task payload (next recv starts at
    /// offset zero).
    pub fn reset_read_buffer(&self, conn: RawFd) {
        if let Some(c) = self.inner.borrow_mut().connections.get_mut(&conn) {
            c.read.reset();
        }
    }

    pub fn reset_write_buffer(&self, conn: RawFd) {
        if let Some(c) = self.inner.borrow_mut().connections.get_mut(&conn) {
            c.write.reset();
        }
    }

    /// Deregisters both jobs, shuts the socket down and closes it. No
    /// callback fires for the connection after this returns.
    pub fn close_connection(&self, conn: RawFd) {
        let removed = self.inner.borrow_mut().connections.remove(&conn);
        let Some(c) = removed else { return };

        let iosvc = Rc::clone(&self.inner.borrow().iosvc);
        iosvc.remove_job(conn, IoOp::Read);
        iosvc.remove_job(conn, IoOp::Write);

        let _ = nix::sys::socket::shutdown(c.fd.as_raw_fd(), nix::sys::socket::Shutdown::Both);
        drop(c);
        debug!(fd = conn, "connection closed");
    }

    pub fn connection_count(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    pub fn local_path(&self) -> PathBuf {
        self.inner.borrow().path.clone()
    }

    /// Tears the server down: every connection is closed, the acceptor job
    /// removed, and the socket node unlinked.
    pub fn close(&self) {
        let conn_fds: Vec<RawFd> = {
            let inner = self.inner.borrow();
            if inner.closed {
                return;
            }
            inner.connections.keys().copied().collect()
        };

        for fd in conn_fds {
            self.close_connection(fd);
        }

        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.acceptor = None;
        let iosvc = Rc::clone(&inner.iosvc);
        let listen_fd = inner.fd.as_raw_fd();
        let path = inner.path.clone();
        drop(inner);

        iosvc.remove_job(listen_fd, IoOp::Read);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "can't unlink server socket");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
