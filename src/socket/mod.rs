//! Non-blocking UNIX-socket connection layer.
//!
//! The server and client share one asynchronous I/O contract: a `send`
//! copies the caller's bytes into the write task and registers a WRITE job;
//! a `recv` grows the read task's buffer by the requested length and
//! registers a READ job. The job handlers drain as much as the kernel
//! allows (`MSG_DONTWAIT | MSG_NOSIGNAL`, `EINTR` retried in place,
//! `EAGAIN` leaves the job registered) and, on completion, EOF or hard
//! error, deregister the job and fire the completion callback with an
//! errno snapshot taken right after the decisive syscall.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use crate::buffer::{Buffer, ShrinkPolicy};
use crate::io_service::{fionread, IoOp};
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use std::os::fd::RawFd;
use thiserror::Error;

/// Backlog used by every listening socket.
pub const BACKLOG: i32 = 50;

#[derive(Debug, Error)]
pub enum SocketError {
    /// An operation of the same direction is already in flight on this
    /// connection. Overlapping operations are rejected, never coalesced.
    #[error("{0:?} operation already in flight")]
    Busy(IoOp),

    #[error("no such connection: fd {0}")]
    UnknownConnection(RawFd),

    #[error("client is not connected")]
    NotConnected,

    #[error("{op}: {errno}")]
    Syscall { op: &'static str, errno: Errno },
}

impl SocketError {
    pub(crate) fn syscall(op: &'static str, errno: Errno) -> Self {
        Self::Syscall { op, errno }
    }
}

/// Outcome of an asynchronous operation, handed to completion callbacks.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Errno snapshot if the decisive syscall failed, `None` on success.
    pub err: Option<Errno>,
    /// The peer closed its end while we were reading.
    pub eof: bool,
}

impl Completion {
    pub fn ok(&self) -> bool {
        self.err.is_none() && !self.eof
    }
}

/// Data half of an asynchronous read or write task. The completion
/// callback lives beside it in the owning connection, typed per layer.
pub(crate) struct TaskState {
    pub buf: Buffer,
    /// Bytes already transferred by the current operation.
    pub progress: usize,
    pub active: bool,
}

impl TaskState {
    pub(crate) fn new() -> Self {
        Self {
            buf: Buffer::new(0, ShrinkPolicy::NonShrinkable),
            progress: 0,
            active: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buf.realloc(0);
        self.buf.set_offset(0);
        self.progress = 0;
        self.active = false;
    }
}

/// What a drive pass over a task concluded.
pub(crate) enum DriveOutcome {
    /// Kernel buffers are exhausted; keep the job registered.
    Pending,
    /// All requested bytes transferred, or a hard error occurred.
    Complete(Option<Errno>),
    /// End of stream observed while reading.
    Eof(Option<Errno>),
}

/// Pushes as much of the write task as the kernel accepts.
pub(crate) fn drive_send(fd: RawFd, task: &mut TaskState) -> DriveOutcome {
    let total = task.buf.user_size();

    loop {
        if task.progress >= total {
            return DriveOutcome::Complete(None);
        }

        match send(
            fd,
            &task.buf.bytes()[task.progress..total],
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        ) {
            Ok(n) => task.progress += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return DriveOutcome::Pending,
            Err(errno) => return DriveOutcome::Complete(Some(errno)),
        }
    }
}

/// Pulls pending bytes into the read task's region
/// `[offset + progress, user_size)`.
///
/// Zero bytes pending on a readable socket is end-of-stream.
pub(crate) fn drive_recv(fd: RawFd, task: &mut TaskState) -> DriveOutcome {
    let pending = match fionread(fd) {
        Ok(n) => n,
        Err(err) => {
            let errno = err
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO);
            return DriveOutcome::Complete(Some(errno));
        }
    };

    if pending == 0 {
        return DriveOutcome::Eof(None);
    }

    let start = task.buf.offset();
    loop {
        let at = start + task.progress;
        let remaining = task.buf.user_size().saturating_sub(at);
        if remaining == 0 {
            return DriveOutcome::Complete(None);
        }

        let region = &mut task.buf.bytes_mut()[at..at + remaining];
        match recv(fd, region, MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => return DriveOutcome::Eof(None),
            Ok(n) => task.progress += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return DriveOutcome::Pending,
            Err(errno) => return DriveOutcome::Complete(Some(errno)),
        }
    }
}
