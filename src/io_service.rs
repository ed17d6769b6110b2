//! Single-threaded readiness multiplexor.
//!
//! The service owns a table of jobs keyed by `(fd, op)` and drives their
//! callbacks from a `poll(2)` loop. Registrations are either oneshot
//! (unregistered before the callback runs) or persistent (stay until
//! removed). Callbacks run one at a time on the calling thread and may
//! freely post, replace or remove jobs — including their own — and may stop
//! the service; such mutations take effect no later than the next tick.
//!
//! The service never owns a file descriptor; it only references them by
//! value. Whoever closes an fd is responsible for removing its jobs first.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

/// Direction of interest for a job registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    Read,
    Write,
}

/// Registration lifetime of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Removed by the service before the callback is invoked.
    Oneshot,
    /// Stays registered until `remove_job` is called.
    Persistent,
}

/// Job callback. Receives the fd and operation that became ready.
pub type JobFn = Box<dyn FnMut(RawFd, IoOp)>;

struct Job {
    mode: JobMode,
    run: JobFn,
}

/// Bookkeeping for the persistent job currently being invoked, so that
/// `remove_job`/`post_job` from inside its own callback win over the
/// service's re-arm.
struct InFlight {
    key: (RawFd, IoOp),
    removed: bool,
    replaced: bool,
}

struct Inner {
    jobs: HashMap<(RawFd, IoOp), Job>,
    in_flight: Option<InFlight>,
    /// `Some(drain)` once `stop` has been called.
    stop: Option<bool>,
}

/// Readiness loop over registered file descriptors.
///
/// Interior mutability lets job callbacks (which capture an `Rc` of the
/// service) re-enter the registration API; the job table is never borrowed
/// across a callback invocation.
pub struct IoService {
    inner: RefCell<Inner>,
}

impl IoService {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                jobs: HashMap::new(),
                in_flight: None,
                stop: None,
            }),
        }
    }

    /// Registers `run` for `(fd, op)`, replacing any existing registration
    /// for that key.
    pub fn post_job(&self, fd: RawFd, op: IoOp, mode: JobMode, run: JobFn) {
        let mut inner = self.inner.borrow_mut();
        if let Some(fl) = inner.in_flight.as_mut() {
            if fl.key == (fd, op) {
                fl.replaced = true;
            }
        }
        inner.jobs.insert((fd, op), Job { mode, run });
    }

    /// Unregisters `(fd, op)` if present. Legal from inside any callback,
    /// including the one being removed.
    pub fn remove_job(&self, fd: RawFd, op: IoOp) {
        let mut inner = self.inner.borrow_mut();
        if let Some(fl) = inner.in_flight.as_mut() {
            if fl.key == (fd, op) {
                fl.removed = true;
            }
        }
        inner.jobs.remove(&(fd, op));
    }

    pub fn has_job(&self, fd: RawFd, op: IoOp) -> bool {
        self.inner.borrow().jobs.contains_key(&(fd, op))
    }

    /// Requests termination of `run`. With `drain = true` the notifications
    /// already collected in the current tick are still delivered; with
    /// `drain = false` the loop breaks before the next callback.
    pub fn stop(&self, drain: bool) {
        self.inner.borrow_mut().stop = Some(drain);
    }

    pub fn stopped(&self) -> bool {
        self.inner.borrow().stop.is_some()
    }

    /// Runs the readiness loop until `stop` is observed or the job table
    /// becomes empty.
    pub fn run(&self) -> io::Result<()> {
        loop {
            {
                let inner = self.inner.borrow();
                if inner.stop.is_some() || inner.jobs.is_empty() {
                    break;
                }
            }
            self.poll_once(-1)?;
        }
        self.inner.borrow_mut().stop = None;
        Ok(())
    }

    /// One readiness tick: polls every registered fd (blocking at most
    /// `timeout_ms`, `-1` for no limit) and invokes each ready job at most
    /// once. Returns the number of callbacks dispatched.
    ///
    /// This is the unit `run` loops over; embedders with their own outer
    /// loop (and tests) pump the service through it.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<usize> {
        let interest: Vec<(RawFd, bool, bool)> = {
            let inner = self.inner.borrow();
            let mut per_fd: HashMap<RawFd, (bool, bool)> = HashMap::new();
            for (fd, op) in inner.jobs.keys() {
                let entry = per_fd.entry(*fd).or_insert((false, false));
                match op {
                    IoOp::Read => entry.0 = true,
                    IoOp::Write => entry.1 = true,
                }
            }
            per_fd.into_iter().map(|(fd, (r, w))| (fd, r, w)).collect()
        };

        if interest.is_empty() {
            return Ok(0);
        }

        let mut pollfds: Vec<libc::pollfd> = interest
            .iter()
            .map(|&(fd, r, w)| {
                let mut events: libc::c_short = 0;
                if r {
                    events |= libc::POLLIN;
                }
                if w {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let n = loop {
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            break rc;
        };

        if n == 0 {
            return Ok(0);
        }

        // Error conditions wake the registered callback too: the owning task
        // observes the failing syscall itself and reports it upstream.
        let exceptional = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        let mut ready: Vec<(RawFd, IoOp)> = Vec::new();
        for (pfd, &(fd, r, w)) in pollfds.iter().zip(interest.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            if r && pfd.revents & (libc::POLLIN | exceptional) != 0 {
                ready.push((fd, IoOp::Read));
            }
            if w && pfd.revents & (libc::POLLOUT | exceptional) != 0 {
                ready.push((fd, IoOp::Write));
            }
        }

        let mut dispatched = 0;
        for (fd, op) in ready {
            {
                let inner = self.inner.borrow();
                if inner.stop == Some(false) {
                    break;
                }
            }

            let key = (fd, op);
            let job = {
                let mut inner = self.inner.borrow_mut();
                match inner.jobs.remove(&key) {
                    Some(job) => {
                        if job.mode == JobMode::Persistent {
                            inner.in_flight = Some(InFlight {
                                key,
                                removed: false,
                                replaced: false,
                            });
                        }
                        Some(job)
                    }
                    // Unregistered by an earlier callback in this tick.
                    None => None,
                }
            };

            let Some(mut job) = job else { continue };
            (job.run)(fd, op);
            dispatched += 1;

            if job.mode == JobMode::Persistent {
                let mut inner = self.inner.borrow_mut();
                if let Some(fl) = inner.in_flight.take() {
                    if !fl.removed && !fl.replaced {
                        inner.jobs.insert(key, job);
                    }
                }
            }
        }

        Ok(dispatched)
    }
}

impl Default for IoService {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes currently readable on `fd` without blocking.
///
/// Zero on a descriptor `poll` reported readable means end-of-stream for
/// sockets and pipes; the connection layer and the stdin reader both rely
/// on that.
pub fn fionread(fd: RawFd) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut pending) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending as usize)
}
