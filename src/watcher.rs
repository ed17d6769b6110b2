//! inotify watch over the driver socket directory.
//!
//! One readiness wake drains every pending event byte (FIONREAD-bounded,
//! `EINTR` retried); the kernel's record order is preserved. Only the three
//! masks the registry cares about become logical events — everything else
//! (including the `IN_IGNORED` the kernel emits when the watch dies) is
//! skipped.

use crate::io_service::fionread;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// Logical directory event, in kernel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEvent {
    Created(OsString),
    Deleted(OsString),
    /// The watched directory itself was removed.
    SelfDeleted,
}

/// Size of the fixed part of a kernel `inotify_event` record:
/// `wd: i32, mask: u32, cookie: u32, len: u32`.
const EVENT_HEADER_LEN: usize = 16;

pub struct DirWatcher {
    fd: OwnedFd,
    wd: Option<i32>,
}

impl DirWatcher {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            wd: None,
        })
    }

    /// Registers the watch: create/delete of directory entries plus
    /// self-delete, with `EXCL_UNLINK` (ignore unlinked-but-open nodes) and
    /// `ONLYDIR` (refuse to watch a non-directory).
    pub fn watch(&mut self, path: &Path) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mask = libc::IN_CREATE
            | libc::IN_DELETE
            | libc::IN_DELETE_SELF
            | libc::IN_EXCL_UNLINK
            | libc::IN_ONLYDIR;

        let wd = unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), mask)
        };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }

        self.wd = Some(wd);
        debug!(path = %path.display(), wd, "watching directory");
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Reads and parses everything the kernel has queued. Returns the
    /// events in order; an empty vector on a spurious wake.
    ///
    /// A short read after the kernel reported pending bytes is an error —
    /// the caller treats it as fatal, because dropping events desynchronizes
    /// the registry from the directory for good.
    pub fn drain(&self) -> io::Result<Vec<DirEvent>> {
        let pending = fionread(self.fd.as_raw_fd())?;
        if pending == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; pending];
        let mut filled = 0;
        while filled < pending {
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf[filled..].as_mut_ptr().cast(),
                    pending - filled,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            filled += rc as usize;
        }

        Ok(parse_events(&buf))
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        if let Some(wd) = self.wd {
            unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), wd) };
        }
    }
}

fn parse_events(buf: &[u8]) -> Vec<DirEvent> {
    let mut events = Vec::new();
    let mut at = 0;

    while at + EVENT_HEADER_LEN <= buf.len() {
        let mask = u32_at(buf, at + 4);
        let name_len = u32_at(buf, at + 12) as usize;
        let record_end = at + EVENT_HEADER_LEN + name_len;
        if record_end > buf.len() {
            break;
        }

        // The name field is NUL-padded to the record boundary.
        let raw_name = &buf[at + EVENT_HEADER_LEN..record_end];
        let name_end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = || OsStr::from_bytes(&raw_name[..name_end]).to_os_string();

        if mask & libc::IN_CREATE as u32 != 0 {
            events.push(DirEvent::Created(name()));
        }
        if mask & libc::IN_DELETE as u32 != 0 {
            events.push(DirEvent::Deleted(name()));
        }
        if mask & libc::IN_DELETE_SELF as u32 != 0 {
            events.push(DirEvent::SelfDeleted);
        }

        at = record_end;
    }

    events
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn drain_until<F: Fn(&[DirEvent]) -> bool>(w: &DirWatcher, done: F) -> Vec<DirEvent> {
        let mut all = Vec::new();
        for _ in 0..100 {
            all.extend(w.drain().unwrap());
            if done(&all) {
                return all;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("expected events did not arrive: {:?}", all);
    }

    #[test]
    fn test_create_and_delete_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = DirWatcher::new().unwrap();
        w.watch(dir.path()).unwrap();

        let file = dir.path().join("probe.0.drv");
        fs::write(&file, b"").unwrap();
        let events = drain_until(&w, |ev| !ev.is_empty());
        assert_eq!(
            events[0],
            DirEvent::Created(OsString::from("probe.0.drv"))
        );

        fs::remove_file(&file).unwrap();
        let events = drain_until(&w, |ev| {
            ev.contains(&DirEvent::Deleted(OsString::from("probe.0.drv")))
        });
        assert!(events.contains(&DirEvent::Deleted(OsString::from("probe.0.drv"))));
    }

    #[test]
    fn test_self_delete_event() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("watched");
        fs::create_dir(&dir).unwrap();

        let mut w = DirWatcher::new().unwrap();
        w.watch(&dir).unwrap();

        fs::remove_dir(&dir).unwrap();
        let events = drain_until(&w, |ev| ev.contains(&DirEvent::SelfDeleted));
        assert!(events.contains(&DirEvent::SelfDeleted));
    }

    #[test]
    fn test_spurious_drain_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = DirWatcher::new().unwrap();
        w.watch(dir.path()).unwrap();
        assert!(w.drain().unwrap().is_empty());
    }
}
