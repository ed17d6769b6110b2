//! Interactive frontend.
//!
//! stdin is just another file descriptor on the I/O service: a persistent
//! READ job assembles lines in a buffer (FIONREAD tells how much to pull,
//! the buffer offset is the newline scan cursor) and every complete line is
//! tokenized into `list` / `help` / `cmd drv slot drv_cmd args…`. Zero
//! pending bytes on readable stdin is end of input and stops the service.

use crate::buffer::{Buffer, ShrinkPolicy};
use crate::config::ShellConfig;
use crate::io_service::{fionread, IoOp, IoService, JobMode};
use crate::protocol::MAX_ARGUMENT_LEN;
use crate::registry::{self, ExitReason, Registry};
use crate::watcher::DirWatcher;
use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::rc::Rc;
use tracing::{error, warn};

pub struct Shell {
    registry: Rc<RefCell<Registry>>,
    iosvc: Rc<IoService>,
    input: Rc<RefCell<Buffer>>,
    input_fd: RawFd,
    watcher: Option<Rc<DirWatcher>>,
}

impl Shell {
    pub fn new(
        iosvc: Rc<IoService>,
        config: ShellConfig,
        input_fd: RawFd,
        out: Box<dyn Write>,
    ) -> Self {
        let registry = Registry::new(
            Rc::clone(&iosvc),
            config.base_dir,
            out,
            config.prompt,
        );

        Self {
            registry: Rc::new(RefCell::new(registry)),
            iosvc,
            input: Rc::new(RefCell::new(Buffer::new(0, ShrinkPolicy::NonShrinkable))),
            input_fd,
            watcher: None,
        }
    }

    pub fn registry(&self) -> &Rc<RefCell<Registry>> {
        &self.registry
    }

    /// Sets up the base directory, discovery and input, then runs the I/O
    /// service until end of input or base-directory self-delete.
    pub fn run(&mut self) -> Result<ExitReason> {
        let base = self.registry.borrow().base_dir().clone();
        ensure_base_dir(&base)?;

        let mut watcher = DirWatcher::new().context("can't create directory watch")?;
        watcher
            .watch(&base)
            .with_context(|| format!("can't watch {}", base.display()))?;
        let watcher = Rc::new(watcher);
        self.watcher = Some(Rc::clone(&watcher));

        self.registry.borrow_mut().running = true;

        registry::bootstrap(&self.registry)?;
        self.registry.borrow_mut().finish_cmd();

        registry::install_watcher_job(&self.registry, watcher);
        self.install_input_job();

        self.iosvc.run().context("readiness loop failed")?;

        let mut registry = self.registry.borrow_mut();
        if let Some(fault) = registry.take_fault() {
            return Err(fault);
        }

        Ok(registry.exit_reason().unwrap_or(ExitReason::InputEof))
    }

    fn install_input_job(&self) {
        let reg = Rc::clone(&self.registry);
        let input = Rc::clone(&self.input);
        self.iosvc.post_job(
            self.input_fd,
            IoOp::Read,
            JobMode::Persistent,
            Box::new(move |fd, _| on_input(fd, &reg, &input)),
        );
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.iosvc.remove_job(self.input_fd, IoOp::Read);
        if let Some(watcher) = self.watcher.take() {
            self.iosvc.remove_job(watcher.as_raw_fd(), IoOp::Read);
        }
        self.registry.borrow_mut().purge();
    }
}

fn ensure_base_dir(base: &Path) -> Result<()> {
    match fs::metadata(base) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => bail!("{} exists and is not a directory", base.display()),
        Err(_) => {
            fs::create_dir(base)
                .with_context(|| format!("can't create base directory {}", base.display()))?;
            let mut perms = fs::metadata(base)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(base, perms)?;
            Ok(())
        }
    }
}

fn on_input(fd: RawFd, reg: &Rc<RefCell<Registry>>, input: &Rc<RefCell<Buffer>>) {
    let pending = match fionread(fd) {
        Ok(n) => n,
        Err(err) => {
            error!(%err, "can't FIONREAD on input");
            reg.borrow_mut()
                .set_fault(anyhow::Error::new(err).context("can't FIONREAD on input"));
            return;
        }
    };

    if pending == 0 {
        reg.borrow().iosvc().stop(false);
        return;
    }

    {
        let mut buf = input.borrow_mut();
        let old = buf.user_size();
        buf.realloc(old + pending);

        let mut filled = 0;
        while filled < pending {
            let rc = unsafe {
                libc::read(
                    fd,
                    buf.bytes_mut()[old + filled..].as_mut_ptr().cast(),
                    pending - filled,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!(%err, "can't read input");
                buf.realloc(old + filled);
                drop(buf);
                reg.borrow_mut()
                    .set_fault(anyhow::Error::new(err).context("can't read input"));
                return;
            }
            if rc == 0 {
                break;
            }
            filled += rc as usize;
        }
        if filled < pending {
            buf.realloc(old + filled);
        }
    }

    loop {
        let line = {
            let mut buf = input.borrow_mut();
            if !detect_newline(&mut buf) {
                break;
            }
            String::from_utf8_lossy(&buf.bytes()[..buf.offset()]).into_owned()
        };

        execute_line(reg, &line);

        let mut buf = input.borrow_mut();
        shift_past_newline(&mut buf);
        buf.set_offset(0);
    }
}

/// Advances the buffer offset to the next newline. A `false` return leaves
/// the offset parked at the end so the scan resumes where it left off once
/// more bytes arrive.
fn detect_newline(buf: &mut Buffer) -> bool {
    while buf.offset() < buf.user_size() {
        if buf.bytes()[buf.offset()] == b'\n' {
            return true;
        }
        buf.set_offset(buf.offset() + 1);
    }
    false
}

/// Drops the consumed line (bytes up to and including the newline at the
/// current offset) and moves the remainder to the front.
fn shift_past_newline(buf: &mut Buffer) {
    let consumed = buf.offset() + 1;
    let total = buf.user_size();
    buf.bytes_mut().copy_within(consumed..total, 0);
    buf.realloc(total - consumed);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineCommand {
    List,
    Help,
    Invalid,
    Cmd {
        drv: String,
        slot: u32,
        cmd: String,
        args: Vec<Vec<u8>>,
    },
}

/// Tokenizes one input line. Splitting is on single spaces, empty tokens
/// are dropped; anything that fails to resolve renders as invalid.
fn parse_line(line: &str) -> LineCommand {
    let mut tokens = line.split(' ').filter(|t| !t.is_empty());

    let Some(cmd) = tokens.next() else {
        warn!("invalid input: no command");
        return LineCommand::Invalid;
    };

    match cmd {
        "list" => LineCommand::List,
        "help" => LineCommand::Help,
        "cmd" => {
            let (Some(drv), Some(slot), Some(drv_cmd)) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                warn!(line, "invalid input");
                return LineCommand::Invalid;
            };

            let Ok(slot) = slot.parse::<u32>() else {
                warn!(slot, "slot is not a number");
                return LineCommand::Invalid;
            };

            let mut args = Vec::new();
            for token in tokens {
                if token.len() > MAX_ARGUMENT_LEN {
                    warn!(token, "too long argument");
                    return LineCommand::Invalid;
                }
                args.push(token.as_bytes().to_vec());
            }

            LineCommand::Cmd {
                drv: drv.to_string(),
                slot,
                cmd: drv_cmd.to_string(),
                args,
            }
        }
        _ => LineCommand::Invalid,
    }
}

fn execute_line(reg: &Rc<RefCell<Registry>>, line: &str) {
    match parse_line(line) {
        LineCommand::List => reg.borrow_mut().cmd_list(),
        LineCommand::Help => reg.borrow_mut().cmd_help(),
        LineCommand::Invalid => reg.borrow_mut().cmd_invalid(),
        LineCommand::Cmd {
            drv,
            slot,
            cmd,
            args,
        } => registry::dispatch(reg, &drv, slot, &cmd, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_builtins() {
        assert_eq!(parse_line("list"), LineCommand::List);
        assert_eq!(parse_line("help"), LineCommand::Help);
        assert_eq!(parse_line("  list  "), LineCommand::List);
        assert_eq!(parse_line(""), LineCommand::Invalid);
        assert_eq!(parse_line("bogus"), LineCommand::Invalid);
    }

    #[test]
    fn test_parse_line_cmd() {
        assert_eq!(
            parse_line("cmd printer 3 p hello world"),
            LineCommand::Cmd {
                drv: "printer".to_string(),
                slot: 3,
                cmd: "p".to_string(),
                args: vec![b"hello".to_vec(), b"world".to_vec()],
            }
        );
    }

    #[test]
    fn test_parse_line_cmd_requires_all_parts() {
        assert_eq!(parse_line("cmd"), LineCommand::Invalid);
        assert_eq!(parse_line("cmd printer"), LineCommand::Invalid);
        assert_eq!(parse_line("cmd printer 3"), LineCommand::Invalid);
        assert_eq!(parse_line("cmd printer three p"), LineCommand::Invalid);
    }

    #[test]
    fn test_parse_line_rejects_oversize_argument() {
        let line = format!("cmd printer 3 p {}", "a".repeat(MAX_ARGUMENT_LEN + 1));
        assert_eq!(parse_line(&line), LineCommand::Invalid);
    }

    #[test]
    fn test_newline_scan_resumes_at_offset() {
        let mut buf = Buffer::new(0, ShrinkPolicy::NonShrinkable);
        buf.realloc(5);
        buf.bytes_mut().copy_from_slice(b"hel\nx");

        assert!(detect_newline(&mut buf));
        assert_eq!(buf.offset(), 3);

        shift_past_newline(&mut buf);
        buf.set_offset(0);
        assert_eq!(buf.bytes(), b"x");

        // Partial line: the scan parks at the end and picks up from there.
        assert!(!detect_newline(&mut buf));
        assert_eq!(buf.offset(), 1);

        let old = buf.user_size();
        buf.realloc(old + 2);
        buf.bytes_mut()[old..].copy_from_slice(b"y\n");
        assert!(detect_newline(&mut buf));
        assert_eq!(buf.offset(), 2);
        assert_eq!(&buf.bytes()[..buf.offset()], b"xy");
    }
}
