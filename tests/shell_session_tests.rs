//! Full-shell sessions: input arrives on a socketpair standing in for
//! stdin, the shell runs to end-of-input on its own service.

use drvsh::config::ShellConfig;
use drvsh::io_service::IoService;
use drvsh::registry::ExitReason;
use drvsh::shell::Shell;
use std::cell::RefCell;
use std::io::Write;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

#[derive(Clone, Default)]
struct SharedOut(Rc<RefCell<Vec<u8>>>);

impl SharedOut {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

const HELP_MSG: &str = "Commands:\n\
list --- list all drivers\n\
help --- print this message\n\
cmd drv slot drv_cmd ... --- send command drv_cmd to driver drv at slot with arguments\n";

fn run_session(base: &std::path::Path, input: &[u8]) -> (ExitReason, String) {
    let (mut tx, rx) = UnixStream::pair().unwrap();
    tx.write_all(input).unwrap();
    tx.shutdown(Shutdown::Write).unwrap();

    let out = SharedOut::default();
    let iosvc = Rc::new(IoService::new());
    let config = ShellConfig {
        base_dir: base.to_path_buf(),
        prompt: "> ".to_string(),
    };
    let mut shell = Shell::new(iosvc, config, rx.as_raw_fd(), Box::new(out.clone()));
    let reason = shell.run().unwrap();
    drop(shell);

    (reason, out.contents())
}

#[test]
fn test_session_help_then_eof() {
    let dir = tempfile::tempdir().unwrap();
    let (reason, output) = run_session(dir.path(), b"help\n");

    assert_eq!(reason, ExitReason::InputEof);
    assert_eq!(output, format!("> {}> ", HELP_MSG));
}

#[test]
fn test_session_unknown_and_malformed_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (reason, output) =
        run_session(dir.path(), b"bogus x\ncmd onlydriver\nlist\n");

    assert_eq!(reason, ExitReason::InputEof);
    // prompt, invalid, invalid, empty list, each followed by a prompt
    assert_eq!(output, "> Invalid command\n> Invalid command\n> > ");
}

#[test]
fn test_session_splits_coalesced_lines() {
    let dir = tempfile::tempdir().unwrap();
    // Both lines land in one readiness wake; the newline scan must split
    // them into two commands.
    let (reason, output) = run_session(dir.path(), b"help\nhelp\n");

    assert_eq!(reason, ExitReason::InputEof);
    assert_eq!(output, format!("> {0}> {0}> ", HELP_MSG));
}

#[test]
fn test_base_dir_is_created_private() {
    let parent = tempfile::tempdir().unwrap();
    let base = parent.path().join("sockets");

    let (reason, _output) = run_session(&base, b"");

    assert_eq!(reason, ExitReason::InputEof);
    let mode = std::fs::metadata(&base).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
}
