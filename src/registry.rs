//! Driver registry and protocol engine.
//!
//! Directory events create and destroy driver records; each record owns a
//! UNIX-socket client that the engine drives through the wire protocol:
//! read a signature byte, then the rest of a `DRV_INFO` or `DRV_RESPONSE`
//! in as many passes as the length headers demand. User commands enter
//! through `dispatch`, which builds a `DRV_COMMAND` frame and re-arms the
//! signature read from the writer completion.
//!
//! The registry is keyed by `(name, slot)`; two sockets resolving to the
//! same key mean the directory lied to us, and that is fatal.

use crate::io_service::{IoOp, IoService, JobMode};
use crate::protocol::{self, CommandDescriptor};
use crate::socket::{client::ConnectorFn, Client, Completion};
use crate::watcher::{DirEvent, DirWatcher};
use anyhow::Context;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, warn};

const HELP_MSG: &str = "Commands:\n\
list --- list all drivers\n\
help --- print this message\n\
cmd drv slot drv_cmd ... --- send command drv_cmd to driver drv at slot with arguments\n";

const INVALID_MSG: &str = "Invalid command\n";

/// Why the shell stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Orderly end of input.
    InputEof,
    /// The base directory itself was deleted.
    BaseDirDeleted,
}

impl ExitReason {
    pub fn exit_code(self) -> u8 {
        match self {
            ExitReason::InputEof => 0,
            ExitReason::BaseDirDeleted => 2,
        }
    }
}

pub type DriverKey = (String, u32);

/// Which part of a message the next read completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStage {
    Signature,
    Info,
    Response,
}

pub struct DriverRecord {
    pub name: String,
    pub slot: u32,
    pub client: Client,
    pub commands: Vec<CommandDescriptor>,
    stage: ReadStage,
}

pub struct Registry {
    iosvc: Rc<IoService>,
    base_dir: PathBuf,
    drivers: BTreeMap<DriverKey, DriverRecord>,
    out: Box<dyn Write>,
    prompt: String,
    pub running: bool,
    exit: Option<ExitReason>,
    fault: Option<anyhow::Error>,
}

impl Registry {
    pub fn new(
        iosvc: Rc<IoService>,
        base_dir: PathBuf,
        out: Box<dyn Write>,
        prompt: String,
    ) -> Self {
        Self {
            iosvc,
            base_dir,
            drivers: BTreeMap::new(),
            out,
            prompt,
            running: false,
            exit: None,
            fault: None,
        }
    }

    pub fn iosvc(&self) -> &Rc<IoService> {
        &self.iosvc
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn driver(&self, name: &str, slot: u32) -> Option<&DriverRecord> {
        self.drivers.get(&(name.to_string(), slot))
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    pub fn set_exit(&mut self, reason: ExitReason) {
        self.exit = Some(reason);
    }

    /// Records an unrecoverable I/O failure. The service is stopped and the
    /// error resurfaces as the run's `Err` result — operational failures
    /// report through results, they don't abort.
    pub fn set_fault(&mut self, fault: anyhow::Error) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
        self.iosvc.stop(false);
    }

    pub fn take_fault(&mut self) -> Option<anyhow::Error> {
        self.fault.take()
    }

    fn print(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn print_bytes(&mut self, bytes: &[u8]) {
        let _ = self.out.write_all(bytes);
        let _ = self.out.flush();
    }

    /// Prints every known driver with its command table.
    pub fn cmd_list(&mut self) {
        let mut text = String::new();
        for record in self.drivers.values() {
            text.push_str(&format!(
                "\nDriver: {}\nSlot: {}\n",
                record.name, record.slot
            ));
            for command in &record.commands {
                text.push_str(&format!(
                    "{} <arity: {}> --- {}\n",
                    command.name, command.arity, command.descr
                ));
            }
        }
        self.print(&text);
        self.finish_cmd();
    }

    pub fn cmd_help(&mut self) {
        self.print(HELP_MSG);
        self.finish_cmd();
    }

    pub fn cmd_invalid(&mut self) {
        self.print(INVALID_MSG);
        self.finish_cmd();
    }

    /// Prints the prompt; every command path ends here.
    pub fn finish_cmd(&mut self) {
        let prompt = self.prompt.clone();
        self.print(&prompt);
    }

    /// Removes the driver announced by a delete event. Unknown names are
    /// only worth a warning — the event may concern a socket that never
    /// parsed, or one whose creation we refused.
    pub fn handle_deleted(&mut self, name: &OsStr) {
        let Some(name) = name.to_str() else { return };
        let Some((drv, slot)) = parse_socket_name(name) else {
            debug!(name, "deleted entry is not a driver socket name");
            return;
        };

        match self.drivers.remove(&(drv.clone(), slot)) {
            Some(record) => {
                record.client.deinit();
                debug!(driver = %drv, slot, "driver removed");
            }
            None => warn!(name, "socket name was not registered"),
        }
    }

    /// Base-directory self-delete: undrained stop, distinct exit code.
    pub fn on_self_deleted(&mut self) {
        warn!("base directory deleted; stopping without waiting for pending events");
        self.running = false;
        self.exit = Some(ExitReason::BaseDirDeleted);
        self.iosvc.stop(false);
    }

    /// Tears down every client. Called when the shell goes away.
    pub fn purge(&mut self) {
        for record in self.drivers.values() {
            record.client.deinit();
        }
        self.drivers.clear();
    }
}

/// Parses `<name>.<slot>.drv`: non-empty dot-free name, non-empty digit
/// slot, exact suffix. Anything else is not a driver socket.
pub fn parse_socket_name(name: &str) -> Option<(String, u32)> {
    let mut parts = name.splitn(3, '.');
    let drv = parts.next()?;
    let slot = parts.next()?;
    let suffix = parts.next()?;

    if drv.is_empty() || suffix != protocol::SOCKET_SUFFIX {
        return None;
    }
    if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let slot: u32 = slot.parse().ok()?;
    Some((drv.to_string(), slot))
}

fn is_unix_socket(path: &std::path::Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.file_type().is_socket(),
        Err(err) => {
            warn!(path = %path.display(), %err, "can't stat directory entry");
            false
        }
    }
}

/// A create event (or a bootstrap-scan hit): verify the node, register the
/// record, connect the client. A duplicate `(name, slot)` is fatal — the
/// filesystem is the authority on uniqueness, so two sockets with one
/// identity mean corrupted state.
pub fn on_created(reg: &Rc<RefCell<Registry>>, name: &OsStr) {
    let Some(name_str) = name.to_str() else { return };
    debug!(name = name_str, "created");

    let path = reg.borrow().base_dir.join(name);
    if !is_unix_socket(&path) {
        debug!(name = name_str, "not a UNIX socket; ignored");
        return;
    }

    let Some((drv, slot)) = parse_socket_name(name_str) else {
        debug!(name = name_str, "not a valid driver socket name; ignored");
        return;
    };

    let key: DriverKey = (drv.clone(), slot);
    if reg.borrow().drivers.contains_key(&key) {
        error!(driver = %drv, slot, "duplicate driver");
        panic!("duplicate driver: {} at slot {}", drv, slot);
    }

    let client = Client::new(Rc::clone(&reg.borrow().iosvc));
    reg.borrow_mut().drivers.insert(
        key.clone(),
        DriverRecord {
            name: drv.clone(),
            slot,
            client: client.clone(),
            commands: Vec::new(),
            stage: ReadStage::Signature,
        },
    );

    let reg2 = Rc::clone(reg);
    let connector: ConnectorFn = Box::new(move |cl: &Client| {
        cl.reset_read_buffer();
        cl.reset_write_buffer();
        arm_signature_read(&reg2, &key);
    });

    if let Err(err) = client.connect(&path, connector) {
        error!(driver = %drv, slot, %err, "can't connect to driver socket");
    }
}

/// Scans the base directory once and synthesises a create event for every
/// existing driver socket, in alphabetical order.
pub fn bootstrap(reg: &Rc<RefCell<Registry>>) -> anyhow::Result<()> {
    let base = reg.borrow().base_dir.clone();

    let mut names: Vec<std::ffi::OsString> = fs::read_dir(&base)
        .with_context(|| format!("can't scan base directory {}", base.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_type()
                .map(|t| t.is_socket())
                .unwrap_or(false)
        })
        .map(|entry| entry.file_name())
        .filter(|name| {
            name.to_str()
                .map(|s| parse_socket_name(s).is_some())
                .unwrap_or(false)
        })
        .collect();
    names.sort();

    for name in names {
        on_created(reg, &name);
    }

    Ok(())
}

/// Registers the persistent READ job that turns watcher readiness into
/// registry mutations. A drain failure is fatal: dropped events would
/// desynchronize the registry from the directory for good.
pub fn install_watcher_job(reg: &Rc<RefCell<Registry>>, watcher: Rc<DirWatcher>) {
    let iosvc = Rc::clone(&reg.borrow().iosvc);
    let reg2 = Rc::clone(reg);
    let fd = watcher.as_raw_fd();

    iosvc.post_job(
        fd,
        IoOp::Read,
        JobMode::Persistent,
        Box::new(move |_, _| {
            let events = match watcher.drain() {
                Ok(events) => events,
                Err(err) => {
                    error!(%err, "couldn't read directory event descriptions");
                    panic!("couldn't drain directory watch: {}", err);
                }
            };

            for event in events {
                if !reg2.borrow().running {
                    break;
                }
                match event {
                    DirEvent::Created(name) => on_created(&reg2, &name),
                    DirEvent::Deleted(name) => reg2.borrow_mut().handle_deleted(&name),
                    DirEvent::SelfDeleted => reg2.borrow_mut().on_self_deleted(),
                }
            }
        }),
    );
}

fn record_client(reg: &Rc<RefCell<Registry>>, key: &DriverKey) -> Option<Client> {
    reg.borrow().drivers.get(key).map(|r| r.client.clone())
}

fn set_stage(reg: &Rc<RefCell<Registry>>, key: &DriverKey, stage: ReadStage) {
    if let Some(record) = reg.borrow_mut().drivers.get_mut(key) {
        record.stage = stage;
    }
}

fn arm_recv(reg: &Rc<RefCell<Registry>>, key: &DriverKey, client: &Client, size: usize) {
    let reg2 = Rc::clone(reg);
    let key2 = key.clone();
    if let Err(err) = client.recv(
        size,
        Box::new(move |_cl, completion| on_client_read(&reg2, &key2, completion)),
    ) {
        warn!(driver = ?key, %err, "can't arm receive");
    }
}

fn arm_signature_read(reg: &Rc<RefCell<Registry>>, key: &DriverKey) {
    let Some(client) = record_client(reg, key) else { return };
    set_stage(reg, key, ReadStage::Signature);
    arm_recv(reg, key, &client, protocol::SIGNATURE_LEN);
}

/// Reconnect path shared by read errors and protocol violations. The
/// signature read is re-armed on success so the `DRV_INFO` a restarted
/// driver sends is observed.
fn reconnect_and_rearm(reg: &Rc<RefCell<Registry>>, key: &DriverKey, client: &Client) {
    match client.reconnect() {
        Ok(()) => arm_signature_read(reg, key),
        Err(err) => error!(driver = ?key, %err, "can't reconnect"),
    }
}

fn on_client_read(reg: &Rc<RefCell<Registry>>, key: &DriverKey, completion: Completion) {
    let Some(client) = record_client(reg, key) else { return };

    if let Some(errno) = completion.err {
        warn!(driver = ?key, %errno, "error on receive; reconnecting");
        reconnect_and_rearm(reg, key, &client);
        return;
    }

    if completion.eof {
        warn!(driver = ?key, "EOF from driver; possibly a delete will take place soon");
        return;
    }

    let Some(stage) = reg.borrow().drivers.get(key).map(|r| r.stage) else {
        return;
    };

    match stage {
        ReadStage::Signature => {
            let Some(signature) = client.with_read_buf(|b| b.first().copied()) else {
                return;
            };
            match signature {
                protocol::DRV_INFO => {
                    set_stage(reg, key, ReadStage::Info);
                    arm_recv(
                        reg,
                        key,
                        &client,
                        protocol::INFO_HEADER_LEN - protocol::SIGNATURE_LEN,
                    );
                }
                protocol::DRV_RESPONSE => {
                    set_stage(reg, key, ReadStage::Response);
                    arm_recv(
                        reg,
                        key,
                        &client,
                        protocol::RESPONSE_HEADER_LEN - protocol::SIGNATURE_LEN,
                    );
                }
                other => {
                    warn!(
                        driver = ?key,
                        signature = format_args!("{:#04x}", other),
                        "invalid signature; reconnecting"
                    );
                    reconnect_and_rearm(reg, key, &client);
                }
            }
        }

        ReadStage::Info => {
            let have = client.read_buf_len();
            let count = match client.with_read_buf(protocol::decode_info_count) {
                Ok(count) => count,
                Err(err) => {
                    warn!(driver = ?key, %err, "malformed driver info; reconnecting");
                    reconnect_and_rearm(reg, key, &client);
                    return;
                }
            };

            let need = protocol::info_required_len(count);
            if have < need {
                arm_recv(reg, key, &client, need - have);
                return;
            }

            match client.with_read_buf(protocol::decode_info) {
                Ok(commands) => {
                    debug!(driver = ?key, commands = commands.len(), "driver info received");
                    if let Some(record) = reg.borrow_mut().drivers.get_mut(key) {
                        record.commands = commands;
                    }
                    client.reset_read_buffer();
                    arm_signature_read(reg, key);
                }
                Err(err) => {
                    warn!(driver = ?key, %err, "malformed driver info; reconnecting");
                    reconnect_and_rearm(reg, key, &client);
                }
            }
        }

        ReadStage::Response => {
            let have = client.read_buf_len();
            let len = match client.with_read_buf(protocol::decode_response_len) {
                Ok(len) => len,
                Err(err) => {
                    warn!(driver = ?key, %err, "malformed driver response; reconnecting");
                    reconnect_and_rearm(reg, key, &client);
                    return;
                }
            };

            let need = protocol::response_required_len(len);
            if have < need {
                arm_recv(reg, key, &client, need - have);
                return;
            }

            match client.with_read_buf(|b| protocol::decode_response(b).map(|p| p.to_vec())) {
                Ok(payload) => {
                    {
                        let mut r = reg.borrow_mut();
                        r.print_bytes(&payload);
                        r.print("\n");
                        r.finish_cmd();
                    }
                    client.reset_read_buffer();
                    arm_signature_read(reg, key);
                }
                Err(err) => {
                    warn!(driver = ?key, %err, "malformed driver response; reconnecting");
                    reconnect_and_rearm(reg, key, &client);
                }
            }
        }
    }
}

/// Sends `cmd` with `args` to the driver at `(drv, slot)`.
///
/// Resolution failures — unknown driver, unknown command, more arguments
/// than the command's arity — render `Invalid command` and send nothing.
pub fn dispatch(
    reg: &Rc<RefCell<Registry>>,
    drv: &str,
    slot: u32,
    cmd: &str,
    args: Vec<Vec<u8>>,
) {
    let key: DriverKey = (drv.to_string(), slot);

    let resolved = {
        let reg_ref = reg.borrow();
        match reg_ref.drivers.get(&key) {
            None => {
                warn!(driver = drv, slot, "can't find driver");
                None
            }
            Some(record) => {
                match record.commands.iter().position(|c| c.name == cmd) {
                    None => {
                        warn!(driver = drv, slot, cmd, "couldn't find command");
                        None
                    }
                    Some(idx) if args.len() > record.commands[idx].arity as usize => {
                        warn!(
                            driver = drv,
                            slot, cmd, "too many arguments for the command supplied"
                        );
                        None
                    }
                    Some(idx) => Some((record.client.clone(), idx as u32)),
                }
            }
        }
    };

    let Some((client, cmd_idx)) = resolved else {
        reg.borrow_mut().cmd_invalid();
        return;
    };

    let frame = match protocol::encode_command(cmd_idx, &args) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(driver = drv, slot, %err, "can't encode command");
            reg.borrow_mut().cmd_invalid();
            return;
        }
    };

    let reg2 = Rc::clone(reg);
    let key2 = key.clone();
    if let Err(err) = client.send(
        &frame,
        Box::new(move |_cl, completion| on_command_written(&reg2, &key2, completion)),
    ) {
        warn!(driver = drv, slot, %err, "can't send command");
        reg.borrow_mut().cmd_invalid();
    }
}

fn on_command_written(reg: &Rc<RefCell<Registry>>, key: &DriverKey, completion: Completion) {
    let Some(client) = record_client(reg, key) else { return };
    client.reset_write_buffer();

    if let Some(errno) = completion.err {
        warn!(driver = ?key, %errno, "couldn't send to driver");
        match client.reconnect() {
            Ok(()) => {
                warn!(driver = ?key, "repeat your command");
                reg.borrow_mut().finish_cmd();
                arm_signature_read(reg, key);
            }
            Err(err) => warn!(driver = ?key, %err, "couldn't reconnect to driver"),
        }
        return;
    }

    // The engine keeps a signature read pending at all times; only arm one
    // if the previous message completed and nothing is in flight.
    if !client.read_active() {
        client.reset_read_buffer();
        arm_signature_read(reg, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_well_formed_names() {
        assert_eq!(
            parse_socket_name("printer.3.drv"),
            Some(("printer".to_string(), 3))
        );
        assert_eq!(
            parse_socket_name("x.0.drv"),
            Some(("x".to_string(), 0))
        );
        assert_eq!(
            parse_socket_name("uart-16550.12.drv"),
            Some(("uart-16550".to_string(), 12))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        // missing pieces
        assert_eq!(parse_socket_name(""), None);
        assert_eq!(parse_socket_name("printer"), None);
        assert_eq!(parse_socket_name("printer.3"), None);
        assert_eq!(parse_socket_name(".3.drv"), None);
        assert_eq!(parse_socket_name("printer..drv"), None);
        // slot must be all digits
        assert_eq!(parse_socket_name("printer.3x.drv"), None);
        assert_eq!(parse_socket_name("printer.x3.drv"), None);
        assert_eq!(parse_socket_name("printer.-3.drv"), None);
        // suffix must match exactly
        assert_eq!(parse_socket_name("printer.3.sock"), None);
        assert_eq!(parse_socket_name("printer.3.drvx"), None);
        assert_eq!(parse_socket_name("printer.3.drv.bak"), None);
    }

    #[test]
    fn test_parse_rejects_oversize_slot() {
        assert_eq!(parse_socket_name("p.99999999999999999999.drv"), None);
    }
}
