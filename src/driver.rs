//! Driver-side protocol engine.
//!
//! A driver binds `<base>/<name>.<slot>.drv`, greets every accepted
//! connection with `DRV_INFO`, then reads `DRV_COMMAND` frames in stages
//! (signature, header, then each argument's length byte and payload) and
//! answers with `DRV_RESPONSE`. What a command *does* is behind the
//! [`CommandHandler`] trait; this module only speaks the protocol.

use crate::io_service::IoService;
use crate::protocol::{self, CommandDescriptor};
use crate::socket::{Completion, Server};
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Executes one command. `cmd_idx` is an index into the descriptor table
/// the driver was bound with; the return value becomes the `DRV_RESPONSE`
/// payload.
pub trait CommandHandler {
    fn execute(&mut self, cmd_idx: u32, args: &[Vec<u8>]) -> Vec<u8>;
}

/// Progress through one incoming `DRV_COMMAND` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStage {
    Signature,
    Header,
    ArgLen,
    ArgBytes,
}

struct ConnState {
    stage: ConnStage,
    cmd_idx: u32,
    argc: u32,
    pending_len: usize,
    args: Vec<Vec<u8>>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            stage: ConnStage::Signature,
            cmd_idx: 0,
            argc: 0,
            pending_len: 0,
            args: Vec::new(),
        }
    }
}

struct DriverInner {
    server: Server,
    commands: Vec<CommandDescriptor>,
    handler: Box<dyn CommandHandler>,
    conns: HashMap<RawFd, ConnState>,
    info_frame: Vec<u8>,
}

/// A bound driver endpoint. Dropping it closes every connection and
/// unlinks the socket node.
pub struct Driver {
    inner: Rc<RefCell<DriverInner>>,
}

impl Driver {
    pub fn bind(
        iosvc: Rc<IoService>,
        base_dir: &Path,
        name: &str,
        slot: u32,
        commands: Vec<CommandDescriptor>,
        handler: Box<dyn CommandHandler>,
    ) -> Result<Self> {
        let path = base_dir.join(format!("{}.{}.{}", name, slot, protocol::SOCKET_SUFFIX));
        let server = Server::bind(iosvc, &path)
            .with_context(|| format!("can't bind driver socket {}", path.display()))?;

        let info_frame = protocol::encode_info(&commands)
            .context("can't encode driver info")?;

        let inner = Rc::new(RefCell::new(DriverInner {
            server: server.clone(),
            commands,
            handler,
            conns: HashMap::new(),
            info_frame,
        }));

        let hook_inner = Rc::clone(&inner);
        server
            .listen(Box::new(move |srv, conn| on_accept(&hook_inner, srv, conn)))
            .context("can't listen on driver socket")?;

        debug!(path = %path.display(), "driver listening");
        Ok(Self { inner })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.inner.borrow().server.local_path()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.borrow().conns.len()
    }

    /// Closes every connection, stops accepting and unlinks the socket.
    pub fn close(&self) {
        let server = self.inner.borrow().server.clone();
        server.close();
        self.inner.borrow_mut().conns.clear();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}

fn on_accept(inner: &Rc<RefCell<DriverInner>>, srv: &Server, conn: RawFd) -> bool {
    let frame = {
        let mut i = inner.borrow_mut();
        i.conns.insert(conn, ConnState::new());
        i.info_frame.clone()
    };

    let inner2 = Rc::clone(inner);
    let sent = srv.send(
        conn,
        &frame,
        Box::new(move |srv, conn, completion| {
            if !completion.ok() {
                warn!(fd = conn, "couldn't send driver info");
                close_conn(&inner2, srv, conn);
                return;
            }
            srv.reset_write_buffer(conn);
            arm(&inner2, srv, conn, ConnStage::Signature, protocol::SIGNATURE_LEN);
        }),
    );

    if let Err(err) = sent {
        warn!(fd = conn, %err, "can't greet connection");
        inner.borrow_mut().conns.remove(&conn);
        return false;
    }
    true
}

fn close_conn(inner: &Rc<RefCell<DriverInner>>, srv: &Server, conn: RawFd) {
    inner.borrow_mut().conns.remove(&conn);
    srv.close_connection(conn);
}

fn set_stage(inner: &Rc<RefCell<DriverInner>>, conn: RawFd, stage: ConnStage) {
    if let Some(state) = inner.borrow_mut().conns.get_mut(&conn) {
        state.stage = stage;
    }
}

fn arm(inner: &Rc<RefCell<DriverInner>>, srv: &Server, conn: RawFd, stage: ConnStage, size: usize) {
    set_stage(inner, conn, stage);
    let inner2 = Rc::clone(inner);
    if let Err(err) = srv.recv(
        conn,
        size,
        Box::new(move |srv, conn, completion| on_conn_read(&inner2, srv, conn, completion)),
    ) {
        warn!(fd = conn, %err, "can't arm receive");
    }
}

fn on_conn_read(
    inner: &Rc<RefCell<DriverInner>>,
    srv: &Server,
    conn: RawFd,
    completion: Completion,
) {
    if let Some(errno) = completion.err {
        warn!(fd = conn, %errno, "error on receive");
        close_conn(inner, srv, conn);
        return;
    }
    if completion.eof {
        debug!(fd = conn, "peer closed the connection");
        close_conn(inner, srv, conn);
        return;
    }

    let Some(stage) = inner.borrow().conns.get(&conn).map(|s| s.stage) else {
        return;
    };

    match stage {
        ConnStage::Signature => {
            let signature = srv
                .with_read_buf(conn, |b| b.first().copied())
                .ok()
                .flatten();
            match signature {
                Some(protocol::DRV_COMMAND) => {
                    arm(
                        inner,
                        srv,
                        conn,
                        ConnStage::Header,
                        protocol::COMMAND_HEADER_LEN - protocol::SIGNATURE_LEN,
                    );
                }
                Some(other) => {
                    warn!(
                        fd = conn,
                        signature = format_args!("{:#04x}", other),
                        "invalid signature from shell"
                    );
                    close_conn(inner, srv, conn);
                }
                None => {}
            }
        }

        ConnStage::Header => {
            let header = srv
                .with_read_buf(conn, |b| protocol::decode_command_header(b))
                .ok()
                .and_then(|r| r.ok());
            let Some((cmd_idx, argc)) = header else {
                warn!(fd = conn, "malformed command header");
                close_conn(inner, srv, conn);
                return;
            };

            let known = (cmd_idx as usize) < inner.borrow().commands.len();
            if !known {
                warn!(fd = conn, cmd_idx, "command index out of range");
                close_conn(inner, srv, conn);
                return;
            }

            {
                let mut i = inner.borrow_mut();
                if let Some(state) = i.conns.get_mut(&conn) {
                    state.cmd_idx = cmd_idx;
                    state.argc = argc;
                    state.args = Vec::with_capacity(argc.min(64) as usize);
                }
            }

            if argc == 0 {
                execute_and_respond(inner, srv, conn);
            } else {
                arm(inner, srv, conn, ConnStage::ArgLen, 1);
            }
        }

        ConnStage::ArgLen => {
            let len = srv
                .with_read_buf(conn, |b| b.last().copied())
                .ok()
                .flatten();
            let Some(len) = len else { return };

            if len == 0 {
                push_arg(inner, srv, conn, Vec::new());
            } else {
                if let Some(state) = inner.borrow_mut().conns.get_mut(&conn) {
                    state.pending_len = len as usize;
                }
                let pending = len as usize;
                arm(inner, srv, conn, ConnStage::ArgBytes, pending);
            }
        }

        ConnStage::ArgBytes => {
            let arg = {
                let pending = inner
                    .borrow()
                    .conns
                    .get(&conn)
                    .map(|s| s.pending_len)
                    .unwrap_or(0);
                srv.with_read_buf(conn, |b| b[b.len() - pending..].to_vec()).ok()
            };
            let Some(arg) = arg else { return };
            push_arg(inner, srv, conn, arg);
        }
    }
}

fn push_arg(inner: &Rc<RefCell<DriverInner>>, srv: &Server, conn: RawFd, arg: Vec<u8>) {
    let complete = {
        let mut i = inner.borrow_mut();
        let Some(state) = i.conns.get_mut(&conn) else {
            return;
        };
        state.args.push(arg);
        state.args.len() as u32 == state.argc
    };

    if complete {
        execute_and_respond(inner, srv, conn);
    } else {
        arm(inner, srv, conn, ConnStage::ArgLen, 1);
    }
}

fn execute_and_respond(inner: &Rc<RefCell<DriverInner>>, srv: &Server, conn: RawFd) {
    let response = {
        let mut i = inner.borrow_mut();
        let i = &mut *i;
        let Some(state) = i.conns.get_mut(&conn) else {
            return;
        };
        let cmd_idx = state.cmd_idx;
        let args = std::mem::take(&mut state.args);
        i.handler.execute(cmd_idx, &args)
    };

    let frame = match protocol::encode_response(&response) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(fd = conn, %err, "can't encode response");
            close_conn(inner, srv, conn);
            return;
        }
    };

    // Done with the command frame; the next one starts at offset zero.
    srv.reset_read_buffer(conn);

    let inner2 = Rc::clone(inner);
    let sent = srv.send(
        conn,
        &frame,
        Box::new(move |srv, conn, completion| {
            if !completion.ok() {
                warn!(fd = conn, "couldn't send response");
                close_conn(&inner2, srv, conn);
                return;
            }
            srv.reset_write_buffer(conn);
            arm(&inner2, srv, conn, ConnStage::Signature, protocol::SIGNATURE_LEN);
        }),
    );

    if let Err(err) = sent {
        warn!(fd = conn, %err, "can't send response");
        close_conn(inner, srv, conn);
    }
}
