//! Demo driver daemon.
//!
//! Binds `<base>/<name>.<slot>.drv` and serves two commands: `echo` sends
//! the arguments back joined by spaces, `ping` answers `pong`. Useful for
//! poking at a running shell and for manual end-to-end checks.
//!
//! Usage: `drvd <name> <slot> [base-dir]`

use anyhow::{bail, Context, Result};
use drvsh::driver::{CommandHandler, Driver};
use drvsh::io_service::IoService;
use drvsh::protocol::CommandDescriptor;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn execute(&mut self, cmd_idx: u32, args: &[Vec<u8>]) -> Vec<u8> {
        match cmd_idx {
            0 => args.join(&b' '),
            1 => b"pong".to_vec(),
            _ => Vec::new(),
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(name), Some(slot)) = (args.next(), args.next()) else {
        bail!("usage: drvd <name> <slot> [base-dir]");
    };
    let slot: u32 = slot.parse().context("slot must be a number")?;
    let base_dir = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;

    let commands = vec![
        CommandDescriptor {
            name: "echo".to_string(),
            descr: "echo arguments back".to_string(),
            arity: 8,
        },
        CommandDescriptor {
            name: "ping".to_string(),
            descr: "answer with pong".to_string(),
            arity: 0,
        },
    ];

    let iosvc = Rc::new(IoService::new());
    let driver = Driver::bind(
        Rc::clone(&iosvc),
        &base_dir,
        &name,
        slot,
        commands,
        Box::new(EchoHandler),
    )?;
    info!(socket = %driver.socket_path().display(), "drvd started");

    // Poll in bounded slices so the termination flag is observed even when
    // the sockets stay quiet.
    while !term.load(Ordering::Relaxed) {
        iosvc.poll_once(500)?;
    }

    info!("drvd stopping");
    drop(driver);
    Ok(())
}
