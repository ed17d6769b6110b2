use anyhow::Result;
use drvsh::config::ShellConfig;
use drvsh::io_service::IoService;
use drvsh::registry::ExitReason;
use drvsh::shell::Shell;
use std::io::IsTerminal;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ShellConfig::load();
    if let Some(dir) = std::env::args().nth(1) {
        config.base_dir = PathBuf::from(dir);
    }

    match run(config) {
        Ok(reason) => ExitCode::from(reason.exit_code()),
        Err(err) => {
            eprintln!("drvsh: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(config: ShellConfig) -> Result<ExitReason> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        println!("drvsh v{} - driver control shell", env!("CARGO_PKG_VERSION"));
        println!("Type 'help' for commands");
    }

    let iosvc = Rc::new(IoService::new());
    let mut shell = Shell::new(
        Rc::clone(&iosvc),
        config,
        stdin.as_raw_fd(),
        Box::new(std::io::stdout()),
    );

    shell.run()
}
