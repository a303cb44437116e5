//! vm-runner: run a QEMU guest described by `<vm_root>/<name>/specs.json`
//! and talk to its guest agent.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vm_runner::agent::{AgentConnection, ClockSettings, ClockSync, ExecRequest};
use vm_runner::logging::{self, LogConfig};
use vm_runner::settings::Settings;
use vm_runner::vm::{HostVolumeTools, VirtualMachine};

/// How often `sync-time` looks for the agent socket.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How often `exec` polls `guest-exec-status`.
const EXEC_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "vm-runner", version, about = "Run a QEMU guest and talk to its agent")]
struct Args {
    /// Settings file (defaults to ~/.config/vm-runner/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision and boot a VM, forwarding hypervisor output until it exits
    Run {
        name: String,
        /// Delete drive images and the metadata volume after the VM exits
        #[arg(long)]
        ephemeral: bool,
    },
    /// Keep the guest clock in line with the host until interrupted
    SyncTime { name: String },
    /// Check whether the guest agent answers
    Ping { name: String },
    /// Run a program in the guest and print its output
    Exec {
        name: String,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_guard = logging::init(&LogConfig {
        verbosity: args.verbose,
        file: args.log_file.clone(),
    });

    let settings = Settings::load(args.config.as_deref())?;

    let code = match args.command {
        Command::Run { name, ephemeral } => run(&name, ephemeral, &settings).await?,
        Command::SyncTime { name } => sync_time(&name, &settings).await?,
        Command::Ping { name } => ping(&name, &settings).await?,
        Command::Exec {
            name,
            program,
            args,
        } => exec(&name, program, args, &settings).await?,
    };

    // exit() skips destructors; flush the file appender first.
    drop(log_guard);
    std::process::exit(code);
}

async fn run(name: &str, ephemeral: bool, settings: &Settings) -> Result<i32> {
    let vm = VirtualMachine::open(name, settings)?;
    let tools = Arc::new(HostVolumeTools::new(settings.tool_timeout()));
    let status = vm
        .run(tools, ephemeral)
        .await
        .with_context(|| format!("running VM {name}"))?;
    if !status.success() {
        warn!(vm = name, ?status, "hypervisor exited with failure");
    }
    Ok(status.code().unwrap_or(1))
}

async fn sync_time(name: &str, settings: &Settings) -> Result<i32> {
    let vm = VirtualMachine::open(name, settings)?;
    let socket = vm.agent_socket();
    wait_for_socket(&socket).await;

    let conn = AgentConnection::connect(&socket).await?;
    let mut handle = ClockSync::spawn(conn, ClockSettings::default());

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            true
        }
        result = handle.finished() => {
            // The loop only ends by itself on error, which is routine when
            // the guest goes away.
            if let Err(e) = result {
                info!(error = %e, "clock sync ended");
            }
            false
        }
    };

    if interrupted {
        info!("interrupted, stopping clock sync");
        handle.stop().await?;
    }
    Ok(0)
}

async fn ping(name: &str, settings: &Settings) -> Result<i32> {
    let vm = VirtualMachine::open(name, settings)?;
    let mut conn = AgentConnection::connect(vm.agent_socket()).await?;
    let alive = conn.guest_ping().await;
    println!("{alive}");
    Ok(if alive { 0 } else { 1 })
}

async fn exec(name: &str, program: String, args: Vec<String>, settings: &Settings) -> Result<i32> {
    let vm = VirtualMachine::open(name, settings)?;
    let mut conn = AgentConnection::connect(vm.agent_socket()).await?;

    let pid = conn
        .guest_exec(ExecRequest::new(program).args(args).capture_output(true))
        .await?;
    info!(pid, "started guest process");

    let status = loop {
        let status = conn.guest_exec_status(pid).await?;
        if status.exited {
            break status;
        }
        tokio::time::sleep(EXEC_POLL_INTERVAL).await;
    };

    std::io::stdout().write_all(&status.stdout()?)?;
    std::io::stderr().write_all(&status.stderr()?)?;
    if status.out_truncated || status.err_truncated {
        warn!(pid, "guest output was truncated");
    }

    match (status.exitcode, status.signal) {
        (Some(code), _) => Ok(code),
        (None, Some(signal)) => Ok(128 + signal),
        (None, None) => bail!("guest process {pid} exited without a status"),
    }
}

async fn wait_for_socket(socket: &Path) {
    while !socket.exists() {
        info!(socket = %socket.display(), "waiting for agent socket");
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}
