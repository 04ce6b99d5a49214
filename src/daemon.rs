use std::env;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio::time::sleep;
use tracing::{error, info};

use crate::cli::Cli;
use crate::errors::FlockdError;
use crate::logging::LogOutput;
use crate::notifier::Notifier;
use crate::pidfile;
use crate::profile_manager::ProfileManager;

/// One reconciliation pass per second while idle.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point behind `main`: either behaves as a one-shot control client
/// against a running instance, or becomes the instance itself.
pub async fn run(cli: Cli, output: LogOutput) -> Result<()> {
    if cli.terminate {
        let pid = pidfile::signal_running(&cli.pid_file, Signal::SIGTERM)?;
        info!("requested shutdown of instance {pid}");
        return Ok(());
    }
    if cli.reopen_log {
        let pid = pidfile::signal_running(&cli.pid_file, Signal::SIGHUP)?;
        info!("requested log reopen of instance {pid}");
        return Ok(());
    }

    if cli.start || cli.stop {
        if let Some(pid) = pidfile::running_pid(&cli.pid_file)? {
            let signal = if cli.start {
                Signal::SIGUSR1
            } else {
                Signal::SIGUSR2
            };
            pidfile::signal_running(&cli.pid_file, signal)?;
            info!(
                "switched instance {pid} to {}-mode",
                if cli.start { "start" } else { "stop" }
            );
            return Ok(());
        }
        // No instance: a single reconciliation pass, no persistent loop.
        let mut manager = ProfileManager::new(&cli.profiles_dir);
        return if cli.start {
            manager.start_all().await
        } else {
            manager.stop_all().await
        };
    }

    if let Some(pid) = pidfile::running_pid(&cli.pid_file)? {
        if cli.quiet {
            info!("supervisor already running with pid {pid}");
            return Ok(());
        }
        return Err(FlockdError::AlreadyRunning(pid).into());
    }

    if cli.daemon {
        return detach(&cli);
    }

    supervise(&cli, output).await
}

/// The persistent supervision loop. Holds the daemon PID file for its
/// whole lifetime; the guard removes it again on the way out.
async fn supervise(cli: &Cli, output: LogOutput) -> Result<()> {
    let _pid_guard = pidfile::acquire(&cli.pid_file)?;
    let notifier = Notifier::new(true);
    notifier.install()?;

    let mut manager = ProfileManager::new(&cli.profiles_dir);
    info!(
        "supervising profiles under {} (pid {})",
        cli.profiles_dir.display(),
        std::process::id()
    );

    loop {
        let result = if notifier.start_mode() {
            manager.start_all().await
        } else {
            manager.stop_all().await
        };
        if let Err(err) = result {
            // Only the profiles directory itself going bad lands here.
            error!("fleet reconciliation failed: {err:#}");
            return Err(err);
        }

        if !notifier.keep_running() {
            info!("shutdown requested; leaving supervised processes running");
            return Ok(());
        }
        if notifier.take_hangup() {
            output.reopen()?;
            info!("log output reopened");
        }
        idle(&notifier).await;
    }
}

/// Sleeps out the rest of the cycle, unless a child exited during the last
/// one; then the next pass runs immediately.
async fn idle(notifier: &Notifier) {
    if !notifier.take_child() {
        sleep(POLL_INTERVAL).await;
    }
}

/// Re-executes ourselves detached from the terminal: new session,
/// restrictive umask, stdio on /dev/null. The child re-enters `run`
/// without `--daemon`; the parent returns and exits 0.
fn detach(cli: &Cli) -> Result<()> {
    let exe = env::current_exe().context("failed to locate current executable")?;

    let mut args: Vec<OsString> = Vec::new();
    for _ in 0..cli.verbose {
        args.push("-v".into());
    }
    if cli.quiet {
        args.push("--quiet".into());
    }
    if let Some(log_file) = &cli.log_file {
        args.push("--log-file".into());
        args.push(log_file.clone().into());
    }
    args.push(cli.profiles_dir.clone().into());
    args.push(cli.pid_file.clone().into());

    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        command.pre_exec(|| {
            if nix::libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            nix::libc::umask(0o077);
            Ok(())
        });
    }
    let child = command.spawn().context("failed to spawn detached instance")?;
    info!("supervisor detached with pid {}", child.id());
    Ok(())
}
