use std::path::PathBuf;

use clap::{ArgAction, Parser};

const BUILD_VERSION: &str = env!("FLOCKD_BUILD_VERSION");
const HELP_AFTER: &str = "\
Profile layout
  <profiles-dir>/<name>/run       executable, invoked as `run start` / `run stop`
  <profiles-dir>/<name>/pid_file  first line names the runtime pid file the
                                  child writes
  <profiles-dir>/<name>/manage    marker; presence enables supervision

Control protocol (against a running instance)
  --start       switch to start-mode        (SIGUSR1)
  --stop        switch to stop-mode         (SIGUSR2)
  --terminate   orderly shutdown            (SIGTERM)
  --reopen-log  reopen the log file         (SIGHUP)

Without a running instance, --start/--stop perform a single reconciliation
pass and exit.

Examples
  flockd /etc/profiles /run/flockd.pid
  flockd --daemon --log-file /var/log/flockd.log /etc/profiles /run/flockd.pid
  flockd --stop /etc/profiles /run/flockd.pid
";

#[derive(Debug, Parser)]
#[command(
    name = "flockd",
    version = BUILD_VERSION,
    about = "Directory-driven process supervisor",
    after_help = HELP_AFTER
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Detach from the terminal and run in the background.
    #[arg(short, long)]
    pub daemon: bool,

    /// Switch a running instance to start-mode, or run one start pass.
    #[arg(long, conflicts_with_all = ["stop", "terminate", "reopen_log"])]
    pub start: bool,

    /// Switch a running instance to stop-mode, or run one stop pass.
    #[arg(long, conflicts_with_all = ["terminate", "reopen_log"])]
    pub stop: bool,

    /// Ask a running instance to shut down.
    #[arg(long, conflicts_with = "reopen_log")]
    pub terminate: bool,

    /// Ask a running instance to reopen its log file.
    #[arg(long)]
    pub reopen_log: bool,

    /// Exit 0 instead of failing when an instance is already running.
    #[arg(short, long)]
    pub quiet: bool,

    /// Append log output to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Directory whose subdirectories are the supervised profiles.
    #[arg(value_name = "PROFILES_DIR")]
    pub profiles_dir: PathBuf,

    /// PID file identifying the supervisor instance itself.
    #[arg(value_name = "PID_FILE")]
    pub pid_file: PathBuf,
}
