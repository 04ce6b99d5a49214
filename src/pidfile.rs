use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::errors::FlockdError;

/// Zero-signal liveness probe. ESRCH means the pid is gone; any other
/// errno is an operational error, not an answer.
pub fn pid_alive(pid: i32) -> Result<bool, FlockdError> {
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(FlockdError::LivenessProbe { pid, errno }),
    }
}

/// Owns the daemon's own PID file; removed again when the guard drops on
/// normal exit.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove pid file {}: {err}", self.path.display());
        }
    }
}

/// Claims `path` for the current process with an exclusive create, so two
/// instances racing for the same file cannot both win. A leftover file from
/// a dead instance is cleaned up and the create retried once.
pub fn acquire(path: &Path) -> Result<PidFileGuard> {
    match write_exclusive(path) {
        Ok(guard) => Ok(guard),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            match running_pid(path)? {
                Some(other) => Err(FlockdError::AlreadyRunning(other).into()),
                None => {
                    debug!("removing stale pid file {}", path.display());
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove stale pid file {}", path.display())
                    })?;
                    write_exclusive(path)
                        .with_context(|| format!("failed to create pid file {}", path.display()))
                }
            }
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to create pid file {}", path.display()))
        }
    }
}

fn write_exclusive(path: &Path) -> io::Result<PidFileGuard> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(PidFileGuard {
        path: path.to_path_buf(),
    })
}

/// Reads the daemon PID file and checks the recorded process is alive.
/// Absent file or dead pid both mean "no running instance".
pub fn running_pid(path: &Path) -> Result<Option<i32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read pid file {}", path.display()));
        }
    };

    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("malformed pid file {}", path.display()))?;

    if pid_alive(pid)? {
        Ok(Some(pid))
    } else {
        Ok(None)
    }
}

/// Delivers `signal` to the instance recorded in `path`, or fails with
/// `NotRunning` when there is none.
pub fn signal_running(path: &Path, signal: Signal) -> Result<i32> {
    let pid = running_pid(path)?.ok_or(FlockdError::NotRunning)?;
    kill(Pid::from_raw(pid), signal)
        .with_context(|| format!("failed to send {signal} to pid {pid}"))?;
    Ok(pid)
}
