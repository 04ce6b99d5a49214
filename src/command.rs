use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid};
use tokio::process::Command;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::FlockdError;

/// Escalation timings for one external command: 30s to finish, 5 more to
/// react to SIGTERM, then SIGKILL.
#[derive(Debug, Clone, Copy)]
pub struct ExecPolicy {
    pub grace: Duration,
    pub kill: Duration,
    pub poll: Duration,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            kill: Duration::from_secs(35),
            poll: Duration::from_secs(1),
        }
    }
}

/// What became of an executed command. Anything but `Completed` translates
/// into backoff, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Exited zero before any escalation.
    Completed,
    /// Exited non-zero on its own.
    Failed { code: Option<i32> },
    /// Needed the graceful termination signal.
    Terminated,
    /// Needed the forced kill.
    Killed,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExecOutcome::Completed)
    }
}

/// Runs `<profile_dir>/<command_name> <argument>` with output merged into
/// the supervisor's own stdout/stderr, escalating per `policy`. When
/// running as root the child drops to the profile directory's owner.
pub async fn execute(
    profile_dir: &Path,
    command_name: &str,
    argument: &str,
    policy: ExecPolicy,
) -> Result<ExecOutcome> {
    let program = profile_dir.join(command_name);
    let mut command = Command::new(&program);
    command
        .arg(argument)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if Uid::effective().is_root() {
        let meta = fs::metadata(profile_dir)
            .with_context(|| format!("failed to stat {}", profile_dir.display()))?;
        let uid = meta.uid();
        let gid = meta.gid();
        unsafe {
            command.pre_exec(move || drop_privileges(uid, gid));
        }
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {} {argument}", program.display()))?;
    let pid = child.id().context("spawned command has no pid")? as i32;

    let started = Instant::now();
    let mut terminated = false;
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to poll {} {argument}", program.display()))?
        {
            if terminated {
                return Ok(ExecOutcome::Terminated);
            }
            if status.success() {
                return Ok(ExecOutcome::Completed);
            }
            return Ok(ExecOutcome::Failed {
                code: status.code(),
            });
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.kill {
            warn!(
                "{} {argument} ignored termination; sending SIGKILL to pid {pid}",
                program.display()
            );
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("failed to send SIGKILL to pid {pid}: {err}");
            }
            // The escalation ends here; one reap, no further polling.
            let _ = child.wait().await;
            return Ok(ExecOutcome::Killed);
        }
        if elapsed >= policy.grace && !terminated {
            warn!(
                "{} {argument} exceeded {}s; sending SIGTERM to pid {pid}",
                program.display(),
                policy.grace.as_secs()
            );
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!("failed to send SIGTERM to pid {pid}: {err}");
            }
            terminated = true;
        }

        sleep(policy.poll).await;
    }
}

/// Runs between fork and exec; must stay async-signal-safe, hence raw
/// libc.
fn drop_privileges(uid: u32, gid: u32) -> std::io::Result<()> {
    unsafe {
        if nix::libc::setgroups(1, &gid) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if nix::libc::setgid(gid) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if nix::libc::setuid(uid) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if nix::libc::getuid() != uid || nix::libc::geteuid() != uid {
            return Err(std::io::Error::other(FlockdError::PrivilegeDrop {
                uid,
                gid,
            }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::{execute, ExecOutcome, ExecPolicy};

    fn fast_policy() -> ExecPolicy {
        ExecPolicy {
            grace: Duration::from_millis(300),
            kill: Duration::from_millis(600),
            poll: Duration::from_millis(50),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
        let mut perms = fs::metadata(&path).expect("stat failed").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod failed");
    }

    #[tokio::test]
    async fn clean_exit_is_a_completed_outcome() {
        let dir = temp_dir("command-clean");
        write_script(&dir, "run", "exit 0");

        let outcome = execute(&dir, "run", "start", fast_policy())
            .await
            .expect("execute failed");
        assert_eq!(outcome, ExecOutcome::Completed);
        assert!(outcome.success());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_the_code() {
        let dir = temp_dir("command-nonzero");
        write_script(&dir, "run", "exit 3");

        let outcome = execute(&dir, "run", "start", fast_policy())
            .await
            .expect("execute failed");
        assert_eq!(outcome, ExecOutcome::Failed { code: Some(3) });
        assert!(!outcome.success());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn hung_command_is_terminated_after_the_grace_period() {
        let dir = temp_dir("command-term");
        write_script(&dir, "run", "sleep 30");

        let started = Instant::now();
        let outcome = execute(&dir, "run", "start", fast_policy())
            .await
            .expect("execute failed");
        assert_eq!(outcome, ExecOutcome::Terminated);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "escalation should not wait for the sleep to finish"
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn term_ignoring_command_is_killed() {
        let dir = temp_dir("command-kill");
        write_script(&dir, "run", "trap '' TERM\nsleep 30");

        let started = Instant::now();
        let outcome = execute(&dir, "run", "start", fast_policy())
            .await
            .expect("execute failed");
        assert_eq!(outcome, ExecOutcome::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_program_is_an_error_not_an_outcome() {
        let dir = temp_dir("command-missing");
        let result = execute(&dir, "run", "start", fast_policy()).await;
        assert!(result.is_err());
        let _ = fs::remove_dir_all(dir);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("flockd-{prefix}-{nonce}"));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }
}
