use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::changed::ChangeDetector;
use crate::command::{execute, ExecPolicy};
use crate::errors::FlockdError;
use crate::pidfile::pid_alive;

/// How long a failed profile sits out before it is eligible again.
pub const DISABLE_TIMEFRAME: Duration = Duration::from_secs(60);

/// Whether a profile whose directory vanished gets a parting SIGTERM.
const KILL_WHEN_DISAPPEARED: bool = true;

const RUN_FILE: &str = "run";
const POINTER_FILE: &str = "pid_file";
const MANAGE_FILE: &str = "manage";

/// Path of the one-line pointer file naming the runtime PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PointerFile(PathBuf);

/// Path of the PID file the child process itself writes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RuntimePidFile(PathBuf);

/// One supervised unit: a directory holding an executable `run` script, a
/// `pid_file` pointer, and an optional `manage` marker.
#[derive(Debug)]
pub struct Profile {
    name: String,
    dir: PathBuf,
    run_file: PathBuf,
    manage_file: PathBuf,
    pointer: PointerFile,
    runtime_pid_file: Option<RuntimePidFile>,
    manage: bool,
    disabled_since: Option<Instant>,
    pid: Option<i32>,
    detector: ChangeDetector,
    // Re-armed by disable(); watches the manage marker and the directory.
    override_detector: ChangeDetector,
    policy: ExecPolicy,
}

impl Profile {
    pub fn new(dir: &Path, policy: ExecPolicy) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("profile directory has no base name")?;
        fs::metadata(dir).with_context(|| format!("failed to stat {}", dir.display()))?;

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            run_file: dir.join(RUN_FILE),
            manage_file: dir.join(MANAGE_FILE),
            pointer: PointerFile(dir.join(POINTER_FILE)),
            runtime_pid_file: None,
            manage: false,
            disabled_since: None,
            pid: None,
            detector: ChangeDetector::new(),
            override_detector: ChangeDetector::new(),
            policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-validates configuration where the change detector says
    /// something moved.
    pub fn scan(&mut self) -> Result<(), FlockdError> {
        if self.detector.changed(&self.dir)? {
            self.manage = self.manage_file.exists();
            debug!("profile {}: manage={}", self.name, self.manage);
        }
        if !self.manage {
            return Ok(());
        }

        let meta = fs::metadata(&self.run_file)
            .map_err(|_| FlockdError::RunFileInvalid(self.name.clone()))?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(FlockdError::RunFileInvalid(self.name.clone()));
        }

        let pointer_changed = self
            .detector
            .changed(&self.pointer.0)
            .map_err(|_| FlockdError::PidPointerInvalid(self.name.clone()))?;
        if pointer_changed || self.runtime_pid_file.is_none() {
            let content = fs::read_to_string(&self.pointer.0)
                .map_err(|_| FlockdError::PidPointerInvalid(self.name.clone()))?;
            let target = content
                .lines()
                .next()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .ok_or_else(|| FlockdError::PidPointerInvalid(self.name.clone()))?;
            if let Some(RuntimePidFile(previous)) = self.runtime_pid_file.take() {
                self.detector.forget(&previous);
            }
            self.runtime_pid_file = Some(RuntimePidFile(PathBuf::from(target)));
        }

        Ok(())
    }

    /// Decides whether the profile sits this cycle out. An unmanaged
    /// profile always skips; a disabled one skips until the backoff window
    /// elapses, unless its `manage` marker is modified in the meantime.
    pub fn skip(&mut self) -> bool {
        if !self.manage {
            return true;
        }
        if let Some(since) = self.disabled_since {
            if self.override_seen() {
                info!("profile {}: re-enabled by marker change", self.name);
                self.disabled_since = None;
                return false;
            }
            if since.elapsed() < DISABLE_TIMEFRAME {
                return true;
            }
            debug!("profile {}: backoff window elapsed", self.name);
            self.disabled_since = None;
        }
        false
    }

    /// Operator override: the `manage` marker was modified, or the
    /// directory stamp moved (marker created or deleted). A marker that is
    /// simply absent reads as no change.
    fn override_seen(&mut self) -> bool {
        let marker = match self.override_detector.changed(&self.manage_file) {
            Ok(changed) => changed,
            Err(_) => {
                self.override_detector.forget(&self.manage_file);
                false
            }
        };
        let dir = self.override_detector.changed(&self.dir).unwrap_or(false);
        marker || dir
    }

    /// Brings the profile up when it is managed, eligible, and not already
    /// running. Command outcomes other than a clean exit trigger backoff.
    pub async fn start(&mut self) -> Result<()> {
        self.scan()?;
        if self.skip() {
            return Ok(());
        }
        if self.running()? {
            return Ok(());
        }

        info!("starting profile {}", self.name);
        let outcome = execute(&self.dir, RUN_FILE, "start", self.policy).await?;
        if !outcome.success() {
            warn!("profile {}: run start ended with {outcome:?}", self.name);
            self.disable();
        }
        Ok(())
    }

    /// Brings the profile down when it is managed, eligible, and running.
    pub async fn stop(&mut self) -> Result<()> {
        self.scan()?;
        if self.skip() {
            return Ok(());
        }
        if !self.running()? {
            return Ok(());
        }

        info!("stopping profile {}", self.name);
        let outcome = execute(&self.dir, RUN_FILE, "stop", self.policy).await?;
        if !outcome.success() {
            warn!("profile {}: run stop ended with {outcome:?}", self.name);
            self.disable();
        }
        Ok(())
    }

    /// Puts the profile into its backoff window and re-arms the override
    /// detector so only a future marker change lifts it early.
    pub fn disable(&mut self) {
        info!(
            "disabling profile {} for {}s",
            self.name,
            DISABLE_TIMEFRAME.as_secs()
        );
        self.disabled_since = Some(Instant::now());
        let _ = self.override_detector.changed(&self.manage_file);
        let _ = self.override_detector.changed(&self.dir);
    }

    /// Best-effort cleanup when the profile directory vanished from the
    /// fleet: one termination signal to the last known pid, no escalation.
    pub fn disappeared(&mut self) -> Result<()> {
        if !KILL_WHEN_DISAPPEARED {
            return Ok(());
        }
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        if pid_alive(pid)? {
            info!(
                "profile {} disappeared; terminating leftover pid {pid}",
                self.name
            );
            kill(Pid::from_raw(pid), Signal::SIGTERM)
                .with_context(|| format!("failed to terminate pid {pid}"))?;
        }
        Ok(())
    }

    /// Resolves the pid through the pointer indirection. A missing runtime
    /// PID file means the child is down.
    fn resolve_pid(&mut self) -> Result<Option<i32>, FlockdError> {
        let Some(RuntimePidFile(path)) = self.runtime_pid_file.clone() else {
            return Ok(None);
        };
        match self.detector.changed(&path) {
            Ok(true) => {
                let content = fs::read_to_string(&path)?;
                let pid = content.trim().parse::<i32>().map_err(|_| {
                    FlockdError::MalformedPid {
                        name: self.name.clone(),
                        content: content.trim().to_string(),
                    }
                })?;
                self.pid = Some(pid);
            }
            Ok(false) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.detector.forget(&path);
                self.pid = None;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(self.pid)
    }

    fn running(&mut self) -> Result<bool, FlockdError> {
        match self.resolve_pid()? {
            Some(pid) => pid_alive(pid),
            None => Ok(false),
        }
    }
}
