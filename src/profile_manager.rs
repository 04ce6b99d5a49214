use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::changed::ChangeDetector;
use crate::command::ExecPolicy;
use crate::errors::FlockdError;
use crate::profile::Profile;

/// One `Profile` per subdirectory of the profiles directory, tracked in
/// name order. `01-db` starts before `02-api` and stops after it.
#[derive(Debug)]
pub struct ProfileManager {
    profiles_dir: PathBuf,
    profiles: BTreeMap<String, Profile>,
    detector: ChangeDetector,
    policy: ExecPolicy,
}

impl ProfileManager {
    pub fn new(profiles_dir: &Path) -> Self {
        Self::with_policy(profiles_dir, ExecPolicy::default())
    }

    pub fn with_policy(profiles_dir: &Path, policy: ExecPolicy) -> Self {
        Self {
            profiles_dir: profiles_dir.to_path_buf(),
            profiles: BTreeMap::new(),
            detector: ChangeDetector::new(),
            policy,
        }
    }

    /// Reconciles the tracked set against the directory listing, skipped
    /// unless the directory itself changed. Added in ascending name order,
    /// torn down in descending order with a best-effort `disappeared()`.
    pub fn scan(&mut self) -> Result<()> {
        if !self
            .detector
            .changed(&self.profiles_dir)
            .with_context(|| format!("failed to stat {}", self.profiles_dir.display()))?
        {
            return Ok(());
        }

        let present = self.list_profile_dirs()?;

        let added: Vec<String> = present
            .iter()
            .filter(|name| !self.profiles.contains_key(*name))
            .cloned()
            .collect();
        for name in added {
            let dir = self.profiles_dir.join(&name);
            match Profile::new(&dir, self.policy) {
                Ok(profile) => {
                    info!("tracking new profile {name}");
                    self.profiles.insert(name, profile);
                }
                Err(err) => error!("failed to create profile {name}: {err:#}"),
            }
        }

        let removed: Vec<String> = self
            .profiles
            .keys()
            .rev()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            info!("profile {name} disappeared from {}", self.profiles_dir.display());
            if let Some(mut profile) = self.profiles.remove(&name) {
                if let Err(err) = profile.disappeared() {
                    error!("cleanup of disappeared profile {name} failed: {err:#}");
                }
            }
        }

        Ok(())
    }

    /// Starts the fleet in ascending name order. A failing profile is
    /// disabled and logged; the sweep always finishes.
    pub async fn start_all(&mut self) -> Result<()> {
        self.scan()?;
        let names: Vec<String> = self.profiles.keys().cloned().collect();
        for name in names {
            if let Some(profile) = self.profiles.get_mut(&name) {
                if let Err(err) = profile.start().await {
                    log_profile_failure(profile.name(), "start", &err);
                    profile.disable();
                }
            }
        }
        Ok(())
    }

    /// Stops the fleet in descending name order, mirroring `start_all`.
    pub async fn stop_all(&mut self) -> Result<()> {
        self.scan()?;
        let names: Vec<String> = self.profiles.keys().rev().cloned().collect();
        for name in names {
            if let Some(profile) = self.profiles.get_mut(&name) {
                if let Err(err) = profile.stop().await {
                    log_profile_failure(profile.name(), "stop", &err);
                    profile.disable();
                }
            }
        }
        Ok(())
    }

    fn list_profile_dirs(&self) -> Result<BTreeSet<String>> {
        let mut present = BTreeSet::new();
        let entries = fs::read_dir(&self.profiles_dir)
            .with_context(|| format!("failed to list {}", self.profiles_dir.display()))?;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to list {}", self.profiles_dir.display()))?;
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => {
                    present.insert(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(_) => {}
                Err(err) => debug!(
                    "skipping unreadable entry in {}: {err}",
                    self.profiles_dir.display()
                ),
            }
        }
        Ok(present)
    }
}

/// Configuration errors log at warn, everything else at error.
fn log_profile_failure(name: &str, verb: &str, err: &anyhow::Error) {
    match err.downcast_ref::<FlockdError>() {
        Some(domain) if domain.is_configuration() => {
            warn!("profile {name} misconfigured, {verb} skipped: {err:#}");
        }
        _ => error!("failed to {verb} profile {name}: {err:#}"),
    }
}
