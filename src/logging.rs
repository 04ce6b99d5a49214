use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Where log lines go: stderr, or an append-opened file that SIGHUP can
/// reopen after rotation.
#[derive(Debug)]
enum LogTarget {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared, reopenable writer handed to `tracing_subscriber` as its
/// `MakeWriter`; all clones write through one target.
#[derive(Debug, Clone)]
pub struct LogOutput {
    target: Arc<Mutex<LogTarget>>,
}

impl LogOutput {
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(LogTarget::Stderr)),
        }
    }

    pub fn file(path: &Path) -> Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            target: Arc::new(Mutex::new(LogTarget::File {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    /// Reopens the log file at its original path; a no-op for stderr.
    pub fn reopen(&self) -> Result<()> {
        let mut target = self.target.lock().expect("log target lock poisoned");
        if let LogTarget::File { path, file } = &mut *target {
            *file = open_append(path)?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

impl Write for LogOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self.target.lock().expect("log target lock poisoned");
        match &mut *target {
            LogTarget::Stderr => io::stderr().write(buf),
            LogTarget::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self.target.lock().expect("log target lock poisoned");
        match &mut *target {
            LogTarget::Stderr => io::stderr().flush(),
            LogTarget::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogOutput {
    type Writer = LogOutput;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initializes the global subscriber. `FLOCKD_LOG` wins over the `-v`
/// count (0 → info, 1 → debug, more → trace). Called once from main.
pub fn init(verbose: u8, output: LogOutput) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_env("FLOCKD_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(output)
        .init();
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::LogOutput;

    #[test]
    fn file_output_appends_across_reopen() {
        let dir = temp_dir("logging-reopen");
        let path = dir.join("daemon.log");

        let mut output = LogOutput::file(&path).expect("failed to open log output");
        output.write_all(b"before\n").expect("write failed");

        // Simulate external rotation: move the live file away, reopen.
        fs::rename(&path, dir.join("daemon.log.1")).expect("rename failed");
        output.reopen().expect("reopen failed");
        output.write_all(b"after\n").expect("write failed");

        let rotated = fs::read_to_string(dir.join("daemon.log.1")).expect("rotated file missing");
        let current = fs::read_to_string(&path).expect("current file missing");
        assert_eq!(rotated, "before\n");
        assert_eq!(current, "after\n");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reopen_on_stderr_is_a_no_op() {
        let output = LogOutput::stderr();
        output.reopen().expect("reopen should succeed");
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
