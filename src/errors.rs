use std::io;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlockdError {
    // Configuration errors: scoped to a single profile, resolved by
    // disabling it for the backoff window.
    #[error("profile {0}: run file is missing or not executable")]
    RunFileInvalid(String),
    #[error("profile {0}: pid pointer file is missing or empty")]
    PidPointerInvalid(String),
    #[error("profile {name}: malformed pid file content {content:?}")]
    MalformedPid { name: String, content: String },

    // Operational errors.
    #[error("cannot probe pid {pid}: {errno}")]
    LivenessProbe { pid: i32, errno: Errno },
    #[error("privilege drop to uid {uid} gid {gid} did not take effect")]
    PrivilegeDrop { uid: u32, gid: u32 },

    // Control protocol.
    #[error("supervisor already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("no running supervisor instance")]
    NotRunning,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FlockdError {
    /// True for errors scoped to a single profile's configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlockdError::RunFileInvalid(_)
                | FlockdError::PidPointerInvalid(_)
                | FlockdError::MalformedPid { .. }
        )
    }
}
