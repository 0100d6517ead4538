use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcmonError {
    #[error("no lockfile for process {0}")]
    NotFound(String),
    #[error("duplicate process id: {0}")]
    DuplicateId(String),
    #[error("process {child} depends on unknown process {parent}")]
    DependencyMissing { child: String, parent: String },
    #[error("process {0} cannot depend on itself")]
    SelfDependency(String),
    #[error("invalid process definition: {0}")]
    InvalidConfig(String),
    #[error("lockfile for {0} is held by a running process")]
    LockBusy(String),
    #[error("lockfile for {0} is truncated or corrupt")]
    Unusable(String),
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: i32, source: nix::errno::Errno },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ProcmonError {
    /// Exit code for the control-plane surface: 0 on success, otherwise the
    /// closest errno value.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcmonError::NotFound(_) => libc::ENOENT,
            ProcmonError::DuplicateId(_)
            | ProcmonError::DependencyMissing { .. }
            | ProcmonError::SelfDependency(_)
            | ProcmonError::InvalidConfig(_)
            | ProcmonError::Serde(_) => libc::EINVAL,
            ProcmonError::LockBusy(_) => libc::EBUSY,
            ProcmonError::Unusable(_) => libc::EIO,
            ProcmonError::Signal { source, .. } => *source as i32,
            ProcmonError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
