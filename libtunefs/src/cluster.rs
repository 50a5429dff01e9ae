//! Cluster lock manager interface and the bundled flock-based stack.

use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::debug;

use crate::ondisk::{DEFAULT_CLUSTER_STACK, SuperBlock};

#[derive(Debug, Error)]
pub enum DlmError {
    #[error("volume uses cluster stack \"{found}\" but \"{running}\" is running")]
    StackMismatch { running: String, found: String },

    #[error("cluster lock is held by another node")]
    TrylockFailed,

    #[error("cluster stack unavailable: {0}")]
    Unavailable(String),

    #[error("cluster lock I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A cluster stack able to hand out per-volume lock sessions.
pub trait ClusterStack: Send + Sync {
    /// Bring the local side of the stack up. Called before every connect.
    fn init(&self) -> Result<(), DlmError>;

    /// Open a lock session for the volume described by `sb`.
    fn connect(&self, sb: &SuperBlock) -> Result<Box<dyn DlmSession>, DlmError>;
}

/// Lock-manager context for one volume.
pub trait DlmSession: Send {
    /// Take the volume's cluster-wide exclusive lock without waiting.
    fn lock_down(&mut self) -> Result<(), DlmError>;

    fn release(&mut self) -> Result<(), DlmError>;

    fn shutdown(self: Box<Self>) -> Result<(), DlmError>;
}

/// Cluster stack whose lock is an exclusive `flock` on a file in a directory
/// shared by every node.
#[derive(Debug, Clone)]
pub struct FlockStack {
    lock_dir: PathBuf,
    running: String,
}

impl FlockStack {
    pub fn new(lock_dir: impl Into<PathBuf>, running: impl Into<String>) -> Self {
        FlockStack {
            lock_dir: lock_dir.into(),
            running: running.into(),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }
}

impl Default for FlockStack {
    fn default() -> Self {
        FlockStack::new("/var/lib/tunefs/locks", DEFAULT_CLUSTER_STACK)
    }
}

impl ClusterStack for FlockStack {
    fn init(&self) -> Result<(), DlmError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.lock_dir)
            .map_err(|e| {
                DlmError::Unavailable(format!("lock directory {}: {e}", self.lock_dir.display()))
            })
    }

    fn connect(&self, sb: &SuperBlock) -> Result<Box<dyn DlmSession>, DlmError> {
        let found = sb.stack_name();
        if found != self.running {
            return Err(DlmError::StackMismatch {
                running: self.running.clone(),
                found: found.to_string(),
            });
        }
        let path = self.lock_dir.join(format!("{}.lock", sb.uuid_hex()));
        debug!("Connected to stack {} for {}", self.running, path.display());
        Ok(Box::new(FlockSession { path, lock: None }))
    }
}

struct FlockSession {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl DlmSession for FlockSession {
    fn lock_down(&mut self) -> Result<(), DlmError> {
        if self.lock.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err((_file, Errno::EWOULDBLOCK)) => Err(DlmError::TrylockFailed),
            Err((_file, e)) => Err(DlmError::Io(e.into())),
        }
    }

    fn release(&mut self) -> Result<(), DlmError> {
        if let Some(lock) = self.lock.take() {
            lock.unlock().map_err(|(_lock, e)| DlmError::Io(e.into()))?;
        }
        Ok(())
    }

    fn shutdown(mut self: Box<Self>) -> Result<(), DlmError> {
        self.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::image::ImageBuilder;

    #[test]
    fn test_second_session_cannot_lock() {
        let dir = tempfile::tempdir().unwrap();
        let stack = FlockStack::new(dir.path().join("locks"), "o2cb");
        let sb = ImageBuilder::new().cluster_stack("o2cb", "alpha").build().super_block;

        stack.init().unwrap();
        let mut first = stack.connect(&sb).unwrap();
        let mut second = stack.connect(&sb).unwrap();

        first.lock_down().unwrap();
        assert!(matches!(second.lock_down(), Err(DlmError::TrylockFailed)));

        first.release().unwrap();
        second.lock_down().unwrap();
        second.shutdown().unwrap();
        first.shutdown().unwrap();
    }

    #[test]
    fn test_stack_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let stack = FlockStack::new(dir.path(), "o2cb");
        let sb = ImageBuilder::new().cluster_stack("pcmk", "alpha").build().super_block;

        match stack.connect(&sb) {
            Err(DlmError::StackMismatch { running, found }) => {
                assert_eq!(running, "o2cb");
                assert_eq!(found, "pcmk");
            }
            _ => panic!("expected a stack mismatch"),
        }
    }
}
