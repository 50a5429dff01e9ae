//! Control channel to a mounted volume.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{Result, TuneError};
use crate::mounts::MountProbe;

/// Request code understood by the filesystem driver. Opaque to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest(pub u64);

/// Reference-counted read-only descriptor on the mount directory.
pub struct OnlineGateway {
    mounts: Arc<dyn MountProbe>,
    fd: Option<File>,
    count: usize,
}

impl OnlineGateway {
    pub fn new(mounts: Arc<dyn MountProbe>) -> Self {
        OnlineGateway {
            mounts,
            fd: None,
            count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn refs(&self) -> usize {
        self.count
    }

    pub fn open(&mut self, device: &Path) -> Result<()> {
        if self.count > 0 {
            self.count += 1;
            return Ok(());
        }

        let state = self.mounts.check(device)?;
        if !state.usable_online() {
            return Err(TuneError::NotMounted);
        }
        let dir = state.mount_dir.ok_or(TuneError::NotMounted)?;

        let file = File::open(&dir).map_err(|e| match e.raw_os_error().map(Errno::from_raw) {
            Some(Errno::EBUSY) => TuneError::DeviceBusy,
            Some(Errno::ENOENT) => TuneError::NotMounted,
            _ => TuneError::Io(e),
        })?;
        debug!("Opened control channel on {}", dir.display());
        self.fd = Some(file);
        self.count = 1;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.count > 0 {
            self.count -= 1;
            if self.count == 0 {
                self.fd = None;
            }
        }
    }

    /// Hand `payload` to the driver along with `request`.
    pub fn send(&self, request: ControlRequest, payload: &mut [u8]) -> Result<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| TuneError::Internal("no online control channel".to_string()))?;
        // SAFETY: `payload` is a live, exclusively borrowed buffer for the
        // duration of the call and `fd` is an open descriptor.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request.0 as _, payload.as_mut_ptr()) };
        if rc < 0 {
            return Err(classify_errno(Errno::last()));
        }
        Ok(())
    }
}

/// Misuse of the channel is an internal failure; anything else means the
/// driver turned the request down.
pub fn classify_errno(errno: Errno) -> TuneError {
    match errno {
        Errno::EBADF | Errno::EFAULT | Errno::ENOTTY => {
            TuneError::Internal(format!("control request failed: {errno}"))
        }
        other => TuneError::OnlineFailed(other),
    }
}

impl std::fmt::Debug for OnlineGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineGateway")
            .field("open", &self.fd.is_some())
            .field("count", &self.count)
            .finish()
    }
}
