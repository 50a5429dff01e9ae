//! Mount-table probing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use procfs::process::{MountInfo, Process};
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u8 {
        const MOUNTED = 0x01;
        const READONLY = 0x02;
        const SWAP = 0x04;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountState {
    pub flags: MountFlags,
    pub mount_dir: Option<PathBuf>,
}

impl MountState {
    /// Mounted read-write and not in use as swap.
    pub fn usable_online(&self) -> bool {
        self.flags.contains(MountFlags::MOUNTED)
            && !self.flags.intersects(MountFlags::READONLY | MountFlags::SWAP)
    }
}

pub trait MountProbe: Send + Sync {
    fn check(&self, device: &Path) -> io::Result<MountState>;
}

/// Reads the kernel's mount table through procfs and the swap table from
/// `/proc/swaps`.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    // A `/proc/<pid>` directory whose `mountinfo` describes our namespace
    proc_dir: PathBuf,
    swaps: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        ProcMounts::with_paths("/proc/self", "/proc/swaps")
    }
}

impl ProcMounts {
    pub fn with_paths(proc_dir: impl Into<PathBuf>, swaps: impl Into<PathBuf>) -> Self {
        ProcMounts {
            proc_dir: proc_dir.into(),
            swaps: swaps.into(),
        }
    }

    fn mountinfo(&self) -> io::Result<Vec<MountInfo>> {
        let infos = Process::new_with_root(self.proc_dir.clone())
            .and_then(|process| process.mountinfo())
            .map_err(io::Error::other)?;
        Ok(infos.0)
    }

    fn swapped(&self, wanted: &Path) -> io::Result<bool> {
        let swaps = match fs::read_to_string(&self.swaps) {
            Ok(swaps) => swaps,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(swaps
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| canonical(Path::new(name)) == wanted))
    }
}

impl MountProbe for ProcMounts {
    fn check(&self, device: &Path) -> io::Result<MountState> {
        let wanted = canonical(device);
        let mut state = MountState::default();

        let mounted = self.mountinfo()?.into_iter().find(|info| {
            info.mount_source
                .as_deref()
                .is_some_and(|source| canonical(Path::new(source)) == wanted)
        });
        if let Some(info) = mounted {
            trace!("{} mounted on {}", device.display(), info.mount_point.display());
            state.flags |= MountFlags::MOUNTED;
            if info.mount_options.contains_key("ro") {
                state.flags |= MountFlags::READONLY;
            }
            state.mount_dir = Some(info.mount_point);
        }

        if self.swapped(&wanted)? {
            state.flags |= MountFlags::SWAP;
        }
        Ok(state)
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
