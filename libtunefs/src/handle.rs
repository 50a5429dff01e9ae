//! An open filesystem handle.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::error::{Result, TuneError};
use crate::online::ControlRequest;
use crate::ondisk::{IncompatFeatures, SuperBlock, SystemInode, TunefsFlags, Volume};
use crate::registry::HandleId;
use crate::session::Session;
use crate::signals::SignalBlock;

bitflags! {
    /// How a handle is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const RW = 0x01;
        /// The operation can run against a mounted volume.
        const ONLINE = 0x02;
        /// Open even if the volume's cluster stack is not the running one.
        const NOCLUSTER = 0x04;
        /// The operation changes block allocation; verify the global bitmap.
        const ALLOCATION = 0x08;
    }
}

/// How an open handle may touch the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    ReadOnly,
    /// Exclusive access, journals clean.
    Offline,
    /// Mounted; changes go through the control channel.
    Online,
    /// The volume belongs to another cluster stack; no cluster lock held.
    NoClusterStack,
}

/// In-progress markers left in the superblock while an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InProgress {
    Resize,
    Tunefs(TunefsFlags),
}

pub struct FsHandle {
    id: HandleId,
    device: PathBuf,
    flags: OpenFlags,
    outcome: OpenOutcome,
    journal_clusters: u32,
    volume: Box<dyn Volume>,
    session: Session,
    closed: bool,
}

impl FsHandle {
    pub(crate) fn new(
        id: HandleId,
        flags: OpenFlags,
        outcome: OpenOutcome,
        journal_clusters: u32,
        volume: Box<dyn Volume>,
        session: Session,
    ) -> Self {
        FsHandle {
            id,
            device: volume.device().to_path_buf(),
            flags,
            outcome,
            journal_clusters,
            volume,
            session,
            closed: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn outcome(&self) -> OpenOutcome {
        self.outcome
    }

    pub fn is_online(&self) -> bool {
        self.outcome == OpenOutcome::Online
    }

    pub fn max_slots(&self) -> u16 {
        self.volume.super_block().max_slots
    }

    /// Largest journal found when the handle was opened offline.
    pub fn journal_clusters(&self) -> u32 {
        self.journal_clusters
    }

    pub fn super_block(&self) -> &SuperBlock {
        self.volume.super_block()
    }

    pub fn super_block_mut(&mut self) -> &mut SuperBlock {
        self.volume.super_block_mut()
    }

    pub fn write_super(&mut self) -> Result<()> {
        let _block = SignalBlock::new()?;
        self.volume.write_super()?;
        Ok(())
    }

    pub fn volume(&self) -> &dyn Volume {
        &*self.volume
    }

    pub fn volume_mut(&mut self) -> &mut dyn Volume {
        &mut *self.volume
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn interact(&self, question: &str) -> bool {
        self.session.prompter().confirm(question)
    }

    pub fn online_ioctl(&self, request: ControlRequest, payload: &mut [u8]) -> Result<()> {
        if !self.is_online() {
            return Err(TuneError::Internal(format!(
                "\"{}\" is not open online",
                self.device.display()
            )));
        }
        self.session.send_control(request, payload)
    }

    pub fn set_in_progress(&mut self, marker: InProgress) -> Result<()> {
        let sb = self.volume.super_block_mut();
        match marker {
            InProgress::Resize => sb.feature_incompat.insert(IncompatFeatures::RESIZE_INPROG),
            InProgress::Tunefs(flag) => {
                sb.feature_incompat.insert(IncompatFeatures::TUNEFS_INPROG);
                sb.tunefs_flag.insert(flag);
            }
        }
        self.write_super()
    }

    pub fn clear_in_progress(&mut self, marker: InProgress) -> Result<()> {
        let sb = self.volume.super_block_mut();
        match marker {
            InProgress::Resize => sb.feature_incompat.remove(IncompatFeatures::RESIZE_INPROG),
            InProgress::Tunefs(flag) => {
                sb.tunefs_flag.remove(flag);
                if sb.tunefs_flag.is_empty() {
                    sb.feature_incompat.remove(IncompatFeatures::TUNEFS_INPROG);
                }
            }
        }
        self.write_super()
    }

    /// Free clusters according to the global bitmap's chain records.
    pub fn free_clusters(&self) -> Result<u64> {
        let blkno = self
            .volume
            .lookup_system_inode(SystemInode::GlobalBitmap, 0)?;
        let di = self.volume.read_inode(blkno)?;
        Ok(di
            .chain
            .iter()
            .flat_map(|cl| cl.recs.iter())
            .map(|rec| u64::from(rec.free))
            .sum())
    }

    /// Release the handle's locks and descriptors, then the volume. Cleanup
    /// continues past errors; the first one is returned.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        debug!("Closing device \"{}\"", self.device.display());
        let released = self.session.release(self.id);
        let closed = self.volume.close().map_err(TuneError::from);
        match released.and(closed) {
            Ok(()) => {
                debug!("Device closed");
                Ok(())
            }
            Err(e) => {
                debug!("Close of device failed");
                Err(e)
            }
        }
    }
}

impl Drop for FsHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to close \"{}\": {e}", self.device.display());
        }
    }
}

impl std::fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsHandle")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("flags", &self.flags)
            .field("outcome", &self.outcome)
            .finish()
    }
}
