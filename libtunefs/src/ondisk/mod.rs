//! Structural I/O interface.
//!
//! The maintenance core never decodes raw blocks itself. It talks to a
//! [`StructureIo`] provider that opens a device and hands back a [`Volume`],
//! an opaque read/write/lookup API over superblock, inodes and chain-group
//! descriptors. [`image`] ships one provider backed by a volume image file.

pub mod image;

use std::fmt;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cluster stack assumed for clustered volumes that do not record one.
pub const DEFAULT_CLUSTER_STACK: &str = "o2cb";

#[derive(Debug, Error)]
pub enum StructError {
    #[error("bad magic number in volume image")]
    BadMagic,

    #[error("short read: volume image holds {0} bytes")]
    ShortRead(u64),

    #[error("no space left in the global bitmap")]
    NoSpace,

    #[error("{0} not found")]
    NotFound(String),

    #[error("block {blkno} is not a {expected}")]
    WrongRecord { blkno: u64, expected: &'static str },

    #[error("chain allocator at block {0} is corrupt")]
    CorruptChain(u64),

    #[error("volume is opened read-only")]
    ReadOnly,

    #[error("failed to decode volume image: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Incompatible feature bits recorded in the superblock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct IncompatFeatures: u32 {
        const HEARTBEAT_DEV = 0x0002;
        const RESIZE_INPROG = 0x0004;
        const LOCAL_MOUNT = 0x0008;
        const TUNEFS_INPROG = 0x0020;
        const INLINE_DATA = 0x0040;
        const USERSPACE_STACK = 0x0080;
    }
}

bitflags! {
    /// Which tunefs operation left the TUNEFS_INPROG marker behind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TunefsFlags: u16 {
        const REMOVE_SLOT = 0x0001;
        const CHAIN_RESIZE = 0x0002;
        const JOURNAL_RESIZE = 0x0004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DynFeatures: u16 {
        const INLINE_DATA = 0x0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct JournalFlags: u32 {
        const DIRTY = 0x0001;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub stack: String,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub uuid: [u8; 16],
    pub label: String,
    pub block_size_bits: u8,
    pub cluster_size_bits: u8,
    pub max_slots: u16,
    pub feature_incompat: IncompatFeatures,
    pub tunefs_flag: TunefsFlags,
    pub cluster_info: Option<ClusterInfo>,
}

impl SuperBlock {
    /// Single-node volumes are protected by a local exclusive open rather
    /// than the cluster lock manager.
    pub fn mount_local(&self) -> bool {
        self.feature_incompat.contains(IncompatFeatures::LOCAL_MOUNT)
    }

    pub fn stack_name(&self) -> &str {
        self.cluster_info
            .as_ref()
            .map(|info| info.stack.as_str())
            .unwrap_or(DEFAULT_CLUSTER_STACK)
    }

    pub fn uuid_hex(&self) -> String {
        self.uuid.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn block_size(&self) -> u64 {
        1 << self.block_size_bits
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_size_bits
    }

    /// Bytes to whole clusters, rounding up through blocks.
    pub fn clusters_in_bytes(&self, bytes: u64) -> u64 {
        let blocks = bytes.div_ceil(self.block_size());
        let shift = self.cluster_size_bits.saturating_sub(self.block_size_bits);
        let blocks_per_cluster = 1u64 << shift;
        blocks.div_ceil(blocks_per_cluster)
    }
}

/// Well-known system inodes located through the system directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SystemInode {
    GlobalBitmap,
    Journal,
}

impl SystemInode {
    /// Global system inodes ignore the slot.
    pub fn is_global(self) -> bool {
        matches!(self, SystemInode::GlobalBitmap)
    }

    pub fn file_name(self, slot: u16) -> String {
        match self {
            SystemInode::GlobalBitmap => "global_bitmap".to_string(),
            SystemInode::Journal => format!("journal:{slot:04}"),
        }
    }
}

impl fmt::Display for SystemInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemInode::GlobalBitmap => write!(f, "global bitmap"),
            SystemInode::Journal => write!(f, "journal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRec {
    pub blkno: u64,
    pub total: u32,
    pub free: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainList {
    pub recs: Vec<ChainRec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub blkno: u64,
    pub mode: u32,
    pub clusters: u32,
    pub dyn_features: DynFeatures,
    pub journal_flags: JournalFlags,
    pub chain: Option<ChainList>,
}

impl Dinode {
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn journal_dirty(&self) -> bool {
        self.journal_flags.contains(JournalFlags::DIRTY)
    }
}

/// One chain-group descriptor: a contiguous range of bits in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub blkno: u64,
    /// Bytes of bitmap storage in this descriptor.
    pub size: u16,
    pub bits: u16,
    pub free_bits_count: u16,
    pub parent_dinode: u64,
    pub chain: u16,
    /// Zero terminates the chain.
    pub next_group: u64,
    pub bitmap: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

pub trait StructureIo: Send + Sync {
    fn open(&self, device: &Path, mode: OpenMode) -> Result<Box<dyn Volume>, StructError>;
}

/// An open session on one device, as seen through the structural layer.
pub trait Volume: Send {
    fn device(&self) -> &Path;

    fn super_block(&self) -> &SuperBlock;

    fn super_block_mut(&mut self) -> &mut SuperBlock;

    fn write_super(&mut self) -> Result<(), StructError>;

    fn lookup_system_inode(&self, kind: SystemInode, slot: u16) -> Result<u64, StructError>;

    fn read_inode(&self, blkno: u64) -> Result<Dinode, StructError>;

    fn read_group_desc(&self, blkno: u64) -> Result<GroupDesc, StructError>;

    /// Size the journal inode at `blkno` to `clusters` and mark it clean.
    fn make_journal(&mut self, blkno: u64, clusters: u32) -> Result<(), StructError>;

    fn for_each_inode(
        &self,
        f: &mut dyn FnMut(&Dinode) -> Result<(), StructError>,
    ) -> Result<(), StructError>;

    /// Move the inline data of one inode into a freshly allocated extent.
    fn convert_inline_data(&mut self, blkno: u64) -> Result<(), StructError>;

    /// Flush and release the device. Calling it twice is harmless.
    fn close(&mut self) -> Result<(), StructError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn super_block() -> SuperBlock {
        SuperBlock {
            uuid: [0xAB; 16],
            label: "vol".to_string(),
            block_size_bits: 12,
            cluster_size_bits: 16,
            max_slots: 4,
            feature_incompat: IncompatFeatures::LOCAL_MOUNT,
            tunefs_flag: TunefsFlags::empty(),
            cluster_info: None,
        }
    }

    #[test]
    fn test_clusters_in_bytes_rounds_up() {
        let sb = super_block();
        assert_eq!(sb.clusters_in_bytes(0), 0);
        assert_eq!(sb.clusters_in_bytes(1), 1);
        assert_eq!(sb.clusters_in_bytes(64 * 1024), 1);
        assert_eq!(sb.clusters_in_bytes(64 * 1024 + 1), 2);
        assert_eq!(sb.clusters_in_bytes(8 * 1024 * 1024), 128);
    }

    #[test]
    fn test_stack_name_defaults_to_o2cb() {
        let mut sb = super_block();
        assert!(sb.mount_local());
        assert_eq!(sb.stack_name(), DEFAULT_CLUSTER_STACK);
        sb.cluster_info = Some(ClusterInfo {
            stack: "pcmk".to_string(),
            cluster: "alpha".to_string(),
        });
        assert_eq!(sb.stack_name(), "pcmk");
        assert_eq!(sb.uuid_hex().len(), 32);
    }

    #[test]
    fn test_system_inode_names() {
        assert_eq!(SystemInode::GlobalBitmap.file_name(3), "global_bitmap");
        assert_eq!(SystemInode::Journal.file_name(3), "journal:0003");
    }
}
