use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::DlmError;
use crate::ondisk::{StructError, SystemInode};

pub type Result<T> = std::result::Result<T, TuneError>;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("device is busy")]
    DeviceBusy,

    #[error("device \"{0}\" not found")]
    DeviceNotFound(PathBuf),

    #[error("device is not mounted read-write")]
    NotMounted,

    #[error("journal for slot {slot} is dirty, run fsck first")]
    JournalDirty { slot: u16 },

    #[error("{allocator} allocator is corrupt at block {block}: {fault}")]
    CorruptChain {
        allocator: SystemInode,
        block: u64,
        fault: ChainFault,
    },

    #[error("not enough free space: {needed} clusters needed, {free} free")]
    NoSpace { needed: u64, free: u64 },

    #[error("volume is a heartbeat device")]
    HeartbeatDevice,

    #[error("a resize operation was interrupted on this volume, run fsck first")]
    ResizeInProgress,

    #[error("a tunefs operation was interrupted on this volume, run fsck first")]
    TunefsInProgress,

    #[error("online operation failed: {0}")]
    OnlineFailed(#[source] nix::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid number \"{0}\"")]
    InvalidNumber(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Dlm(#[from] DlmError),

    #[error(transparent)]
    Struct(#[from] StructError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for TuneError {
    fn from(errno: nix::Error) -> Self {
        TuneError::Io(std::io::Error::from(errno))
    }
}

/// What exactly is wrong with a chain-group descriptor or chain record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainFault {
    BadParent { expected: u64, found: u64 },
    BadChainIndex { expected: u16, found: u16 },
    FreeCountMismatch { counted: u32, stored: u16 },
    CapacityExceeded { bits: u16, size: u16 },
    FreeExceedsTotal { free: u16, total: u16 },
    ChainTotalsMismatch {
        chain: u16,
        counted_total: u32,
        counted_free: u32,
        stored_total: u32,
        stored_free: u32,
    },
    Cycle,
    NoChainList,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainFault::BadParent { expected, found } => {
                write!(f, "parent inode {found}, expected {expected}")
            }
            ChainFault::BadChainIndex { expected, found } => {
                write!(f, "chain index {found}, expected {expected}")
            }
            ChainFault::FreeCountMismatch { counted, stored } => {
                write!(f, "{counted} free bits counted, {stored} recorded")
            }
            ChainFault::CapacityExceeded { bits, size } => {
                write!(f, "{bits} bits do not fit in {size} bytes of bitmap")
            }
            ChainFault::FreeExceedsTotal { free, total } => {
                write!(f, "{free} free bits out of {total}")
            }
            ChainFault::ChainTotalsMismatch {
                chain,
                counted_total,
                counted_free,
                stored_total,
                stored_free,
            } => write!(
                f,
                "chain {chain} counts {counted_total}/{counted_free} total/free bits, \
                 record says {stored_total}/{stored_free}"
            ),
            ChainFault::Cycle => write!(f, "group chain loops back on itself"),
            ChainFault::NoChainList => write!(f, "inode carries no chain list"),
        }
    }
}
