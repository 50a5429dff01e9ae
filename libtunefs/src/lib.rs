//! Safe on-disk mutation for a clustered shared-disk filesystem.
//!
//! Every maintenance operation goes through the same path: take exclusive
//! access to the device (or learn that the work must run through the
//! mounted filesystem), validate the metadata it is about to trust, run the
//! body and release everything in reverse order, even under signals.

pub mod access;
pub mod cluster;
pub mod error;
pub mod feature;
pub mod features;
pub mod handle;
pub mod mounts;
pub mod ondisk;
pub mod online;
pub mod probe;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod session;
pub mod signals;
pub mod validate;

pub use access::{LockEnv, LockOutcome, LockToken};
pub use error::{ChainFault, Result, TuneError};
pub use handle::{FsHandle, OpenFlags, OpenOutcome};
pub use runner::{Change, Operation, Runner};
pub use session::Session;
