//! Drives one maintenance operation from argument parsing to the final
//! close.
//!
//! The runner opens a *master* handle read-write to settle the lock
//! classification and validate the volume, then an *operation* handle whose
//! flags follow that classification. The operation body runs against the
//! second handle. Both are always closed, operation handle first, and the
//! first error wins.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use tracing::{debug, error, info, trace};

use crate::error::{Result, TuneError};
use crate::handle::{FsHandle, OpenFlags, OpenOutcome};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ParseArgs,
    OpenMaster,
    ClassifyMode,
    OpenOperationHandle,
    RunBody,
    CloseOperation,
    CloseMaster,
    Done,
}

/// What an operation body did to the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    /// Already in the requested state; nothing written.
    Unchanged,
    /// The operator answered no.
    Declined,
}

pub trait Operation {
    fn name(&self) -> &str;

    fn open_flags(&self) -> OpenFlags;

    /// Takes the single optional argument following the device. Operations
    /// without one reject anything given.
    fn parse_option(&mut self, arg: Option<&str>) -> Result<()> {
        match arg {
            None => Ok(()),
            Some(arg) => Err(TuneError::InvalidArgument(format!(
                "operation \"{}\" takes no argument, got \"{arg}\"",
                self.name()
            ))),
        }
    }

    fn run(&mut self, fs: &mut FsHandle, flags: OpenFlags) -> Result<Change>;
}

pub struct Runner {
    session: Session,
}

impl Runner {
    pub fn new(session: Session) -> Self {
        Runner { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn execute(
        &self,
        device: &Path,
        args: &[String],
        op: &mut dyn Operation,
    ) -> anyhow::Result<Change> {
        let mut stage = Stage::Init;
        let name = op.name().to_string();

        advance(&mut stage, Stage::ParseArgs);
        if args.len() > 1 {
            return Err(anyhow!(
                "Too many arguments for operation \"{name}\" on device \"{}\"",
                device.display()
            ));
        }
        op.parse_option(args.first().map(String::as_str))
            .with_context(|| {
                format!(
                    "Invalid arguments for operation \"{name}\" on device \"{}\"",
                    device.display()
                )
            })?;

        advance(&mut stage, Stage::OpenMaster);
        let master = self
            .session
            .open(device, op.open_flags() | OpenFlags::RW)
            .with_context(|| {
                format!(
                    "Unable to open device \"{}\" read-write for operation \"{name}\"",
                    device.display()
                )
            })?;

        advance(&mut stage, Stage::ClassifyMode);
        let flags = classify(op.open_flags(), master.outcome());

        advance(&mut stage, Stage::OpenOperationHandle);
        let mut op_fs = match self.session.open(device, flags) {
            Ok(fs) => fs,
            Err(e) => {
                let err = anyhow::Error::from(e).context(format!(
                    "Unable to open device \"{}\" for operation \"{name}\"",
                    device.display()
                ));
                advance(&mut stage, Stage::CloseMaster);
                return close_master(master, device, &name, Err(err));
            }
        };

        advance(&mut stage, Stage::RunBody);
        let mut result = op.run(&mut op_fs, flags).with_context(|| {
            format!(
                "Operation \"{name}\" failed on device \"{}\"",
                device.display()
            )
        });

        advance(&mut stage, Stage::CloseOperation);
        if let Err(e) = op_fs.close() {
            let e = anyhow::Error::from(e).context(format!(
                "while closing device \"{}\" for operation \"{name}\"",
                device.display()
            ));
            result = result.and(Err(e));
        }

        advance(&mut stage, Stage::CloseMaster);
        let result = close_master(master, device, &name, result);

        advance(&mut stage, Stage::Done);
        if let Ok(change) = &result {
            debug!("Operation \"{name}\" finished: {change:?}");
        }
        result
    }

    /// Run `op` and turn the outcome into the process exit status.
    pub fn main(&self, device: &Path, args: &[String], op: &mut dyn Operation) -> ExitCode {
        match self.execute(device, args, op) {
            Ok(Change::Declined) => {
                info!("Operation \"{}\" cancelled", op.name());
                ExitCode::SUCCESS
            }
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

/// Flags for the operation handle: the operation's own, with ONLINE and
/// NOCLUSTER replaced by what the master open found.
pub fn classify(op_flags: OpenFlags, master: OpenOutcome) -> OpenFlags {
    let mut flags = op_flags - (OpenFlags::ONLINE | OpenFlags::NOCLUSTER);
    match master {
        OpenOutcome::Online => flags |= OpenFlags::ONLINE,
        OpenOutcome::NoClusterStack => flags |= OpenFlags::NOCLUSTER,
        OpenOutcome::Offline | OpenOutcome::ReadOnly => {}
    }
    flags
}

/// The master holds the lock, so it always goes last.
fn close_master<T>(
    master: FsHandle,
    device: &Path,
    name: &str,
    result: anyhow::Result<T>,
) -> anyhow::Result<T> {
    match master.close() {
        Ok(()) => result,
        Err(e) => {
            let e = anyhow::Error::from(e).context(format!(
                "while closing device \"{}\" after operation \"{name}\"",
                device.display()
            ));
            result.and(Err(e))
        }
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    trace!("{stage:?} -> {next:?}");
    *stage = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_follows_master() {
        let op = OpenFlags::RW | OpenFlags::ONLINE | OpenFlags::ALLOCATION;
        assert_eq!(
            classify(op, OpenOutcome::Offline),
            OpenFlags::RW | OpenFlags::ALLOCATION
        );
        assert_eq!(classify(op, OpenOutcome::Online), op);
        assert_eq!(
            classify(OpenFlags::RW | OpenFlags::NOCLUSTER, OpenOutcome::Online),
            OpenFlags::RW | OpenFlags::ONLINE
        );
        assert_eq!(
            classify(OpenFlags::RW, OpenOutcome::NoClusterStack),
            OpenFlags::RW | OpenFlags::NOCLUSTER
        );
    }
}
