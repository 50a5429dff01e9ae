//! Exclusive access to a volume.
//!
//! Mount-local volumes are claimed with an exclusive open of the device.
//! Clustered volumes take a cluster-wide lock through a [`ClusterStack`].
//! Either way the caller gets one [`LockOutcome`], and the classification is
//! published in the environment so child processes inherit it instead of
//! negotiating the lock again.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::cluster::{ClusterStack, DlmError, DlmSession};
use crate::error::{Result, TuneError};
use crate::handle::OpenFlags;
use crate::mounts::MountProbe;
use crate::ondisk::SuperBlock;
use crate::signals::SignalBlock;

pub const DEFAULT_LOCK_ENV: &str = "_TUNEFS_LOCK";

/// Lock classification handed from a parent process to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockToken {
    /// The parent holds the lock.
    Locked,
    /// The parent decided the work goes through the mounted filesystem.
    Online,
}

impl FromStr for LockToken {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "locked" => Ok(LockToken::Locked),
            "online" => Ok(LockToken::Online),
            other => Err(TuneError::Internal(format!("unknown lock token \"{other}\""))),
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockToken::Locked => write!(f, "locked"),
            LockToken::Online => write!(f, "online"),
        }
    }
}

/// The environment variable carrying a [`LockToken`].
#[derive(Debug, Clone)]
pub struct LockEnv {
    var: String,
}

impl Default for LockEnv {
    fn default() -> Self {
        LockEnv::new(DEFAULT_LOCK_ENV)
    }
}

impl LockEnv {
    pub fn new(var: impl Into<String>) -> Self {
        LockEnv { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }

    /// A value that is neither token counts as no inheritance.
    pub fn inherited(&self) -> Option<LockToken> {
        let value = std::env::var(&self.var).ok()?;
        match value.parse() {
            Ok(token) => Some(token),
            Err(e) => {
                debug!("Ignoring {}: {e}", self.var);
                None
            }
        }
    }

    pub fn publish(&self, token: Option<LockToken>) {
        // SAFETY: the tool is single threaded; nothing reads the environment
        // concurrently with a lock-state transition.
        unsafe {
            match token {
                Some(token) => std::env::set_var(&self.var, token.to_string()),
                None => std::env::remove_var(&self.var),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Exclusive access is held, or was inherited, or is not needed.
    Locked,
    /// The volume is mounted and the operation may run through it.
    PerformOnline,
    /// The volume belongs to a cluster stack other than the running one.
    NoClusterStack,
}

/// What one handle's acquisition actually took, so release gives back
/// exactly that.
#[derive(Default)]
pub struct LockContext {
    dlm: Option<Box<dyn DlmSession>>,
    cluster: bool,
    local: bool,
    published: bool,
}

impl LockContext {
    pub fn holds_anything(&self) -> bool {
        self.dlm.is_some() || self.local || self.published
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("dlm", &self.dlm.is_some())
            .field("cluster", &self.cluster)
            .field("local", &self.local)
            .field("published", &self.published)
            .finish()
    }
}

struct LocalHold {
    _lock: Flock<File>,
    count: usize,
}

/// Process-wide lock state shared by every handle.
pub struct AccessCoordinator {
    local: Option<LocalHold>,
    cluster_locked: bool,
    /// Whether some handle of ours currently owns the published token.
    published: bool,
    env: LockEnv,
    stack: Arc<dyn ClusterStack>,
    mounts: Arc<dyn MountProbe>,
}

impl AccessCoordinator {
    pub fn new(stack: Arc<dyn ClusterStack>, mounts: Arc<dyn MountProbe>, env: LockEnv) -> Self {
        AccessCoordinator {
            local: None,
            cluster_locked: false,
            published: false,
            env,
            stack,
            mounts,
        }
    }

    pub fn env(&self) -> &LockEnv {
        &self.env
    }

    /// References held on the local exclusive descriptor.
    pub fn local_holds(&self) -> usize {
        self.local.as_ref().map_or(0, |hold| hold.count)
    }

    pub fn cluster_locked(&self) -> bool {
        self.cluster_locked
    }

    pub fn acquire(
        &mut self,
        ctx: &mut LockContext,
        device: &Path,
        sb: &SuperBlock,
        flags: OpenFlags,
    ) -> Result<LockOutcome> {
        let outcome = if sb.mount_local() {
            self.lock_local(ctx, device, flags)?
        } else {
            match self.lock_cluster(ctx, sb, flags)? {
                Claim::Fresh(outcome) => outcome,
                Claim::Inherited(outcome) => {
                    debug!("Lock on \"{}\" inherited: {outcome:?}", device.display());
                    return Ok(outcome);
                }
            }
        };

        let token = match outcome {
            LockOutcome::Locked if ctx.local || ctx.cluster => Some(LockToken::Locked),
            LockOutcome::PerformOnline => Some(LockToken::Online),
            _ => None,
        };
        if let (Some(token), false) = (token, self.published) {
            self.env.publish(Some(token));
            self.published = true;
            ctx.published = true;
        }
        debug!("Lock on \"{}\": {outcome:?}", device.display());
        Ok(outcome)
    }

    fn lock_local(
        &mut self,
        ctx: &mut LockContext,
        device: &Path,
        flags: OpenFlags,
    ) -> Result<LockOutcome> {
        if let Some(hold) = self.local.as_mut() {
            hold.count += 1;
            ctx.local = true;
            return Ok(LockOutcome::Locked);
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(device)
        {
            Ok(file) => file,
            Err(e) => return self.classify_local_failure(device, flags, e),
        };
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_file, errno)) => {
                return self.classify_local_failure(device, flags, io::Error::from(errno));
            }
        };

        self.local = Some(LocalHold {
            _lock: lock,
            count: 1,
        });
        ctx.local = true;
        Ok(LockOutcome::Locked)
    }

    /// Someone else holds the device; find out whether it is a mount we can
    /// work through.
    fn classify_local_failure(
        &self,
        device: &Path,
        flags: OpenFlags,
        err: io::Error,
    ) -> Result<LockOutcome> {
        match err.raw_os_error().map(Errno::from_raw) {
            Some(Errno::EBUSY) | Some(Errno::EWOULDBLOCK) => {
                let state = self.mounts.check(device)?;
                if state.usable_online() && flags.contains(OpenFlags::ONLINE) {
                    Ok(LockOutcome::PerformOnline)
                } else {
                    Err(TuneError::DeviceBusy)
                }
            }
            Some(Errno::ENOENT) => Err(TuneError::DeviceNotFound(device.to_path_buf())),
            _ => Err(TuneError::Io(err)),
        }
    }

    fn lock_cluster(
        &mut self,
        ctx: &mut LockContext,
        sb: &SuperBlock,
        flags: OpenFlags,
    ) -> Result<Claim> {
        match self.env.inherited() {
            Some(LockToken::Locked) => return Ok(Claim::Inherited(LockOutcome::Locked)),
            Some(LockToken::Online) if flags.contains(OpenFlags::ONLINE) => {
                return Ok(Claim::Inherited(LockOutcome::PerformOnline));
            }
            _ => {}
        }

        self.stack.init()?;
        let mut session = match self.stack.connect(sb) {
            Ok(session) => session,
            Err(DlmError::StackMismatch { running, found })
                if flags.contains(OpenFlags::NOCLUSTER) =>
            {
                debug!("Volume stack \"{found}\" differs from running \"{running}\"");
                return Ok(Claim::Fresh(LockOutcome::NoClusterStack));
            }
            Err(e) => return Err(e.into()),
        };

        if flags.contains(OpenFlags::NOCLUSTER) {
            // Right cluster, nothing to lock.
            ctx.dlm = Some(session);
            return Ok(Claim::Fresh(LockOutcome::Locked));
        }

        let locked = {
            let _block = SignalBlock::new()?;
            session.lock_down()
        };
        match locked {
            Ok(()) => {
                ctx.dlm = Some(session);
                ctx.cluster = true;
                self.cluster_locked = true;
                Ok(Claim::Fresh(LockOutcome::Locked))
            }
            Err(DlmError::TrylockFailed) if flags.contains(OpenFlags::ONLINE) => {
                ctx.dlm = Some(session);
                Ok(Claim::Fresh(LockOutcome::PerformOnline))
            }
            Err(e) => {
                if let Err(shutdown) = session.shutdown() {
                    warn!("Failed to shut down lock session: {shutdown}");
                }
                Err(e.into())
            }
        }
    }

    /// Give back what `ctx` took. Safe on a context that took nothing.
    pub fn release(&mut self, ctx: &mut LockContext) -> Result<()> {
        let mut result = Ok(());

        if std::mem::take(&mut ctx.local) {
            if let Some(hold) = self.local.as_mut() {
                hold.count -= 1;
                if hold.count == 0 {
                    self.local = None;
                }
            }
        }

        if let Some(mut session) = ctx.dlm.take() {
            if std::mem::take(&mut ctx.cluster) && self.cluster_locked {
                let released = match SignalBlock::new() {
                    Ok(_block) => session.release().map_err(TuneError::from),
                    Err(e) => Err(e),
                };
                self.cluster_locked = false;
                if let Err(e) = released {
                    result = Err(e);
                }
            }
            if let Err(e) = session.shutdown() {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        if std::mem::take(&mut ctx.published) {
            self.env.publish(None);
            self.published = false;
        }

        result
    }
}

enum Claim {
    Fresh(LockOutcome),
    /// Settled by a token a parent process left in the environment.
    Inherited(LockOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{MountFlags, MountState};

    #[test]
    fn test_token_parse_and_display() {
        assert_eq!("locked".parse::<LockToken>().unwrap(), LockToken::Locked);
        assert_eq!("online".parse::<LockToken>().unwrap(), LockToken::Online);
        assert!("LOCKED".parse::<LockToken>().is_err());
        assert_eq!(LockToken::Online.to_string(), "online");
    }

    struct Unmounted;

    impl MountProbe for Unmounted {
        fn check(&self, _device: &Path) -> io::Result<MountState> {
            Ok(MountState {
                flags: MountFlags::empty(),
                mount_dir: None,
            })
        }
    }

    struct NoStack;

    impl ClusterStack for NoStack {
        fn init(&self) -> std::result::Result<(), DlmError> {
            Err(DlmError::Unavailable("not in a cluster".to_string()))
        }

        fn connect(&self, _sb: &SuperBlock) -> std::result::Result<Box<dyn DlmSession>, DlmError> {
            Err(DlmError::Unavailable("not in a cluster".to_string()))
        }
    }

    fn coordinator() -> AccessCoordinator {
        AccessCoordinator::new(
            Arc::new(NoStack),
            Arc::new(Unmounted),
            LockEnv::new("_TUNEFS_LOCK_ACCESS_UNIT"),
        )
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let mut coord = coordinator();
        let mut ctx = LockContext::default();
        coord.release(&mut ctx).unwrap();
        coord.release(&mut ctx).unwrap();
        assert_eq!(coord.local_holds(), 0);
        assert!(!coord.cluster_locked());
    }

    #[test]
    fn test_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator();
        let mut ctx = LockContext::default();
        let sb = crate::ondisk::image::ImageBuilder::new().build().super_block;

        let err = coord
            .acquire(&mut ctx, &dir.path().join("absent"), &sb, OpenFlags::RW)
            .unwrap_err();
        assert!(matches!(err, TuneError::DeviceNotFound(_)));
        assert!(!ctx.holds_anything());
    }
}
