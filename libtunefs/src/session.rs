//! Process-wide state shared by every handle, and the open path.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::access::{AccessCoordinator, LockEnv, LockOutcome};
use crate::cluster::{ClusterStack, FlockStack};
use crate::error::{Result, TuneError};
use crate::handle::{FsHandle, OpenFlags, OpenOutcome};
use crate::mounts::{MountProbe, ProcMounts};
use crate::online::{ControlRequest, OnlineGateway};
use crate::ondisk::{IncompatFeatures, OpenMode, StructError, StructureIo, Volume};
use crate::prompt::Prompter;
use crate::registry::{HandleId, HandleRegistry, Registration};
use crate::signals;
use crate::validate;

pub struct SessionState {
    pub coordinator: AccessCoordinator,
    pub gateway: OnlineGateway,
    pub registry: HandleRegistry,
}

impl SessionState {
    fn teardown(&mut self, reg: Registration) -> Result<()> {
        release_registration(&mut self.coordinator, &mut self.gateway, reg)
    }

    /// Release every registered handle, newest first.
    fn close_all(&mut self) {
        let SessionState {
            coordinator,
            gateway,
            registry,
        } = self;
        registry.close_all(|reg| {
            let device = reg.device.clone();
            debug!("Releasing \"{}\"", device.display());
            if let Err(e) = release_registration(coordinator, gateway, reg) {
                warn!("Failed to release \"{}\": {e}", device.display());
            }
        });
    }
}

fn release_registration(
    coordinator: &mut AccessCoordinator,
    gateway: &mut OnlineGateway,
    mut reg: Registration,
) -> Result<()> {
    if std::mem::take(&mut reg.online) {
        gateway.close();
    }
    coordinator.release(&mut reg.lock)
}

/// Owns the access coordinator, the online gateway and the handle registry
/// for one run of the tool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Mutex<SessionState>>,
    io: Arc<dyn StructureIo>,
    prompter: Prompter,
}

pub struct SessionBuilder {
    io: Arc<dyn StructureIo>,
    stack: Arc<dyn ClusterStack>,
    mounts: Arc<dyn MountProbe>,
    env: LockEnv,
    interactive: bool,
}

impl SessionBuilder {
    pub fn cluster_stack(mut self, stack: Arc<dyn ClusterStack>) -> Self {
        self.stack = stack;
        self
    }

    pub fn mounts(mut self, mounts: Arc<dyn MountProbe>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn lock_env(mut self, env: LockEnv) -> Self {
        self.env = env;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn build(self) -> Session {
        let state = SessionState {
            coordinator: AccessCoordinator::new(self.stack, Arc::clone(&self.mounts), self.env),
            gateway: OnlineGateway::new(self.mounts),
            registry: HandleRegistry::new(),
        };
        Session {
            shared: Arc::new(Mutex::new(state)),
            io: self.io,
            prompter: Prompter::new(self.interactive),
        }
    }
}

impl Session {
    pub fn builder(io: Arc<dyn StructureIo>) -> SessionBuilder {
        SessionBuilder {
            io,
            stack: Arc::new(FlockStack::default()),
            mounts: Arc::new(ProcMounts::default()),
            env: LockEnv::default(),
            interactive: false,
        }
    }

    pub fn prompter(&self) -> &Prompter {
        &self.prompter
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.shared
            .lock()
            .map_err(|_| TuneError::Internal("session state poisoned".to_string()))
    }

    /// Run the emergency teardown when a termination signal arrives.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        signals::install(move || {
            // The interrupted code may hold the state lock; leave it then.
            if let Ok(mut state) = shared.try_lock() {
                state.close_all();
            }
        })
    }

    /// Open `device` and register the handle. A read-write open takes
    /// exclusive access first, then either validates the volume for offline
    /// work or opens the control channel for online work.
    pub fn open(&self, device: &Path, flags: OpenFlags) -> Result<FsHandle> {
        debug!("Opening device \"{}\"", device.display());
        let mode = if flags.contains(OpenFlags::RW) {
            OpenMode::ReadWrite
        } else {
            OpenMode::ReadOnly
        };

        let mut volume = self.io.open(device, mode).map_err(|e| match e {
            StructError::NotFound(_) if !device.exists() => {
                TuneError::DeviceNotFound(device.to_path_buf())
            }
            other => other.into(),
        })?;
        let id = self.state()?.registry.register(device);

        match self.prepare(id, device, &*volume, flags) {
            Ok((outcome, journal_clusters)) => {
                debug!("Device \"{}\" opened: {outcome:?}", device.display());
                Ok(FsHandle::new(
                    id,
                    flags,
                    outcome,
                    journal_clusters,
                    volume,
                    self.clone(),
                ))
            }
            Err(e) => {
                if let Err(release) = self.release(id) {
                    warn!("Failed to release \"{}\": {release}", device.display());
                }
                if let Err(close) = volume.close() {
                    warn!("Failed to close \"{}\": {close}", device.display());
                }
                debug!("Open of device \"{}\" failed", device.display());
                Err(e)
            }
        }
    }

    fn prepare(
        &self,
        id: HandleId,
        device: &Path,
        volume: &dyn Volume,
        flags: OpenFlags,
    ) -> Result<(OpenOutcome, u32)> {
        if !flags.contains(OpenFlags::RW) {
            return Ok((OpenOutcome::ReadOnly, 0));
        }

        let sb = volume.super_block();
        if sb.feature_incompat.contains(IncompatFeatures::HEARTBEAT_DEV) {
            return Err(TuneError::HeartbeatDevice);
        }
        if sb.feature_incompat.contains(IncompatFeatures::RESIZE_INPROG) {
            return Err(TuneError::ResizeInProgress);
        }
        if sb.feature_incompat.contains(IncompatFeatures::TUNEFS_INPROG) {
            return Err(TuneError::TunefsInProgress);
        }

        let lock = {
            let mut state = self.state()?;
            let SessionState {
                coordinator,
                registry,
                ..
            } = &mut *state;
            let reg = registry
                .get_mut(id)
                .ok_or_else(|| TuneError::Internal(format!("handle {} not registered", id.get())))?;
            coordinator.acquire(&mut reg.lock, device, sb, flags)?
        };

        match lock {
            LockOutcome::PerformOnline => {
                let mut state = self.state()?;
                state.gateway.open(device)?;
                if let Some(reg) = state.registry.get_mut(id) {
                    reg.online = true;
                }
                Ok((OpenOutcome::Online, 0))
            }
            LockOutcome::Locked | LockOutcome::NoClusterStack => {
                let journal_clusters = validate::check_journals(volume)?;
                if flags.contains(OpenFlags::ALLOCATION) {
                    validate::check_allocator(volume)?;
                }
                let outcome = if lock == LockOutcome::NoClusterStack {
                    OpenOutcome::NoClusterStack
                } else {
                    OpenOutcome::Offline
                };
                Ok((outcome, journal_clusters))
            }
        }
    }

    /// Deregister `id` and give back what it holds. Unknown ids are a no-op.
    pub(crate) fn release(&self, id: HandleId) -> Result<()> {
        let mut state = self.state()?;
        match state.registry.deregister(id) {
            Some(reg) => state.teardown(reg),
            None => Ok(()),
        }
    }

    pub(crate) fn send_control(&self, request: ControlRequest, payload: &mut [u8]) -> Result<()> {
        self.state()?.gateway.send(request, payload)
    }

    /// Release every registered handle, most recent first.
    pub fn close_all(&self) -> Result<()> {
        self.state()?.close_all();
        Ok(())
    }

    pub fn open_handles(&self) -> Result<Vec<HandleId>> {
        Ok(self.state()?.registry.ids())
    }

    pub fn local_holds(&self) -> Result<usize> {
        Ok(self.state()?.coordinator.local_holds())
    }

    pub fn cluster_locked(&self) -> Result<bool> {
        Ok(self.state()?.coordinator.cluster_locked())
    }

    pub fn online_refs(&self) -> Result<usize> {
        Ok(self.state()?.gateway.refs())
    }
}
