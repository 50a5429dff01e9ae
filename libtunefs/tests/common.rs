#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libtunefs::cluster::{ClusterStack, DlmError, DlmSession, FlockStack};
use libtunefs::mounts::{MountFlags, MountProbe, MountState};
use libtunefs::ondisk::SuperBlock;
use libtunefs::ondisk::image::{ImageBuilder, ImageIo, VolumeImage};
use libtunefs::{LockEnv, Session};
use nix::fcntl::{Flock, FlockArg};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub device: PathBuf,
    pub image: VolumeImage,
}

impl Fixture {
    pub fn new(builder: ImageBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("volume.img");
        let image = builder.write_to(&device).unwrap();
        Fixture { dir, device, image }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.dir.path().join("locks")
    }

    pub fn mount_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("mnt");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn bytes(&self) -> Vec<u8> {
        std::fs::read(&self.device).unwrap()
    }

    pub fn reload(&self) -> VolumeImage {
        VolumeImage::load(&self.device).unwrap()
    }
}

/// A mount table that always answers the same.
pub struct StaticMounts(pub MountState);

impl StaticMounts {
    pub fn unmounted() -> Arc<Self> {
        Arc::new(StaticMounts(MountState::default()))
    }

    pub fn mounted_rw(dir: &Path) -> Arc<Self> {
        Arc::new(StaticMounts(MountState {
            flags: MountFlags::MOUNTED,
            mount_dir: Some(dir.to_path_buf()),
        }))
    }
}

impl MountProbe for StaticMounts {
    fn check(&self, _device: &Path) -> io::Result<MountState> {
        Ok(self.0.clone())
    }
}

/// Cluster stack wrapper that records session shutdowns in order, and
/// optionally appends each to a file so another process can read them.
pub struct RecordingStack {
    inner: FlockStack,
    next: Mutex<u32>,
    log: Option<PathBuf>,
    pub shutdowns: Arc<Mutex<Vec<u32>>>,
}

impl RecordingStack {
    pub fn new(inner: FlockStack) -> Self {
        RecordingStack {
            inner,
            next: Mutex::new(0),
            log: None,
            shutdowns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_log(inner: FlockStack, log: &Path) -> Self {
        RecordingStack {
            log: Some(log.to_path_buf()),
            ..RecordingStack::new(inner)
        }
    }
}

struct RecordingSession {
    id: u32,
    inner: Box<dyn DlmSession>,
    log: Option<PathBuf>,
    shutdowns: Arc<Mutex<Vec<u32>>>,
}

impl ClusterStack for RecordingStack {
    fn init(&self) -> Result<(), DlmError> {
        self.inner.init()
    }

    fn connect(&self, sb: &SuperBlock) -> Result<Box<dyn DlmSession>, DlmError> {
        let inner = self.inner.connect(sb)?;
        let mut next = self.next.lock().unwrap();
        *next += 1;
        Ok(Box::new(RecordingSession {
            id: *next,
            inner,
            log: self.log.clone(),
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

impl DlmSession for RecordingSession {
    fn lock_down(&mut self) -> Result<(), DlmError> {
        self.inner.lock_down()
    }

    fn release(&mut self) -> Result<(), DlmError> {
        self.inner.release()
    }

    fn shutdown(self: Box<Self>) -> Result<(), DlmError> {
        self.shutdowns.lock().unwrap().push(self.id);
        if let Some(log) = &self.log {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .unwrap();
            writeln!(file, "{}", self.id).unwrap();
        }
        self.inner.shutdown()
    }
}

pub fn session(
    stack: Arc<dyn ClusterStack>,
    mounts: Arc<dyn MountProbe>,
    lock_env: &str,
) -> Session {
    Session::builder(Arc::new(ImageIo))
        .cluster_stack(stack)
        .mounts(mounts)
        .lock_env(LockEnv::new(lock_env))
        .build()
}

/// A session for a mount-local, unmounted volume.
pub fn local_session(fixture: &Fixture, lock_env: &str) -> Session {
    session(
        Arc::new(FlockStack::new(fixture.lock_dir(), "o2cb")),
        StaticMounts::unmounted(),
        lock_env,
    )
}

/// Hold an exclusive flock on `path` from an unrelated descriptor, the way
/// another process would.
pub fn hold_flock(path: &Path) -> Flock<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap();
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, e)) => panic!("could not lock {}: {e}", path.display()),
    }
}

pub fn try_flock(path: &Path) -> bool {
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok()
}
