mod common;

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use common::*;
use libtunefs::OpenFlags;
use libtunefs::cluster::FlockStack;
use libtunefs::ondisk::image::ImageBuilder;
use libtunefs::probe::probe;
use nix::sys::signal::{Signal, raise};
use serial_test::serial;

const CHILD_DIR_ENV: &str = "_TUNEFS_TEST_SIGTERM_CHILD_DIR";

/// Runs in the re-executed test binary: open two handles, then take SIGTERM.
fn sigterm_child(dir: &Path) {
    let device = dir.join("volume.img");
    ImageBuilder::new()
        .cluster_stack("o2cb", "alpha")
        .write_to(&device)
        .unwrap();
    let stack = RecordingStack::with_log(
        FlockStack::new(dir.join("locks"), "o2cb"),
        &dir.join("shutdowns"),
    );
    let session = session(
        Arc::new(stack),
        StaticMounts::unmounted(),
        "_TUNEFS_TEST_SIGTERM_CHILD",
    );

    let flags = OpenFlags::RW | OpenFlags::NOCLUSTER;
    let _first = session.open(&device, flags).unwrap();
    let _second = session.open(&device, flags).unwrap();
    session.install_signal_handlers().unwrap();
    raise(Signal::SIGTERM).unwrap();
    panic!("SIGTERM did not end the process");
}

#[test]
fn test_sigterm_releases_newest_first() {
    if let Some(dir) = std::env::var_os(CHILD_DIR_ENV) {
        sigterm_child(Path::new(&dir));
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "test_sigterm_releases_newest_first",
            "--test-threads=1",
            "--nocapture",
        ])
        .env(CHILD_DIR_ENV, dir.path())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));

    let order = std::fs::read_to_string(dir.path().join("shutdowns")).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["2", "1"]);
}

#[test]
#[serial]
fn test_close_all_releases_newest_first() {
    let fx = Fixture::new(ImageBuilder::new().cluster_stack("o2cb", "alpha"));
    let stack = Arc::new(RecordingStack::new(FlockStack::new(fx.lock_dir(), "o2cb")));
    let shutdowns = Arc::clone(&stack.shutdowns);
    let session = session(stack, StaticMounts::unmounted(), "_TUNEFS_TEST_TEARDOWN");

    let flags = OpenFlags::RW | OpenFlags::NOCLUSTER;
    let first = session.open(&fx.device, flags).unwrap();
    let second = session.open(&fx.device, flags).unwrap();
    let third = session.open(&fx.device, flags).unwrap();
    assert_eq!(
        session.open_handles().unwrap(),
        vec![third.id(), second.id(), first.id()]
    );

    session.close_all().unwrap();
    assert_eq!(*shutdowns.lock().unwrap(), vec![3, 2, 1]);
    assert!(session.open_handles().unwrap().is_empty());

    // The handles outlive the teardown; closing them again is harmless.
    second.close().unwrap();
    drop(first);
    drop(third);
    assert_eq!(shutdowns.lock().unwrap().len(), 3);
}

#[test]
#[serial]
fn test_close_all_drops_local_lock() {
    let fx = Fixture::new(ImageBuilder::new());
    let var = "_TUNEFS_TEST_TEARDOWN_LOCAL";
    let session = local_session(&fx, var);

    let master = session.open(&fx.device, OpenFlags::RW).unwrap();
    let op = session.open(&fx.device, OpenFlags::RW).unwrap();
    assert_eq!(session.local_holds().unwrap(), 2);

    session.close_all().unwrap();
    assert_eq!(session.local_holds().unwrap(), 0);
    assert!(try_flock(&fx.device));
    assert!(std::env::var_os(var).is_none());

    op.close().unwrap();
    master.close().unwrap();
}

#[test]
#[serial]
fn test_probe_modes() {
    let fx = Fixture::new(ImageBuilder::new().cluster_stack("pcmk", "alpha"));
    let session = local_session(&fx, "_TUNEFS_TEST_PROBE");

    let report = probe(&session, &fx.device);
    assert_eq!(report.entries.len(), 4);
    assert!(!report.all_opened());

    let text = report.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].ends_with("read-only... success"), "{text}");
    assert!(lines[1].contains("read-write... failed:"), "{text}");
    assert!(
        lines[2].ends_with(
            "for an online operation... failed: \
             volume uses cluster stack \"pcmk\" but \"o2cb\" is running"
        ),
        "{text}"
    );
    assert!(
        lines[3].ends_with("expected cluster stack mismatch found"),
        "{text}"
    );
    assert!(session.open_handles().unwrap().is_empty());
}
