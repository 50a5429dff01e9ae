//! Termination-signal handling.
//!
//! A caught termination signal runs the installed teardown hook, which
//! closes every registered handle, and then exits. [`SignalBlock`] keeps
//! signals out of lock-state transitions and superblock writes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction,
};
use tracing::error;

use crate::error::Result;

type Teardown = Box<dyn Fn() + Send + Sync>;

static TEARDOWN: Mutex<Option<Teardown>> = Mutex::new(None);
static FAULT_SEEN: AtomicBool = AtomicBool::new(false);

const CAUGHT: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    /// Close every registered handle, then exit with status 1.
    Teardown,
    /// Abort on the spot, no cleanup.
    Abort,
}

/// What to do with `sig`; `fault_seen` says whether a fault was already
/// handled once.
pub fn disposition(sig: Signal, fault_seen: bool) -> SignalAction {
    match sig {
        Signal::SIGQUIT => SignalAction::Abort,
        Signal::SIGTERM | Signal::SIGINT | Signal::SIGHUP => SignalAction::Teardown,
        Signal::SIGSEGV if fault_seen => SignalAction::Abort,
        Signal::SIGSEGV => SignalAction::Teardown,
        _ => SignalAction::Ignore,
    }
}

extern "C" fn handle_signal(signo: libc::c_int) {
    let Ok(sig) = Signal::try_from(signo) else {
        return;
    };
    let fault_seen = sig == Signal::SIGSEGV && FAULT_SEEN.swap(true, Ordering::SeqCst);

    match disposition(sig, fault_seen) {
        SignalAction::Ignore => error!("Caught signal {sig}, ignoring"),
        SignalAction::Abort => {
            if fault_seen {
                error!("Segmentation fault loop detected");
            }
            std::process::abort();
        }
        SignalAction::Teardown => {
            error!("Caught signal {sig}, exiting");
            // The interrupted frame may hold the lock; skip teardown then.
            if let Ok(guard) = TEARDOWN.try_lock() {
                if let Some(teardown) = guard.as_ref() {
                    teardown();
                }
            }
            std::process::exit(1);
        }
    }
}

/// Route termination signals to `teardown` and ignore SIGPIPE.
pub fn install(teardown: impl Fn() + Send + Sync + 'static) -> Result<()> {
    if let Ok(mut slot) = TEARDOWN.lock() {
        *slot = Some(Box::new(teardown));
    }

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only touches statics and process-exit primitives,
    // and the process is single threaded when signals are installed.
    unsafe {
        for sig in CAUGHT {
            sigaction(sig, &action)?;
        }
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Drop the teardown hook, e.g. after every handle has been closed.
pub fn uninstall() {
    if let Ok(mut slot) = TEARDOWN.lock() {
        *slot = None;
    }
}

/// Blocks every signal but SIGTRAP and SIGSEGV until dropped.
#[must_use = "signals are unblocked as soon as the guard is dropped"]
pub struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    pub fn new() -> Result<Self> {
        let mut blocked = SigSet::all();
        blocked.remove(Signal::SIGTRAP);
        blocked.remove(Signal::SIGSEGV);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;
        Ok(SignalBlock { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            error!("Failed to restore signal mask: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition() {
        assert_eq!(disposition(Signal::SIGQUIT, false), SignalAction::Abort);
        assert_eq!(disposition(Signal::SIGINT, false), SignalAction::Teardown);
        assert_eq!(disposition(Signal::SIGTERM, true), SignalAction::Teardown);
        assert_eq!(disposition(Signal::SIGHUP, false), SignalAction::Teardown);
        assert_eq!(disposition(Signal::SIGSEGV, false), SignalAction::Teardown);
        assert_eq!(disposition(Signal::SIGSEGV, true), SignalAction::Abort);
        assert_eq!(disposition(Signal::SIGUSR1, false), SignalAction::Ignore);
    }

    #[test]
    fn test_block_restores_mask() {
        let current = || SigSet::thread_get_mask().unwrap();
        let before = current();
        {
            let _block = SignalBlock::new().unwrap();
            let during = current();
            assert!(during.contains(Signal::SIGINT));
            assert!(during.contains(Signal::SIGTERM));
            assert!(!during.contains(Signal::SIGSEGV));
            assert!(!during.contains(Signal::SIGTRAP));
        }
        assert_eq!(current().contains(Signal::SIGINT), before.contains(Signal::SIGINT));
    }
}
