use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
#[error("Interrupted")]
pub struct InterruptedError;

/// Installs the process signal handler.
///
/// Ctrl+C, SIGTERM and SIGHUP all land here. The handler only flips a flag
/// and wakes waiters; whoever is awaiting input or a model turn decides what
/// to do with it. A second signal before `reset` exits with 130.
///
/// # Errors
/// Returns an error if a handler is already installed.
pub fn init() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(trigger)
}

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

/// Raises the interrupt flag, force-exiting if it was already raised.
pub fn trigger() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }
    notify().notify_waiters();
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Resolves once an interrupt has been raised.
pub async fn wait_for_interrupt() {
    loop {
        // Register before checking the flag so a trigger in between is not lost.
        let notified = notify().notified();
        if is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// Clears the interrupt flag.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Serializes tests that raise the process-wide flag against tests that run
/// the graph. Runners take a read guard; raisers take the write guard.
#[cfg(test)]
pub(crate) static TEST_FLAG: std::sync::LazyLock<tokio::sync::RwLock<()>> =
    std::sync::LazyLock::new(|| tokio::sync::RwLock::new(()));
