//! Scoped stderr suppression.
//!
//! Subprocess-backed tools and the libraries behind them like to print
//! progress noise straight to fd 2, which would tear through the chat output.
//! [`suppress_stderr`] points fd 2 at the null device until the returned guard
//! drops. Guards nest; the original descriptor comes back when the last one
//! goes away, including during unwinding.
//!
//! Output meant for the user while a tool runs goes through [`console`],
//! which writes to a private copy of the original stderr and is therefore
//! unaffected by suppression.

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock, PoisonError};

#[derive(Debug, Default)]
struct QuietState {
    depth: usize,
    #[cfg(unix)]
    saved_fd: Option<libc::c_int>,
}

static STATE: Mutex<QuietState> = Mutex::new(QuietState {
    depth: 0,
    #[cfg(unix)]
    saved_fd: None,
});

static CONSOLE: OnceLock<Option<File>> = OnceLock::new();

/// Restores stderr on drop.
#[must_use = "stderr is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct StderrGuard {
    _private: (),
}

/// Silences fd 2 until the returned guard is dropped.
///
/// Failure to redirect is logged and otherwise ignored: output stays visible
/// but the caller is not affected.
pub fn suppress_stderr() -> StderrGuard {
    // The console copy must be taken from the real stderr, before fd 2 moves.
    let _ = console_file();
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if state.depth == 0 {
        redirect(&mut state);
    }
    state.depth += 1;
    StderrGuard { _private: () }
}

/// Number of live guards.
pub fn depth() -> usize {
    STATE.lock().unwrap_or_else(PoisonError::into_inner).depth
}

impl Drop for StderrGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            restore(&mut state);
        }
    }
}

/// Writer for the terminal's stderr that stays visible under suppression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    _private: (),
}

#[must_use]
pub fn console() -> Console {
    Console { _private: () }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match console_file() {
            Some(mut file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match console_file() {
            Some(mut file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

/// Private duplicate of the original stderr, made on first use.
///
/// Callers must not hold `STATE`; the initializer takes it.
fn console_file() -> Option<&'static File> {
    CONSOLE.get_or_init(open_console).as_ref()
}

#[cfg(unix)]
fn open_console() -> Option<File> {
    use std::os::fd::FromRawFd;

    let state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    let source = state.saved_fd.unwrap_or(libc::STDERR_FILENO);
    // SAFETY: `source` is open while STATE is held; the duplicate is owned by the File.
    let fd = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, 0) };
    if fd < 0 {
        tracing::debug!("dup(stderr) for console failed, falling back to fd 2");
        return None;
    }
    // SAFETY: `fd` is a fresh descriptor nobody else owns.
    Some(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn open_console() -> Option<File> {
    None
}

#[cfg(unix)]
fn redirect(state: &mut QuietState) {
    use std::os::fd::AsRawFd;

    let _ = io::stderr().flush();

    let null = match std::fs::OpenOptions::new().write(true).open("/dev/null") {
        Ok(file) => file,
        Err(err) => {
            tracing::debug!(error = %err, "open /dev/null for stderr suppression");
            return;
        }
    };

    // SAFETY: dup/dup2 on fd 2 and a descriptor we own; results are checked.
    unsafe {
        let saved = libc::dup(libc::STDERR_FILENO);
        if saved < 0 {
            tracing::debug!("dup(stderr) failed, leaving stderr visible");
            return;
        }
        if libc::dup2(null.as_raw_fd(), libc::STDERR_FILENO) < 0 {
            libc::close(saved);
            tracing::debug!("dup2(null, stderr) failed, leaving stderr visible");
            return;
        }
        state.saved_fd = Some(saved);
    }
}

#[cfg(unix)]
fn restore(state: &mut QuietState) {
    if let Some(saved) = state.saved_fd.take() {
        // SAFETY: `saved` came from dup() in `redirect` and is closed exactly once.
        unsafe {
            libc::dup2(saved, libc::STDERR_FILENO);
            libc::close(saved);
        }
    }
}

#[cfg(not(unix))]
fn redirect(_state: &mut QuietState) {}

#[cfg(not(unix))]
fn restore(_state: &mut QuietState) {}
