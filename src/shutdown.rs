//! Cooperative shutdown.
//!
//! Applications request shutdown through the handle in their [`Environ`];
//! the server only acts on the request once the current request has been
//! answered, never in the middle of one.
//!
//! [`Environ`]: crate::environ::Environ
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

/// Set by the supervisor in the environment of the process it runs.
pub const RUN_MAIN_ENV: &str = "DEVSERVE_RUN_MAIN";

#[derive(Debug, Default)]
struct ServerState {
    /// An application asked for the server to stop.
    signal: AtomicBool,
    /// The accept loop must stop.
    stop: AtomicBool,
}

/// Shared shutdown flags of one server instance.
///
/// Flags are written with `Release` and read with `Acquire`, so a request
/// made on a worker thread is visible to the accept loop by its next poll.
/// A forked worker gets its own copy of the flags.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    state: Arc<ServerState>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the server to shut down after the current request.
    pub fn request(&self) {
        self.state.signal.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.state.signal.load(Ordering::Acquire)
    }

    /// Stop the accept loop without waiting for a request boundary.
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stop.load(Ordering::Acquire)
    }

    /// Clear both flags, for a server entering its serve loop.
    pub(crate) fn reset(&self) {
        self.state.signal.store(false, Ordering::Release);
        self.state.stop.store(false, Ordering::Release);
    }

    /// Act on a pending shutdown request. Called between requests.
    ///
    /// Under the supervisor the process kills itself so the supervisor can
    /// take over; otherwise the accept loop is told to stop.
    pub(crate) fn initiate_if_requested(&self) {
        if !self.is_requested() {
            return;
        }
        if is_running_from_supervisor() {
            kill_self();
        }
        info!("shutdown requested, stopping server");
        self.stop();
    }
}

/// True when this process was started by [`run_supervised`].
///
/// [`run_supervised`]: crate::supervisor::run_supervised
pub fn is_running_from_supervisor() -> bool {
    std::env::var(RUN_MAIN_ENV).map_or(false, |v| v == "true")
}

#[cfg(unix)]
fn kill_self() {
    warn!("shutdown requested under supervisor, killing process");
    // SAFETY: plain libc calls on our own pid.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_self() {
    warn!("shutdown requested under supervisor, terminating process");
    std::process::exit(1);
}
