//! Runners implement concurrency strategies for Servers.
use std::thread;

use log::{debug, error};

use crate::handler::AppError;
use crate::server::{Concurrency, ServerError};

#[cfg(unix)]
pub use fork::ForkRunner;

#[cfg(unix)]
mod fork;

/// Runs each job on the calling thread; a job's error is returned to the
/// caller.
pub struct SimpleRunner;

impl SimpleRunner {
    pub fn run<F>(&mut self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Result<(), AppError>,
    {
        f().map_err(ServerError::Application)
    }
}

/// Runs each job on a new detached thread. Threads are never joined, so a
/// process exiting does not wait for requests still in flight.
#[derive(Default)]
pub struct ThreadRunner {
    spawned: u64,
}

impl ThreadRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<F>(&mut self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Result<(), AppError> + Send + 'static,
    {
        self.spawned += 1;
        let name = format!("request-{}", self.spawned);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if let Err(err) = f() {
                // Errors only escape a job when passed through for debugging.
                panic!("{}", err);
            }
        });
        match spawned {
            Ok(_detached) => Ok(()),
            Err(e) => {
                error!("could not spawn request thread: {}", e);
                Err(ServerError::Io(e))
            }
        }
    }
}

pub enum Runner {
    Simple(SimpleRunner),
    Thread(ThreadRunner),
    #[cfg(unix)]
    Fork(ForkRunner),
}

impl Runner {
    /// Create the runner for a concurrency mode. Forking is only available
    /// on unix; elsewhere the configuration is rejected before a runner is
    /// built.
    pub fn new(concurrency: Concurrency) -> Result<Self, ServerError> {
        debug!("using {:?} concurrency", concurrency);
        match concurrency {
            Concurrency::Sequential => Ok(Self::Simple(SimpleRunner)),
            Concurrency::Threaded => Ok(Self::Thread(ThreadRunner::new())),
            #[cfg(unix)]
            Concurrency::Forking { max_children } => Ok(Self::Fork(ForkRunner::new(max_children))),
            #[cfg(not(unix))]
            Concurrency::Forking { .. } => Err(ServerError::Config(
                "forking is not supported on this platform".to_string(),
            )),
        }
    }

    pub fn run<F>(&mut self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Result<(), AppError> + Send + 'static,
    {
        match self {
            Self::Simple(runner) => runner.run(f),
            Self::Thread(runner) => runner.run(f),
            #[cfg(unix)]
            Self::Fork(runner) => runner.run(f),
        }
    }

    /// Housekeeping between accepts: reap finished worker processes.
    pub fn collect(&mut self) {
        match self {
            #[cfg(unix)]
            Self::Fork(runner) => runner.collect_children(false),
            _ => (),
        }
    }
}
