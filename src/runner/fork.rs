//! Process-per-connection runner.
use std::collections::HashSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use log::*;

use crate::handler::AppError;
use crate::server::ServerError;

/// How often workers are polled while the runner is at its cap.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Runs each job in a forked child process, with at most `max_children`
/// children alive at once.
///
/// Children exit when their job is done and never return into the caller.
/// The parent drops its copy of everything the job captured, such as the
/// accepted socket, right after forking.
pub struct ForkRunner {
    max_children: usize,
    active: HashSet<libc::pid_t>,
}

impl ForkRunner {
    pub fn new(max_children: usize) -> Self {
        Self {
            max_children: max_children.max(1),
            active: HashSet::new(),
        }
    }

    pub fn active_children(&self) -> usize {
        self.active.len()
    }

    pub fn run<F>(&mut self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Result<(), AppError>,
    {
        self.collect_children(true);
        // SAFETY: the child only runs the job and then exits without
        // returning into the caller.
        match unsafe { libc::fork() } {
            -1 => {
                let err = io::Error::last_os_error();
                error!("fork failed: {}", err);
                Err(ServerError::Io(err))
            }
            0 => {
                let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(Ok(())) => 0,
                    Ok(Err(err)) => {
                        error!("worker process failed: {}", err);
                        1
                    }
                    Err(_) => 1,
                };
                // SAFETY: terminates the child without running the parent's
                // destructors or exit handlers.
                unsafe { libc::_exit(status) }
            }
            pid => {
                trace!("forked worker {}", pid);
                self.active.insert(pid);
                Ok(())
            }
        }
    }

    /// Reap finished children. With `block` set, also wait until fewer
    /// than `max_children` are alive.
    ///
    /// Only our own workers are waited on, since the process may have other
    /// children. While at the cap they are polled, so whichever exits first
    /// frees the slot.
    pub fn collect_children(&mut self, block: bool) {
        self.reap_finished();
        while block && self.active.len() >= self.max_children {
            thread::sleep(REAP_INTERVAL);
            self.reap_finished();
        }
    }

    fn reap_finished(&mut self) {
        let finished: Vec<libc::pid_t> = self
            .active
            .iter()
            .copied()
            .filter(|&pid| wait_for(pid, libc::WNOHANG).is_some())
            .collect();
        for pid in finished {
            self.active.remove(&pid);
        }
    }
}

/// `waitpid` wrapper: the pid reaped, or `None` if nothing was.
fn wait_for(pid: libc::pid_t, options: libc::c_int) -> Option<libc::pid_t> {
    let mut status = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let reaped = unsafe { libc::waitpid(pid, &mut status, options) };
        match reaped {
            -1 if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => continue,
            // ECHILD: already reaped.
            -1 => return Some(pid),
            0 => return None,
            reaped => {
                trace!("worker {} exited with status {}", reaped, status);
                return Some(reaped);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_children_are_reaped() {
        let mut runner = ForkRunner::new(2);
        for _ in 0..4 {
            runner.run(|| Ok(())).unwrap();
            assert!(runner.active_children() <= 2);
        }
        runner.max_children = 1;
        runner.collect_children(true);
        assert_eq!(runner.active_children(), 0);
    }

    #[test]
    fn test_free_slot_is_used_without_waiting_for_slow_child() {
        let mut runner = ForkRunner::new(2);
        runner
            .run(|| {
                std::thread::sleep(Duration::from_millis(1500));
                Ok(())
            })
            .unwrap();
        runner.run(|| Ok(())).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let began = std::time::Instant::now();
        runner.run(|| Ok(())).unwrap();
        assert!(began.elapsed() < Duration::from_millis(500));

        runner.max_children = 1;
        runner.collect_children(true);
        assert_eq!(runner.active_children(), 0);
    }
}
