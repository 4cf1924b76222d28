//! Auto-restart supervisor.
//!
//! The supervisor runs the current program again as a child process with
//! [`RUN_MAIN_ENV`] set, and starts it again each time it exits with
//! [`RESTART_EXIT_CODE`]. Combined with
//! [`reserve_listener`](crate::serving::reserve_listener) the listening
//! socket survives restarts.
use std::env;
use std::process::{Command, ExitStatus};

use log::*;

use crate::server::ServerError;
use crate::shutdown::{is_running_from_supervisor, RUN_MAIN_ENV};

/// Exit code a supervised process uses to ask for a restart.
pub const RESTART_EXIT_CODE: i32 = 3;

/// Run the current program under supervision, returning the exit code of
/// the first run that does not ask for a restart.
pub fn run_supervised() -> Result<i32, ServerError> {
    let program = env::current_exe()?;
    let args: Vec<String> = env::args().skip(1).collect();
    loop {
        info!(" * Restarting with supervisor");
        let status = Command::new(&program)
            .args(&args)
            .env(RUN_MAIN_ENV, "true")
            .status()?;
        let code = exit_code(status);
        if code != RESTART_EXIT_CODE {
            debug!("supervised process exited with {}", code);
            return Ok(code);
        }
    }
}

/// Call `main` directly when already supervised, otherwise become the
/// supervisor of a new copy of this program.
pub fn supervise<F>(main: F) -> Result<i32, ServerError>
where
    F: FnOnce() -> Result<(), ServerError>,
{
    if is_running_from_supervisor() {
        main()?;
        Ok(0)
    } else {
        run_supervised()
    }
}

/// Exit code of a child; killed children report the negated signal number.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(exit_code(status), RESTART_EXIT_CODE);
        let status = Command::new("sh").args(["-c", "kill -9 $$"]).status().unwrap();
        assert_eq!(exit_code(status), -9);
    }
}
