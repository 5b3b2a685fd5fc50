//! Operating System specific abstractions

use std::{
    ffi::CString,
    fs::File,
    os::fd::{AsRawFd, RawFd},
    sync::OnceLock,
};

use libc::pid_t;

use crate::Error;

pub mod pipes;
pub mod unix_signals;

/// A file that we keep open, pointing to /dev/null
static NULL_FILE: OnceLock<File> = OnceLock::new();

/// Child Process Handle
#[derive(Debug)]
pub struct ChildHandle {
    /// The process id
    pub pid: pid_t,
}

impl ChildHandle {
    /// Block until the child exited, returning the raw wait status
    #[must_use]
    pub fn wait(&self) -> i32 {
        let mut status = -1;
        unsafe {
            libc::waitpid(self.pid, &mut status, 0);
        }
        status
    }

    /// Block until the child exited and return its exit code
    #[must_use]
    pub fn status(&self) -> i32 {
        libc::WEXITSTATUS(self.wait())
    }
}

/// The `ForkResult` (result of a fork)
#[derive(Debug)]
pub enum ForkResult {
    /// The fork finished, we are the parent process.
    /// The child has the handle `ChildHandle`.
    Parent(ChildHandle),
    /// The fork finished, we are the child process.
    Child,
}

/// Unix has forks.
///
/// # Safety
/// A Normal fork. Runs on in two processes. Should be memory safe in general.
pub unsafe fn fork() -> Result<ForkResult, Error> {
    match libc::fork() {
        pid if pid > 0 => Ok(ForkResult::Parent(ChildHandle { pid })),
        pid if pid < 0 => {
            // Getting errno from rust is hard, we'll just let the libc print to stderr for now.
            // In any case, this should usually not happen.
            let err_str = CString::new("Fork failed").unwrap();
            libc::perror(err_str.as_ptr());
            Err(Error::unknown(format!("Fork failed ({pid})")))
        }
        _ => Ok(ForkResult::Child),
    }
}

/// "Safe" wrapper around `dup`, duplicating the given file descriptor
///
/// # Safety
/// The fd need to be a legal fd.
pub fn dup(fd: RawFd) -> Result<RawFd, Error> {
    match unsafe { libc::dup(fd) } {
        -1 => Err(Error::last_os_error(format!("Error calling dup({fd})"))),
        new_fd => Ok(new_fd),
    }
}

/// "Safe" wrapper around dup2
///
/// # Safety
/// The fds need to be legal fds.
pub fn dup2(fd: RawFd, device: RawFd) -> Result<(), Error> {
    match unsafe { libc::dup2(fd, device) } {
        -1 => Err(Error::last_os_error(format!(
            "Error calling dup2({fd}, {device})"
        ))),
        _ => Ok(()),
    }
}

/// Get a file descriptor ([`RawFd`]) pointing to "/dev/null"
pub fn null_fd() -> Result<RawFd, Error> {
    // We don't care about opening the file twice here - races are ok.
    if let Some(file) = NULL_FILE.get() {
        Ok(file.as_raw_fd())
    } else {
        let null_file = File::options().read(true).write(true).open("/dev/null")?;
        Ok(NULL_FILE.get_or_init(move || null_file).as_raw_fd())
    }
}

/// Returns `true` if the process with the given pid is still alive.
///
/// Implemented as `kill(pid, 0)`, so it also reports zombies that have not
/// been reaped yet.
#[must_use]
pub fn process_alive(pid: pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::{fork, ForkResult};

    #[test]
    fn fork_reports_child_exit() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent(child) => {
                let status = child.wait();
                assert!(libc::WIFEXITED(status));
                assert_eq!(libc::WEXITSTATUS(status), 42);
            }
            ForkResult::Child => {
                std::process::exit(42);
            }
        }
    }
}
