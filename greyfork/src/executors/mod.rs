//! Executors run one input in the target and classify how it ended.

use std::{os::unix::process::CommandExt, process::Command};

use greyfork_bolts::os::unix_signals::Signal;
use serde::{Deserialize, Serialize};

use crate::Error;

pub mod command;
pub mod forkserver;
pub mod timeout;

pub use command::CommandExecutor;
pub use forkserver::{Forkserver, ForkserverExecutor};

/// How an execution finished.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitKind {
    /// The run exited normally (or was stopped by a signal we treat as benign).
    Ok,
    /// The run was killed by a crash signal.
    Crash(Signal),
    /// The run timed out and was torn down by the supervisor.
    Timeout,
}

/// Decode a raw `waitpid` status into an [`ExitKind`].
///
/// `timed_out` is the supervisor's alarm flag for this execution: a child
/// killed by an arbitrary signal while the flag is set died from our own
/// TERM/KILL escalation and counts as a timeout, not a crash.
#[must_use]
pub fn classify_status(status: i32, timed_out: bool) -> ExitKind {
    if libc::WIFEXITED(status) {
        return ExitKind::Ok;
    }

    if libc::WIFSIGNALED(status) {
        return match libc::WTERMSIG(status) {
            libc::SIGSEGV => ExitKind::Crash(Signal::SigSegmentationFault),
            libc::SIGFPE => ExitKind::Crash(Signal::SigFloatingPointException),
            libc::SIGILL => ExitKind::Crash(Signal::SigIllegalInstruction),
            libc::SIGABRT => ExitKind::Crash(Signal::SigAbort),
            libc::SIGALRM => ExitKind::Timeout,
            _ if timed_out => ExitKind::Timeout,
            _ => ExitKind::Ok,
        };
    }

    ExitKind::Ok
}

/// An executor takes stdin bytes for the target and runs them.
pub trait Executor {
    /// Deliver `stdin_bytes` to the target, run it once and classify the exit.
    fn run_target(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error>;
}

/// Configure the child side of a spawned target: setsid, rlimits, stdin
/// redirection and the fork-server descriptor pair, all through
/// [`CommandExt::pre_exec`].
pub trait ConfigTarget {
    /// Start a new session for the child
    fn setsid(&mut self) -> &mut Self;
    /// Disable core dumps and make sure the fd table reaches past `reserved_fd`
    fn setlimit(&mut self, reserved_fd: i32) -> &mut Self;
    /// Serve the child's stdin from the given descriptor
    fn setstdin(&mut self, fd: i32) -> &mut Self;
    /// Move the pipe ends onto the reserved descriptor pair and close the rest
    fn setpipe(
        &mut self,
        st_read: i32,
        st_write: i32,
        ctl_read: i32,
        ctl_write: i32,
        reserved_fd: i32,
    ) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setlimit(&mut self, reserved_fd: i32) -> &mut Self {
        let func = move || {
            unsafe {
                let mut r: libc::rlimit = core::mem::zeroed();
                // If the ulimit sits below the reserved descriptor pair, the
                // dup2 onto it would fail; raise it (errors ignored, the
                // dup2 will report them loudly enough).
                if libc::getrlimit(libc::RLIMIT_NOFILE, &mut r) == 0
                    && r.rlim_cur < (reserved_fd as libc::rlim_t) + 2
                {
                    r.rlim_cur = reserved_fd as libc::rlim_t + 2;
                    libc::setrlimit(libc::RLIMIT_NOFILE, &r);
                }

                let r0 = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                libc::setrlimit(libc::RLIMIT_CORE, &r0);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setstdin(&mut self, fd: i32) -> &mut Self {
        let func = move || {
            let ret = unsafe { libc::dup2(fd, libc::STDIN_FILENO) };
            if ret < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setpipe(
        &mut self,
        st_read: i32,
        st_write: i32,
        ctl_read: i32,
        ctl_write: i32,
        reserved_fd: i32,
    ) -> &mut Self {
        let func = move || {
            if unsafe { libc::dup2(ctl_read, reserved_fd) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if unsafe { libc::dup2(st_write, reserved_fd + 1) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
            unsafe {
                libc::close(st_read);
                libc::close(st_write);
                libc::close(ctl_read);
                libc::close(ctl_write);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}
