//! Deadline enforcement for running targets.
//!
//! The alarm handler itself (installed by
//! [`greyfork_bolts::os::unix_signals`]) only raises a flag. The blocking
//! `waitpid` in [`wait_child`] comes back with `EINTR`, at which point
//! [`escalate`] runs the actual teardown in normal control flow: `SIGTERM`
//! first so the instrumented layer can still run its exit hook and flush
//! feedback, a grace period, then `SIGKILL` for anything still alive.
//! Fork-server sessions reuse the same escalation policy around their
//! poll-bounded status reads instead of the alarm.

use core::time::Duration;
use std::{io, process::Command, thread::sleep};

use greyfork_bolts::{
    os::{
        process_alive,
        unix_signals::{
            alarm_pending, arm_alarm, cancel_alarm, install_alarm_handler, take_alarm_flag,
        },
    },
    Error,
};
use libc::pid_t;

/// How long a TERM'd child gets to flush feedback before SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_millis(400);

/// How long the replay-mode debugger gets to force an orderly exit.
pub const DEBUGGER_GRACE: Duration = Duration::from_millis(250);

/// How the supervisor tears down a stalled child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    /// Fuzzing mode: TERM, grace period, KILL.
    #[default]
    Terminate,
    /// Replay mode: attach a debugger that forces the child through its
    /// normal exit routine, so coverage data depending on an orderly exit
    /// path is still produced.
    DebuggerExit,
}

/// Send the stalled child through the TERM -> grace -> KILL policy (or the
/// replay-mode debugger variant).
pub fn escalate(child_pid: pid_t, action: TimeoutAction) {
    log::info!("Timeout, tearing down pid {child_pid}");

    match action {
        TimeoutAction::DebuggerExit => debugger_exit(child_pid),
        TimeoutAction::Terminate => unsafe {
            // TERM, not KILL: the instrumented layer needs to reach its exit
            // hook to flush feedback.
            libc::kill(child_pid, libc::SIGTERM);
        },
    }

    // The child may ignore SIGTERM (or survive the debugger), so check again
    // after the grace period and put it down for good.
    sleep(TERM_GRACE);
    if process_alive(child_pid) {
        unsafe {
            libc::kill(child_pid, libc::SIGKILL);
        }
    }
}

/// Fork a debugger that attaches to the stalled child and forces it to call
/// its normal exit routine.
fn debugger_exit(child_pid: pid_t) {
    let gdb = Command::new("/usr/bin/gdb")
        .arg("--pid")
        .arg(child_pid.to_string())
        .arg("-q")
        .arg("--batch")
        .arg("--eval-command=call exit(1)")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();

    match gdb {
        Ok(mut gdb) => {
            sleep(DEBUGGER_GRACE);
            // Sometimes the debugger process itself hangs on the attach.
            match gdb.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    let _ = gdb.kill();
                    let _ = gdb.wait();
                }
            }
        }
        Err(err) => {
            log::warn!("Failed to spawn debugger for stalled pid {child_pid}: {err}");
        }
    }
}

/// Wait for `child_pid` under a deadline.
///
/// Returns the raw wait status plus whether the deadline fired for this
/// execution. The alarm uses the coarse `alarm()` facility for timeouts of a
/// second and up, `ualarm()` below.
pub fn wait_child(
    child_pid: pid_t,
    timeout: Duration,
    action: TimeoutAction,
) -> Result<(i32, bool), Error> {
    install_alarm_handler()?;
    arm_alarm(timeout);

    let mut timed_out = false;
    let status = loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(child_pid, &mut status, 0) };
        if ret == child_pid {
            break status;
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            if alarm_pending() && !timed_out {
                timed_out = true;
                escalate(child_pid, action);
            }
            continue;
        }

        cancel_alarm();
        let _ = take_alarm_flag();
        return Err(Error::os_error(err, format!("waitpid({child_pid}) failed")));
    };

    cancel_alarm();
    let _ = take_alarm_flag();
    Ok((status, timed_out))
}
