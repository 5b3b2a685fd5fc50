//! Signal handling for unix
//!
//! Besides the [`Signal`] enum, this module owns the `SIGALRM` plumbing used
//! to enforce per-execution deadlines. The installed handler only stores to
//! an atomic flag; everything heavyweight (escalating to `SIGKILL`, spawning
//! a debugger in replay mode) runs in normal control flow once a blocking
//! `waitpid` comes back with `EINTR`.

use core::{
    fmt::{self, Display, Formatter},
    mem, ptr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use libc::{
    c_int, SIGABRT, SIGALRM, SIGBUS, SIGFPE, SIGHUP, SIGILL, SIGINT, SIGKILL, SIGPIPE, SIGQUIT,
    SIGSEGV, SIGTERM, SIGTRAP, SIGUSR2,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::Error;

/// All signals we may report to the search algorithm, as `enum`.
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, Serialize, Deserialize)]
#[repr(i32)]
pub enum Signal {
    /// `SIGABRT` signal id
    SigAbort = SIGABRT,
    /// `SIGBUS` signal id
    SigBus = SIGBUS,
    /// `SIGFPE` signal id
    SigFloatingPointException = SIGFPE,
    /// `SIGILL` signal id
    SigIllegalInstruction = SIGILL,
    /// `SIGPIPE` signal id
    SigPipe = SIGPIPE,
    /// `SIGSEGV` signal id
    SigSegmentationFault = SIGSEGV,
    /// `SIGUSR2` signal id
    SigUser2 = SIGUSR2,
    /// `SIGALARM` signal id
    SigAlarm = SIGALRM,
    /// `SIGHUP` signal id
    SigHangUp = SIGHUP,
    /// `SIGKILL` signal id
    SigKill = SIGKILL,
    /// `SIGQUIT` signal id
    SigQuit = SIGQUIT,
    /// `SIGTERM` signal id
    SigTerm = SIGTERM,
    /// `SIGINT` signal id
    SigInterrupt = SIGINT,
    /// `SIGTRAP` signal id
    SigTrap = SIGTRAP,
}

impl TryFrom<&str> for Signal {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "SIGABRT" => Signal::SigAbort,
            "SIGBUS" => Signal::SigBus,
            "SIGFPE" => Signal::SigFloatingPointException,
            "SIGILL" => Signal::SigIllegalInstruction,
            "SIGPIPE" => Signal::SigPipe,
            "SIGSEGV" => Signal::SigSegmentationFault,
            "SIGUSR2" => Signal::SigUser2,
            "SIGALRM" => Signal::SigAlarm,
            "SIGHUP" => Signal::SigHangUp,
            "SIGKILL" => Signal::SigKill,
            "SIGQUIT" => Signal::SigQuit,
            "SIGTERM" => Signal::SigTerm,
            "SIGINT" => Signal::SigInterrupt,
            "SIGTRAP" => Signal::SigTrap,
            _ => return Err(Error::illegal_argument(format!("No signal named {value}"))),
        })
    }
}

impl From<Signal> for nix::sys::signal::Signal {
    fn from(value: Signal) -> Self {
        // we can be semi-certain that all signals exist in nix.
        i32::from(value).try_into().unwrap()
    }
}

impl PartialEq for Signal {
    fn eq(&self, other: &Self) -> bool {
        *self as i32 == *other as i32
    }
}

impl Eq for Signal {}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Signal::SigAbort => write!(f, "SIGABRT")?,
            Signal::SigBus => write!(f, "SIGBUS")?,
            Signal::SigFloatingPointException => write!(f, "SIGFPE")?,
            Signal::SigIllegalInstruction => write!(f, "SIGILL")?,
            Signal::SigPipe => write!(f, "SIGPIPE")?,
            Signal::SigSegmentationFault => write!(f, "SIGSEGV")?,
            Signal::SigUser2 => write!(f, "SIGUSR2")?,
            Signal::SigAlarm => write!(f, "SIGALRM")?,
            Signal::SigHangUp => write!(f, "SIGHUP")?,
            Signal::SigKill => write!(f, "SIGKILL")?,
            Signal::SigQuit => write!(f, "SIGQUIT")?,
            Signal::SigTerm => write!(f, "SIGTERM")?,
            Signal::SigInterrupt => write!(f, "SIGINT")?,
            Signal::SigTrap => write!(f, "SIGTRAP")?,
        }

        Ok(())
    }
}

/// Set once the `SIGALRM` handler fired for the current execution.
static ALARM_FIRED: AtomicBool = AtomicBool::new(false);

extern "C" fn alarm_handler(_signal: c_int) {
    // Only async-signal-safe work in here. Everything else happens after the
    // interrupted waitpid returns.
    ALARM_FIRED.store(true, Ordering::SeqCst);
}

/// Install the flag-only `SIGALRM` handler.
///
/// Registered without `SA_RESTART`, so a blocking `waitpid`/`read` is
/// interrupted (`EINTR`) when the deadline expires and the caller can run the
/// escalation policy in normal control flow.
pub fn install_alarm_handler() -> Result<(), Error> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
    }
    sa.sa_flags = 0;
    sa.sa_sigaction = alarm_handler as usize;
    if unsafe { libc::sigaction(SIGALRM, &sa, ptr::null_mut()) } < 0 {
        return Err(Error::last_os_error("Failed to set up SIGALRM handler"));
    }
    Ok(())
}

/// Returns `true` and clears the flag if the alarm fired since the last call.
#[must_use]
pub fn take_alarm_flag() -> bool {
    ALARM_FIRED.swap(false, Ordering::SeqCst)
}

/// Returns whether the alarm fired, without clearing the flag.
#[must_use]
pub fn alarm_pending() -> bool {
    ALARM_FIRED.load(Ordering::SeqCst)
}

/// Arm a one-shot alarm `timeout` from now.
///
/// Uses the coarse `alarm()` for timeouts of a second or more and `ualarm()`
/// below that.
pub fn arm_alarm(timeout: Duration) {
    ALARM_FIRED.store(false, Ordering::SeqCst);
    let millis = timeout.as_millis() as u64;
    unsafe {
        if millis >= 1000 {
            libc::alarm((millis / 1000) as libc::c_uint);
        } else {
            ualarm((millis * 1000) as libc::useconds_t, 0);
        }
    }
}

extern "C" {
    // `ualarm(3)` has no binding in the pinned `libc` version; declare the
    // exact C function the code already calls so behavior is unchanged.
    fn ualarm(usecs: libc::useconds_t, interval: libc::useconds_t) -> libc::useconds_t;
}

/// Cancel any pending alarm.
pub fn cancel_alarm() {
    unsafe {
        libc::alarm(0);
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use serial_test::serial;

    use super::{arm_alarm, cancel_alarm, install_alarm_handler, take_alarm_flag, Signal};

    #[test]
    fn signal_string_roundtrip() {
        for name in ["SIGSEGV", "SIGFPE", "SIGILL", "SIGABRT", "SIGALRM"] {
            let sig = Signal::try_from(name).unwrap();
            assert_eq!(format!("{sig}"), name);
        }
        assert!(Signal::try_from("SIGWINCH").is_err());
    }

    #[test]
    fn signal_numeric_roundtrip() {
        let sig = Signal::try_from(libc::SIGSEGV).unwrap();
        assert_eq!(sig, Signal::SigSegmentationFault);
        assert_eq!(i32::from(sig), libc::SIGSEGV);
    }

    #[test]
    #[serial]
    fn alarm_raises_the_flag() {
        install_alarm_handler().unwrap();
        let _ = take_alarm_flag();

        arm_alarm(Duration::from_millis(50));
        // Wherever the kernel delivers the signal, the flag is global; sleep
        // long enough for the alarm to have fired either way.
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 300_000_000,
        };
        unsafe {
            libc::nanosleep(&ts, core::ptr::null_mut());
        }
        assert!(take_alarm_flag());

        arm_alarm(Duration::from_secs(10));
        cancel_alarm();
        assert!(!take_alarm_flag());
    }
}
