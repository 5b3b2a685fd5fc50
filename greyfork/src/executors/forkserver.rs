//! Parent side of the persistent fork-server protocol.
//!
//! A fork-server session execs the instrumented target once; a cooperating
//! stub inside it (see `greyfork_targets::forkserver`) then blocks on the
//! control descriptor and forks one fresh child per request, so repeated
//! executions don't repay the process-startup cost. Parent and stub talk
//! over two pipes dup2'd onto a reserved low descriptor pair.
//!
//! Two independent sessions usually exist side by side: one collecting
//! coverage/path feedback, one capturing branch distance data. They
//! instrument different things and share no mutable state, so each gets its
//! own descriptor pair and scratch stdin file.

use core::time::Duration;
use std::{
    io::{Read, Write},
    os::unix::prelude::RawFd,
    process::{Command, Stdio},
};

use greyfork_bolts::{fs::OutFile, os::pipes::Pipe, Error};
use libc::pid_t;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::{
    executors::{
        classify_status,
        timeout::{escalate, TimeoutAction},
        ConfigTarget, Executor, ExitKind,
    },
    GuestAddr,
};

/// Reserved control descriptor of the coverage session; the status
/// descriptor is the next one up. These are a contract with the target-side
/// stub, chosen well below typical ulimits so ordinary fd use never reaches
/// them.
pub const COVERAGE_FORKSRV_FD: RawFd = 198;
/// Reserved control descriptor of the branch-capture session.
pub const BRANCH_FORKSRV_FD: RawFd = 194;

/// The handshake deadline is the per-run timeout times this, to absorb
/// first-exec slowness (dynamic loading, accumulative set reload).
pub const FORK_WAIT_MULT: u32 = 10;

/// How long the wait status of a torn-down run may take to arrive before the
/// server counts as wedged. Generous on purpose: a healthy server reports
/// within milliseconds of the kill.
const STATUS_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Scratch stdin file of the coverage session.
pub const SCRATCH_STDIN_COVERAGE: &str = ".stdin_cov";
/// Scratch stdin file of the branch-capture session.
pub const SCRATCH_STDIN_BRANCH: &str = ".stdin_feed";

/// Environment key: coverage summary output path
pub const COVERAGE_LOG_ENV: &str = "GF_COVERAGE_LOG";
/// Environment key: accumulative node log path
pub const NODE_LOG_ENV: &str = "GF_NODE_LOG";
/// Environment key: accumulative edge log path
pub const EDGE_LOG_ENV: &str = "GF_EDGE_LOG";
/// Environment key: accumulative path-hash log path
pub const PATH_LOG_ENV: &str = "GF_PATH_LOG";
/// Environment key: branch/comparison feedback output path
pub const FEED_LOG_ENV: &str = "GF_FEED_LOG";
/// Environment key: hash output path
pub const HASH_LOG_ENV: &str = "GF_HASH_LOG";
/// Environment key: accumulative edge bitmap file path
pub const BITMAP_LOG_ENV: &str = "GF_BITMAP_LOG";
/// Environment key: accumulative edge bitmap SysV shared memory id
pub const SHM_ENV_VAR: &str = "GF_SHM_ID";
/// Environment key: debug log path (optional)
pub const DBG_LOG_ENV: &str = "GF_DBG_LOG";
/// Environment key: syscall trace log path (optional)
pub const SYSCALL_LOG_ENV: &str = "GF_SYSCALL_LOG";
/// Environment key: recorder run mode (decimal [`RunMode`])
pub const MODE_ENV_VAR: &str = "GF_MODE";
/// Environment key: whether a fork-server stub will serve this process
pub const FORK_SERVER_ENV_VAR: &str = "GF_FORK_SERVER";
/// Environment key: branch capture target address (hex)
pub const FEED_ADDR_ENV_VAR: &str = "GF_FEED_ADDR";
/// Environment key: branch capture target hit index (hex, 1-based)
pub const FEED_IDX_ENV_VAR: &str = "GF_FEED_IDX";
/// Environment key: accumulative coverage measurement flag
pub const MEASURE_COV_ENV_VAR: &str = "GF_MEASURE_COV";
/// Environment key: calling-context sensitivity (frames folded into a node id)
pub const CTX_SENSITIVITY_ENV_VAR: &str = "GF_CTX_SENSITIVITY";

/// The recorder mode requested for one run, sent as the 4-byte control
/// payload of a coverage session (and as `GF_MODE` without a fork server).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum RunMode {
    /// Track per-execution sets, diff against the accumulative sets, emit
    /// new-element count + path hash + set hash.
    CountNew = 0,
    /// Emit only the set hash; no disk diffing.
    HashOnly = 1,
    /// Dump the raw per-execution set for offline recomputation.
    SetDump = 2,
    /// Maintain per-run and shared-memory bitmaps, emit a new-edge counter
    /// plus hashes.
    BitmapAccum = 3,
}

/// A running fork-server session.
#[derive(Debug)]
pub struct Forkserver {
    st_pipe: Pipe,
    ctl_pipe: Pipe,
    out_file: OutFile,
    pid: pid_t,
    child_pid: pid_t,
    reserved_fd: RawFd,
    last_status: i32,
}

impl Forkserver {
    /// Spawn the fork server and complete the readiness handshake.
    ///
    /// `timeout` is the per-run deadline; the handshake itself is allowed
    /// [`FORK_WAIT_MULT`] times as long.
    pub fn new(
        target: &str,
        args: &[String],
        envs: &[(String, String)],
        reserved_fd: RawFd,
        stdin_path: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let out_file = OutFile::create_exclusive(stdin_path, reserved_fd)?;
        let mut st_pipe = Pipe::new()?;
        let mut ctl_pipe = Pipe::new()?;

        let st_read = st_pipe.read_end().unwrap();
        let st_write = st_pipe.write_end().unwrap();
        let ctl_read = ctl_pipe.read_end().unwrap();
        let ctl_write = ctl_pipe.write_end().unwrap();

        let mut cmd = Command::new(target);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(FORK_SERVER_ENV_VAR, "1");
        for (key, val) in envs {
            cmd.env(key, val);
        }
        // setenv(..., overwrite=0) semantics: an operator-provided value wins.
        if std::env::var_os("LD_BIND_NOW").is_none() {
            cmd.env("LD_BIND_NOW", "1");
        }
        if std::env::var_os("ASAN_OPTIONS").is_none() {
            cmd.env(
                "ASAN_OPTIONS",
                "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1",
            );
        }
        cmd.setsid()
            .setlimit(reserved_fd)
            .setstdin(out_file.as_raw_fd())
            .setpipe(st_read, st_write, ctl_read, ctl_write, reserved_fd);

        let child = cmd.spawn().map_err(|err| {
            // Don't leave a stale scratch file behind, a retry would trip
            // over the leak detector.
            let _ = std::fs::remove_file(&out_file.path);
            Error::file(err)
        })?;
        let pid = child.id() as pid_t;

        // Parent keeps the control write end and the status read end only.
        ctl_pipe.close_read_end();
        st_pipe.close_write_end();

        let mut forkserver = Self {
            st_pipe,
            ctl_pipe,
            out_file,
            pid,
            child_pid: 0,
            reserved_fd,
            last_status: 0,
        };

        forkserver.handshake(timeout * FORK_WAIT_MULT)?;
        log::info!(
            "Fork server up (pid {pid}, reserved fd {})",
            forkserver.reserved_fd
        );

        Ok(forkserver)
    }

    /// The fork server's own pid
    #[must_use]
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// The pid of the most recently forked child, 0 if it already exited
    #[must_use]
    pub fn child_pid(&self) -> pid_t {
        self.child_pid
    }

    /// The raw wait status of the last served run
    #[must_use]
    pub fn last_status(&self) -> i32 {
        self.last_status
    }

    fn handshake(&mut self, deadline: Duration) -> Result<(), Error> {
        if !self.st_pipe.poll_readable(deadline)? {
            // Nothing arrived at all. Reap the server to tell "died at
            // startup" apart from "wedged before phoning home".
            if self.reap_server() {
                return Err(Error::illegal_state("Fork server died at startup"));
            }
            self.kill_server();
            return Err(Error::illegal_state(
                "Timed out while initializing the fork server",
            ));
        }

        let (rlen, _) = self.read_st()?;
        if rlen == 4 {
            return Ok(());
        }

        // Short read: the server went away mid-handshake.
        if self.reap_server() {
            return Err(Error::illegal_state("Fork server died at startup"));
        }
        self.kill_server();
        Err(Error::illegal_state(
            "Fork server handshake was cut short",
        ))
    }

    /// Reap the server if it already exited. Returns `true` when it had.
    fn reap_server(&mut self) -> bool {
        let mut status = 0;
        if unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } == self.pid {
            self.pid = 0;
            return true;
        }
        false
    }

    /// Read 4 bytes from the status pipe, retrying on `EINTR`.
    fn read_st(&mut self) -> Result<(usize, i32), Error> {
        let mut buf = [0_u8; 4];
        let mut nread = 0;
        while nread < 4 {
            match self.st_pipe.read(&mut buf[nread..]) {
                Ok(0) => break,
                Ok(len) => nread += len,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::os_error(err, "Status pipe read failed")),
            }
        }
        Ok((nread, i32::from_ne_bytes(buf)))
    }

    /// Read the 4-byte wait status under the per-run deadline.
    ///
    /// When the deadline passes without the status arriving, the stalled
    /// child is escalated (TERM, grace, KILL); the server then reaps it and
    /// reports the resulting status, which the follow-up read picks up. A
    /// status that never arrives even after the kill means the server itself
    /// is wedged, reported as a short read.
    fn read_st_timed(
        &mut self,
        timeout: Duration,
        action: TimeoutAction,
    ) -> Result<(usize, i32, bool), Error> {
        let mut timed_out = false;
        if !self.st_pipe.poll_readable(timeout)? {
            timed_out = true;
            escalate(self.child_pid, action);
            if !self.st_pipe.poll_readable(STATUS_FLUSH_DEADLINE)? {
                return Ok((0, 0, true));
            }
        }
        let (rlen, status) = self.read_st()?;
        Ok((rlen, status, timed_out))
    }

    /// Write a control payload, retrying on `EINTR`.
    fn write_ctl(&mut self, payload: &[u8]) -> Result<usize, Error> {
        self.ctl_pipe
            .write_all(payload)
            .map_err(|err| Error::os_error(err, "Control pipe write failed"))?;
        Ok(payload.len())
    }

    /// Serve one run: deliver stdin, send the control payload, collect the
    /// child's pid and wait status, classify.
    pub fn run(
        &mut self,
        payload: &[u8],
        stdin_bytes: &[u8],
        timeout: Duration,
        action: TimeoutAction,
    ) -> Result<ExitKind, Error> {
        self.out_file.write_buf(stdin_bytes)?;

        if self.write_ctl(payload).is_err() {
            return Err(Error::illegal_state(
                "Unable to request a new process from the fork server",
            ));
        }

        let (rlen, child_pid) = self.read_st()?;
        if rlen != 4 {
            return Err(Error::illegal_state(
                "Failed to receive a child pid from the fork server",
            ));
        }
        if child_pid <= 0 {
            return Err(Error::illegal_state("Fork server is misbehaving"));
        }
        self.child_pid = child_pid as pid_t;

        let (rlen, status, timed_out) = self.read_st_timed(timeout, action)?;
        if rlen != 4 {
            return Err(Error::illegal_state(
                "Unable to communicate with the fork server",
            ));
        }
        self.last_status = status;

        if !libc::WIFSTOPPED(status) {
            self.child_pid = 0;
        }

        Ok(classify_status(status, timed_out))
    }

    fn kill_server(&mut self) {
        if self.pid != 0 {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                libc::waitpid(self.pid, core::ptr::null_mut(), 0);
            }
            self.pid = 0;
        }
    }

    /// Tear the session down: close both pipes, kill the server process and
    /// remove the scratch stdin file. Safe to call more than once.
    pub fn stop(&mut self) {
        self.ctl_pipe.close_write_end();
        self.st_pipe.close_read_end();
        self.kill_server();
        let _ = std::fs::remove_file(&self.out_file.path);
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fork-server-mediated executor holding the coverage session and,
/// optionally, the branch-capture session.
#[derive(Debug)]
pub struct ForkserverExecutor {
    coverage: Forkserver,
    branch: Option<Forkserver>,
    timeout: Duration,
    mode: RunMode,
    timeout_action: TimeoutAction,
}

impl ForkserverExecutor {
    /// Start the coverage fork-server session for `target`.
    pub fn new(
        target: &str,
        args: &[String],
        envs: &[(String, String)],
        timeout: Duration,
        mode: RunMode,
    ) -> Result<Self, Error> {
        let coverage = Forkserver::new(
            target,
            args,
            envs,
            COVERAGE_FORKSRV_FD,
            SCRATCH_STDIN_COVERAGE,
            timeout,
        )?;
        Ok(Self {
            coverage,
            branch: None,
            timeout,
            mode,
            timeout_action: TimeoutAction::default(),
        })
    }

    /// Additionally start the branch-capture session.
    ///
    /// The branch session instruments different semantics, so it runs its own
    /// server with its own descriptor pair and scratch file.
    pub fn with_branch_session(
        mut self,
        target: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<Self, Error> {
        self.branch = Some(Forkserver::new(
            target,
            args,
            envs,
            BRANCH_FORKSRV_FD,
            SCRATCH_STDIN_BRANCH,
            self.timeout,
        )?);
        Ok(self)
    }

    /// What to do with children that blow the deadline.
    #[must_use]
    pub fn timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// The coverage session
    #[must_use]
    pub fn coverage_session(&self) -> &Forkserver {
        &self.coverage
    }

    /// The branch session, if started
    #[must_use]
    pub fn branch_session(&self) -> Option<&Forkserver> {
        self.branch.as_ref()
    }

    /// Run one input through the coverage session.
    pub fn run_coverage(&mut self, stdin_bytes: &[u8], mode: RunMode) -> Result<ExitKind, Error> {
        let payload = i32::from(mode).to_ne_bytes();
        self.coverage
            .run(&payload, stdin_bytes, self.timeout, self.timeout_action)
    }

    /// Run one input through the branch session, capturing the comparison at
    /// `targ_addr` on its `targ_index`-th (1-based) hit.
    pub fn run_branch(
        &mut self,
        stdin_bytes: &[u8],
        targ_addr: GuestAddr,
        targ_index: u64,
    ) -> Result<ExitKind, Error> {
        let branch = self
            .branch
            .as_mut()
            .ok_or_else(|| Error::illegal_state("Branch session was never started"))?;

        let mut payload = [0_u8; 16];
        payload[..8].copy_from_slice(&(targ_addr as u64).to_ne_bytes());
        payload[8..].copy_from_slice(&targ_index.to_ne_bytes());
        branch.run(&payload, stdin_bytes, self.timeout, self.timeout_action)
    }

    /// Tear down all sessions. Also runs on drop.
    pub fn stop(&mut self) {
        self.coverage.stop();
        if let Some(branch) = &mut self.branch {
            branch.stop();
        }
    }
}

impl Executor for ForkserverExecutor {
    fn run_target(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error> {
        let mode = self.mode;
        self.run_coverage(stdin_bytes, mode)
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use serial_test::serial;

    use super::{Forkserver, RunMode, COVERAGE_FORKSRV_FD};

    #[test]
    fn run_mode_wire_values() {
        assert_eq!(i32::from(RunMode::CountNew), 0);
        assert_eq!(i32::from(RunMode::HashOnly), 1);
        assert_eq!(i32::from(RunMode::SetDump), 2);
        assert_eq!(i32::from(RunMode::BitmapAccum), 3);
        assert_eq!(RunMode::try_from(2).unwrap(), RunMode::SetDump);
        assert!(RunMode::try_from(17).is_err());
    }

    #[test]
    #[serial]
    fn missing_target_fails_cleanly() {
        let scratch = std::env::temp_dir().join(format!(".stdin_missing_{}", std::process::id()));
        let result = Forkserver::new(
            "/nonexistent/greyfork/binary",
            &[],
            &[],
            COVERAGE_FORKSRV_FD,
            scratch.to_str().unwrap(),
            Duration::from_millis(200),
        );
        assert!(result.is_err());
        let _ = std::fs::remove_file(&scratch);
    }
}
