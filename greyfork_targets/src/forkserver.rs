//! Target-side fork-server stub.
//!
//! The supervisor (`greyfork::executors::forkserver`) execs the instrumented
//! target with a control/status pipe pair dup2'd onto a reserved low
//! descriptor pair. This stub runs inside the target after one-time
//! initialization: it phones home, then blocks on the control descriptor and
//! forks one fresh child per request. The child gets a fully re-initialized
//! address space for free; the server process only ever forks, reports and
//! reaps.
//!
//! The reserved descriptor pair is a contract with the supervisor, not a
//! hardcoded constant; both sides default to the same values
//! ([`COVERAGE_FORKSRV_FD`] / [`BRANCH_FORKSRV_FD`]).

use std::os::fd::{BorrowedFd, RawFd};

use greyfork::executors::forkserver::{RunMode, BRANCH_FORKSRV_FD, COVERAGE_FORKSRV_FD};
use greyfork_bolts::os::{fork, ForkResult};
use nix::unistd;

use crate::{Error, GuestAddr};

/// Which kind of session this stub serves; decides the control payload shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// Coverage/path collection; 4-byte run-mode payloads.
    Coverage,
    /// Branch-distance capture; 8-byte address + 8-byte index payloads.
    Branch,
}

impl SessionKind {
    /// The default reserved control descriptor for this kind
    #[must_use]
    pub fn default_fd(self) -> RawFd {
        match self {
            SessionKind::Coverage => COVERAGE_FORKSRV_FD,
            SessionKind::Branch => BRANCH_FORKSRV_FD,
        }
    }

    fn payload_len(self) -> usize {
        match self {
            SessionKind::Coverage => 4,
            SessionKind::Branch => 16,
        }
    }
}

/// One decoded "fork now" request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunRequest {
    /// Run with the given recorder mode.
    Coverage(RunMode),
    /// Capture the comparison at `targ_addr` on its `targ_index`-th hit
    /// (a zero address selects full-trace capture).
    Branch {
        /// Address of the targeted compare/test instruction
        targ_addr: GuestAddr,
        /// 1-based hit index
        targ_index: u64,
    },
}

/// How [`ForkserverStub::run`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StubState {
    /// Nobody is listening on the status descriptor: the target was started
    /// directly. Proceed with the configuration from the environment.
    NoServer,
    /// This process is a freshly forked child; serve the request, then exit.
    Child(RunRequest),
    /// The supervisor closed the control pipe; the server should exit.
    Finished,
}

/// The serving loop's state.
#[derive(Debug)]
pub struct ForkserverStub {
    kind: SessionKind,
    ctl_fd: RawFd,
    st_fd: RawFd,
    served: u64,
}

impl ForkserverStub {
    /// A stub on the default descriptor pair for `kind`.
    #[must_use]
    pub fn new(kind: SessionKind) -> Self {
        Self::with_reserved_fd(kind, kind.default_fd())
    }

    /// A stub on a custom reserved pair: control on `reserved_fd`, status on
    /// the next descriptor up. Must match what the supervisor dup2'd.
    #[must_use]
    pub fn with_reserved_fd(kind: SessionKind, reserved_fd: RawFd) -> Self {
        Self {
            kind,
            ctl_fd: reserved_fd,
            st_fd: reserved_fd + 1,
            served: 0,
        }
    }

    /// Requests served so far by this process
    #[must_use]
    pub fn served(&self) -> u64 {
        self.served
    }

    fn write_st(&self, payload: &[u8]) -> Result<(), Error> {
        // The descriptor is owned by the process for the stub's whole
        // lifetime; it is only borrowed for the write.
        let fd = unsafe { BorrowedFd::borrow_raw(self.st_fd) };
        let mut written = 0;
        while written < payload.len() {
            match unistd::write(fd, &payload[written..]) {
                Ok(len) => written += len,
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => {
                    return Err(Error::os_error(
                        std::io::Error::from_raw_os_error(err as i32),
                        "Status descriptor write failed",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Read one control payload. `Ok(None)` means the supervisor closed the
    /// pipe cleanly; a payload cut short mid-read is a protocol error.
    fn read_request(&self) -> Result<Option<RunRequest>, Error> {
        let mut buf = [0_u8; 16];
        let want = self.kind.payload_len();
        let mut nread = 0;
        while nread < want {
            match unistd::read(self.ctl_fd, &mut buf[nread..want]) {
                Ok(0) if nread == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::illegal_state(
                        "Control payload was cut short, supervisor gone?",
                    ))
                }
                Ok(len) => nread += len,
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => {
                    return Err(Error::os_error(
                        std::io::Error::from_raw_os_error(err as i32),
                        "Control descriptor read failed",
                    ))
                }
            }
        }

        Ok(Some(match self.kind {
            SessionKind::Coverage => decode_coverage_payload(&buf[..4])?,
            SessionKind::Branch => decode_branch_payload(&buf[..16]),
        }))
    }

    /// Phone home, then serve fork requests until the supervisor goes away.
    ///
    /// Returns in three ways: immediately with [`StubState::NoServer`] when
    /// no supervisor is attached, in every forked child with
    /// [`StubState::Child`] (the stub descriptors are already closed there),
    /// and in the server process with [`StubState::Finished`] once the
    /// control pipe is closed.
    pub fn run(&mut self) -> Result<StubState, Error> {
        // The readiness handshake; the supervisor only checks length.
        if self.write_st(&0_u32.to_ne_bytes()).is_err() {
            return Ok(StubState::NoServer);
        }

        loop {
            let Some(request) = self.read_request()? else {
                log::info!("Control pipe closed after {} runs, shutting down", self.served);
                return Ok(StubState::Finished);
            };

            match unsafe { fork() }? {
                ForkResult::Child => {
                    // The pipe pair belongs to the server; the child talks
                    // through the feedback channel only.
                    unsafe {
                        libc::close(self.ctl_fd);
                        libc::close(self.st_fd);
                    }
                    return Ok(StubState::Child(request));
                }
                ForkResult::Parent(child) => {
                    self.served += 1;
                    self.write_st(&child.pid.to_ne_bytes())?;
                    let status = child.wait();
                    self.write_st(&status.to_ne_bytes())?;
                }
            }
        }
    }
}

fn decode_coverage_payload(payload: &[u8]) -> Result<RunRequest, Error> {
    let raw = i32::from_ne_bytes(payload.try_into()?);
    let mode = RunMode::try_from(raw)
        .map_err(|_| Error::illegal_state(format!("Unknown run mode {raw} in control payload")))?;
    Ok(RunRequest::Coverage(mode))
}

fn decode_branch_payload(payload: &[u8]) -> RunRequest {
    let targ_addr = u64::from_ne_bytes(payload[..8].try_into().unwrap()) as GuestAddr;
    let targ_index = u64::from_ne_bytes(payload[8..].try_into().unwrap());
    RunRequest::Branch {
        targ_addr,
        targ_index,
    }
}
