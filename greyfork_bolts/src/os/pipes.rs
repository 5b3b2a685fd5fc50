//! Unix `pipe` wrapper, used for the fork-server control and status channels

use core::time::Duration;
use std::{
    io::{self, ErrorKind, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    time::Instant,
};

use nix::unistd;

use crate::Error;

/// A unix pipe pair.
///
/// Both ends stay open until explicitly closed (or the [`Pipe`] is dropped),
/// so the raw descriptors can be handed to a child's `pre_exec` for `dup2`.
#[derive(Debug)]
pub struct Pipe {
    read_end: Option<OwnedFd>,
    write_end: Option<OwnedFd>,
}

impl Pipe {
    /// Create a new [`Pipe`]
    pub fn new() -> Result<Self, Error> {
        let (read_end, write_end) = unistd::pipe()?;
        Ok(Self {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    /// The read end of this pipe, if not closed
    #[must_use]
    pub fn read_end(&self) -> Option<RawFd> {
        self.read_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// The write end of this pipe, if not closed
    #[must_use]
    pub fn write_end(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Close the read end of this pipe
    pub fn close_read_end(&mut self) {
        // Dropping the OwnedFd closes it.
        self.read_end = None;
    }

    /// Close the write end of this pipe
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }

    /// Block until the read end has data (or the peer hung up), with a
    /// deadline.
    ///
    /// Returns `Ok(false)` when the deadline passes without anything to read.
    /// A signal arriving mid-wait resumes the wait with the remaining time.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool, Error> {
        let Some(read_end) = &self.read_end else {
            return Err(Error::illegal_state("Read pipe end was already closed"));
        };

        let deadline = Instant::now() + timeout;
        let mut pollfd = libc::pollfd {
            fd: read_end.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            match unsafe { libc::poll(&mut pollfd, 1, millis) } {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(Error::os_error(err, "poll() failed on the pipe"));
                }
                0 => return Ok(false),
                // POLLHUP counts as readable: the following read returns the
                // EOF the caller needs to see.
                _ => return Ok(pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0),
            }
        }
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match &self.read_end {
            Some(read_end) => match unistd::read(read_end.as_raw_fd(), buf) {
                Ok(res) => Ok(res),
                Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
            },
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Read pipe end was already closed",
            )),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match &self.write_end {
            Some(write_end) => match unistd::write(write_end, buf) {
                Ok(res) => Ok(res),
                Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
            },
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Write pipe end was already closed",
            )),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}
