//! One-shot execution of a target, without a fork server.
//!
//! Stdin is served either from the scratch file (redirected onto descriptor
//! 0 before exec) or, for targets that insist on a terminal, through a
//! pseudo-terminal whose slave side is put into raw mode first.

use core::{mem, ptr, time::Duration};
use std::{
    ffi::CString,
    process::{Command, Stdio},
};

use greyfork_bolts::{
    fs::{OutFile, SCRATCH_STDIN},
    os::{dup2, null_fd},
    Error,
};
use libc::{c_int, pid_t};

use crate::executors::{
    classify_status,
    forkserver::COVERAGE_FORKSRV_FD,
    timeout::{wait_child, TimeoutAction},
    ConfigTarget, Executor, ExitKind,
};

/// Put the pty in raw mode: no canonical line editing, no echo, and no
/// signal-generating control characters (a 0x03 in the input payload must
/// reach the target as data, not as SIGINT).
fn term_setting(pty_fd: c_int) -> Result<(), Error> {
    unsafe {
        let mut tio: libc::termios = mem::zeroed();
        if libc::tcgetattr(pty_fd, &mut tio) < 0 {
            return Err(Error::last_os_error("tcgetattr() failed on the pty"));
        }
        tio.c_lflag &= !(libc::ICANON | libc::ECHO);
        tio.c_cc[libc::VINTR] = 0;
        tio.c_cc[libc::VQUIT] = 0;
        tio.c_cc[libc::VSUSP] = 0;
        if libc::tcsetattr(pty_fd, libc::TCSADRAIN, &tio) < 0 {
            return Err(Error::last_os_error("tcsetattr() failed on the pty"));
        }
    }
    Ok(())
}

/// Switch the (pty-served) stdin to non-blocking reads.
fn nonblocking_stdin() {
    unsafe {
        let mut flags = libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL, 0);
        if flags == -1 {
            flags = 0;
        }
        libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// Direct (non-fork-server) executor: one `exec()` per run.
#[derive(Debug)]
pub struct CommandExecutor {
    target: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    out_file: OutFile,
    timeout: Duration,
    use_pty: bool,
    timeout_action: TimeoutAction,
}

impl CommandExecutor {
    /// Create a new [`CommandExecutor`] for the given target binary.
    ///
    /// This claims the scratch stdin file exclusively, so only one executor
    /// (or fork-server session with the same path) can live in a working
    /// directory at a time.
    pub fn new<S>(target: S, args: Vec<String>, timeout: Duration) -> Result<Self, Error>
    where
        S: Into<String>,
    {
        let out_file = OutFile::create_exclusive(SCRATCH_STDIN, COVERAGE_FORKSRV_FD)?;
        Ok(Self {
            target: target.into(),
            args,
            envs: vec![],
            out_file,
            timeout,
            use_pty: false,
            timeout_action: TimeoutAction::default(),
        })
    }

    /// Deliver input through a pseudo-terminal instead of the scratch file.
    #[must_use]
    pub fn use_pty(mut self, use_pty: bool) -> Self {
        self.use_pty = use_pty;
        self
    }

    /// What to do with a child that blows the deadline (replay runs want the
    /// debugger-driven orderly exit).
    #[must_use]
    pub fn timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Add an environment variable for the target.
    #[must_use]
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Run the target once with `stdin_bytes` on its stdin.
    pub fn run(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error> {
        if self.use_pty {
            self.run_pty(stdin_bytes)
        } else {
            self.run_stdin_file(stdin_bytes)
        }
    }

    fn run_stdin_file(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error> {
        self.out_file.write_buf(stdin_bytes)?;

        let mut cmd = Command::new(&self.target);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, val) in &self.envs {
            cmd.env(key, val);
        }
        cmd.setsid()
            .setlimit(COVERAGE_FORKSRV_FD)
            .setstdin(self.out_file.as_raw_fd());

        let child = cmd.spawn()?;
        let pid = child.id() as pid_t;
        let (status, timed_out) = wait_child(pid, self.timeout, self.timeout_action)?;
        // Reaped via waitpid above, the std handle has nothing left to do.
        drop(child);

        Ok(classify_status(status, timed_out))
    }

    fn run_pty(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error> {
        let mut master: c_int = -1;
        let pid =
            unsafe { libc::forkpty(&mut master, ptr::null_mut(), ptr::null(), ptr::null()) };
        if pid < 0 {
            return Err(Error::last_os_error("forkpty() failed"));
        }

        if pid == 0 {
            // Child: the pty slave sits on fds 0-2; keep it as stdin only.
            if let Ok(devnull) = null_fd() {
                let _ = dup2(devnull, libc::STDOUT_FILENO);
                let _ = dup2(devnull, libc::STDERR_FILENO);
            }
            nonblocking_stdin();
            for (key, val) in &self.envs {
                std::env::set_var(key, val);
            }

            let prog = CString::new(self.target.as_str()).unwrap();
            let args: Vec<CString> = core::iter::once(self.target.as_str())
                .chain(self.args.iter().map(String::as_str))
                .map(|arg| CString::new(arg).unwrap())
                .collect();
            let mut argv: Vec<*const libc::c_char> =
                args.iter().map(|arg| arg.as_ptr()).collect();
            argv.push(ptr::null());

            unsafe {
                libc::execv(prog.as_ptr(), argv.as_ptr());
            }
            std::process::exit(-1);
        }

        // Parent: raw mode first, then hand the input to the slave's reader.
        term_setting(master)?;
        let written =
            unsafe { libc::write(master, stdin_bytes.as_ptr() as *const _, stdin_bytes.len()) };
        if written != stdin_bytes.len() as isize {
            unsafe {
                libc::close(master);
            }
            return Err(Error::last_os_error("Short write to the pty master"));
        }

        let result = wait_child(pid, self.timeout, self.timeout_action);
        unsafe {
            libc::close(master);
        }
        let (status, timed_out) = result?;

        Ok(classify_status(status, timed_out))
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.out_file.path);
    }
}

impl Executor for CommandExecutor {
    fn run_target(&mut self, stdin_bytes: &[u8]) -> Result<ExitKind, Error> {
        self.run(stdin_bytes)
    }
}
