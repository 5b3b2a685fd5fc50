//! Syscall interception feeding the library map and an optional trace log.
//!
//! The embedding layer decodes the guest's syscall number and arguments
//! (tables differ per guest architecture, see [`nr`]) into a typed
//! [`SyscallEvent`]. `open`/`mmap` events keep the [`LibraryMap`] current --
//! libraries are opened and mapped while the loader runs, well before the
//! recorder is set up, so this tracer must work standalone. When a log path
//! is configured, descriptor-related events are additionally written out for
//! consumers that track how the target's stdin flows through `dup`/`read`.

use std::{fs::File, io::Write};

use crate::{config::RecorderConfig, maps::LibraryMap, Error, GuestAddr};

/// Guest syscall numbers for the supported events.
pub mod nr {
    /// `open`
    #[cfg(not(feature = "guest32"))]
    pub const OPEN: i64 = 2;
    /// `openat`
    #[cfg(not(feature = "guest32"))]
    pub const OPENAT: i64 = 257;
    /// `mmap`
    #[cfg(not(feature = "guest32"))]
    pub const MMAP: i64 = 9;
    /// `read`
    #[cfg(not(feature = "guest32"))]
    pub const READ: i64 = 0;
    /// `dup`
    #[cfg(not(feature = "guest32"))]
    pub const DUP: i64 = 32;
    /// `dup2`
    #[cfg(not(feature = "guest32"))]
    pub const DUP2: i64 = 33;
    /// `dup3`
    #[cfg(not(feature = "guest32"))]
    pub const DUP3: i64 = 292;

    /// `open`
    #[cfg(feature = "guest32")]
    pub const OPEN: i64 = 5;
    /// `openat`
    #[cfg(feature = "guest32")]
    pub const OPENAT: i64 = 295;
    /// `mmap2`
    #[cfg(feature = "guest32")]
    pub const MMAP: i64 = 192;
    /// `read`
    #[cfg(feature = "guest32")]
    pub const READ: i64 = 3;
    /// `dup`
    #[cfg(feature = "guest32")]
    pub const DUP: i64 = 41;
    /// `dup2`
    #[cfg(feature = "guest32")]
    pub const DUP2: i64 = 63;
    /// `dup3`
    #[cfg(feature = "guest32")]
    pub const DUP3: i64 = 330;
}

/// A decoded guest syscall worth recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallEvent<'a> {
    /// `open`/`openat` returned `fd` for `filename`
    Open {
        /// The opened path, as read from guest memory
        filename: &'a str,
        /// The returned descriptor (negative on failure)
        fd: i32,
    },
    /// `mmap` placed `size` bytes of `fd` at `addr`
    Mmap {
        /// Mapping length
        size: usize,
        /// The mapped descriptor
        fd: i32,
        /// Guest address of the new mapping
        addr: GuestAddr,
    },
    /// The target issued a `read` on `fd`
    Read {
        /// The descriptor being read
        fd: i32,
    },
    /// `dup`/`dup2`/`dup3` duplicated `old_fd` onto `new_fd`
    Dup {
        /// Source descriptor
        old_fd: i32,
        /// Resulting descriptor
        new_fd: i32,
    },
}

impl<'a> SyscallEvent<'a> {
    /// Decode a syscall that is about to execute.
    ///
    /// `read` and `dup2`/`dup3` are recorded on entry, since their
    /// descriptor arguments say everything worth logging. Returns `None`
    /// for numbers this tracer does not care about.
    #[must_use]
    pub fn pre(num: i64, arg1: u64, arg2: u64) -> Option<Self> {
        match num {
            nr::READ => Some(SyscallEvent::Read { fd: arg1 as i32 }),
            nr::DUP2 | nr::DUP3 => Some(SyscallEvent::Dup {
                old_fd: arg1 as i32,
                new_fd: arg2 as i32,
            }),
            _ => None,
        }
    }

    /// Decode a completed syscall from its number, argument registers and
    /// return value.
    ///
    /// `filename` is the NUL-terminated path the embedding layer read from
    /// guest memory when `num` is an open variant; other numbers ignore it.
    #[must_use]
    pub fn post(
        num: i64,
        arg1: u64,
        arg2: u64,
        arg5: u64,
        ret: i64,
        filename: &'a str,
    ) -> Option<Self> {
        match num {
            nr::OPEN | nr::OPENAT => Some(SyscallEvent::Open {
                filename,
                fd: ret as i32,
            }),
            nr::MMAP => Some(SyscallEvent::Mmap {
                size: arg2 as usize,
                fd: arg5 as i32,
                addr: ret as u64 as GuestAddr,
            }),
            nr::DUP => Some(SyscallEvent::Dup {
                old_fd: arg1 as i32,
                new_fd: ret as i32,
            }),
            _ => None,
        }
    }
}

/// Escape whitespace in a filename so one log line stays one event.
#[must_use]
pub fn escape_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' ' => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

/// Tracks syscalls: keeps the library map current and optionally logs
/// descriptor traffic.
#[derive(Debug)]
pub struct SyscallTracer {
    map: LibraryMap,
    log: Option<File>,
}

impl SyscallTracer {
    /// Create a tracer; opens the trace log now if one is configured, since
    /// no file may be opened on the exit path later.
    pub fn new(config: &RecorderConfig) -> Result<Self, Error> {
        let log = match &config.syscall_log {
            Some(path) => Some(File::create(path)?),
            None => None,
        };
        Ok(Self {
            map: LibraryMap::new(),
            log,
        })
    }

    /// Create a tracer with no log output (library map only).
    #[must_use]
    pub fn map_only() -> Self {
        Self {
            map: LibraryMap::new(),
            log: None,
        }
    }

    /// Dispatch a raw syscall-entry hook invocation.
    pub fn pre_syscall(&mut self, num: i64, arg1: u64, arg2: u64) {
        if let Some(event) = SyscallEvent::pre(num, arg1, arg2) {
            self.record(&event);
        }
    }

    /// Dispatch a raw syscall-return hook invocation; see
    /// [`SyscallEvent::post`] for the `filename` contract.
    pub fn post_syscall(
        &mut self,
        num: i64,
        arg1: u64,
        arg2: u64,
        arg5: u64,
        ret: i64,
        filename: &str,
    ) {
        if let Some(event) = SyscallEvent::post(num, arg1, arg2, arg5, ret, filename) {
            self.record(&event);
        }
    }

    /// Record one syscall event.
    pub fn record(&mut self, event: &SyscallEvent<'_>) {
        match *event {
            SyscallEvent::Open { filename, fd } => {
                self.map.record_open(filename, fd);
                self.log_line(&format!("open {fd} {}", escape_whitespace(filename)));
            }
            SyscallEvent::Mmap { size, fd, addr } => {
                self.map.record_mmap(size, fd, addr);
            }
            SyscallEvent::Read { fd } => {
                self.log_line(&format!("read {fd}"));
            }
            SyscallEvent::Dup { old_fd, new_fd } => {
                self.log_line(&format!("dup {old_fd} {new_fd}"));
            }
        }
    }

    fn log_line(&mut self, line: &str) {
        if let Some(log) = &mut self.log {
            let _ = writeln!(log, "{line}");
        }
    }

    /// The library map built so far
    #[must_use]
    pub fn library_map(&self) -> &LibraryMap {
        &self.map
    }

    /// Hand the finished library map to the coverage recorder once the
    /// loader is done.
    #[must_use]
    pub fn into_library_map(self) -> LibraryMap {
        self.map
    }

    /// Drop the log handle (guest fork children must not double-write).
    pub fn detach(&mut self) {
        self.log = None;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{escape_whitespace, SyscallEvent, SyscallTracer};
    use crate::config::RecorderConfig;

    #[test]
    fn whitespace_is_escaped() {
        assert_eq!(escape_whitespace("a b\nc\td\r"), "a\\sb\\nc\\td\\r");
        assert_eq!(escape_whitespace("/lib/x.so"), "/lib/x.so");
    }

    #[test]
    fn events_build_the_library_map() {
        let mut tracer = SyscallTracer::map_only();
        tracer.record(&SyscallEvent::Open {
            filename: "/lib/libz.so",
            fd: 4,
        });
        tracer.record(&SyscallEvent::Mmap {
            size: 0x3000,
            fd: 4,
            addr: 0x7f10_0000,
        });
        assert_eq!(tracer.library_map().len(), 1);
        assert_ne!(tracer.library_map().normalize(0x7f10_0100), 0x7f10_0100);
    }

    #[test]
    fn raw_dispatch_decodes_tracked_numbers() {
        use super::nr;

        assert_eq!(
            SyscallEvent::pre(nr::READ, 0, 0),
            Some(SyscallEvent::Read { fd: 0 })
        );
        assert_eq!(
            SyscallEvent::pre(nr::DUP2, 3, 0),
            Some(SyscallEvent::Dup { old_fd: 3, new_fd: 0 })
        );
        assert_eq!(
            SyscallEvent::post(nr::OPENAT, 0, 0, 0, 4, "/lib/libz.so"),
            Some(SyscallEvent::Open {
                filename: "/lib/libz.so",
                fd: 4
            })
        );
        assert_eq!(
            SyscallEvent::post(nr::MMAP, 0, 0x3000, 4, 0x7f10_0000, ""),
            Some(SyscallEvent::Mmap {
                size: 0x3000,
                fd: 4,
                addr: 0x7f10_0000
            })
        );
        assert_eq!(
            SyscallEvent::post(nr::DUP, 3, 0, 0, 7, ""),
            Some(SyscallEvent::Dup { old_fd: 3, new_fd: 7 })
        );
        // exit_group, bind and friends are not worth an event
        assert_eq!(SyscallEvent::pre(231, 0, 0), None);
        assert_eq!(SyscallEvent::post(231, 0, 0, 0, 0, ""), None);
    }

    #[test]
    fn raw_dispatch_feeds_the_library_map() {
        use super::nr;

        let mut tracer = SyscallTracer::map_only();
        tracer.post_syscall(nr::OPEN, 0, 0, 0, 5, "/lib/libm.so");
        tracer.post_syscall(nr::MMAP, 0, 0x2000, 5, 0x7f20_0000, "");
        assert_eq!(tracer.library_map().len(), 1);
    }

    #[test]
    fn log_lines_match_the_text_format() {
        let path = std::env::temp_dir().join(format!("gf_syscall_{}", std::process::id()));
        let config = RecorderConfig {
            syscall_log: Some(path.clone()),
            ..RecorderConfig::default()
        };
        let mut tracer = SyscallTracer::new(&config).unwrap();
        tracer.record(&SyscallEvent::Open {
            filename: "/tmp/in put",
            fd: 3,
        });
        tracer.record(&SyscallEvent::Read { fd: 0 });
        tracer.record(&SyscallEvent::Dup { old_fd: 3, new_fd: 0 });
        drop(tracer);

        let mut text = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "open 3 /tmp/in\\sput\nread 0\ndup 3 0\n");
        std::fs::remove_file(&path).unwrap();
    }
}
