//! Durable handoff of recorder state to the supervisor.
//!
//! The process this runs in may be killed without warning (a timeout ends in
//! `SIGKILL`), so every output handle is opened here, at setup time, before
//! the target's own code runs; the exit path never opens anything.
//! Accumulative logs are opened in append mode and new elements are written
//! at discovery time, so an abrupt death loses at most the in-memory
//! structures that get flushed once at normal exit (summary lines, the
//! comparison trace buffer).

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};

use greyfork::executors::forkserver::{
    RunMode, COVERAGE_LOG_ENV, EDGE_LOG_ENV, FEED_LOG_ENV, HASH_LOG_ENV, NODE_LOG_ENV,
    PATH_LOG_ENV,
};

use crate::{config::RecorderConfig, Error, GuestAddr};

/// Block every signal for the rest of the process.
///
/// The exit dump runs from paths that can also be entered via signal
/// handlers; a second signal arriving halfway through would tear the output.
pub fn block_all_signals() {
    unsafe {
        let mut mask: libc::sigset_t = core::mem::zeroed();
        if libc::sigfillset(&mut mask) < 0 {
            return;
        }
        libc::sigprocmask(libc::SIG_BLOCK, &mask, core::ptr::null_mut());
    }
}

/// The open output handles of one recorder.
///
/// All writes silently tolerate I/O errors: a reader of these artifacts
/// already has to cope with arbitrarily truncated files (the writer may die
/// mid-append), so a failed write is the same situation one step earlier.
#[derive(Debug, Default)]
pub struct FeedbackChannel {
    coverage: Option<File>,
    node: Option<File>,
    edge: Option<File>,
    path: Option<File>,
    hash: Option<File>,
    feed: Option<File>,
    dbg: Option<File>,
    detached: bool,
}

fn append_log<P>(path: P) -> Result<File, Error>
where
    P: AsRef<Path>,
{
    Ok(OpenOptions::new()
        .append(true)
        .create(true)
        .open(path.as_ref())?)
}

impl FeedbackChannel {
    /// Open the handles a coverage-session recorder needs for `mode`.
    ///
    /// A path key the mode depends on but that is not configured is a fatal
    /// configuration error.
    pub fn open_coverage(config: &RecorderConfig, mode: RunMode) -> Result<Self, Error> {
        let mut channel = Self::default();

        match mode {
            RunMode::CountNew => {
                let coverage =
                    RecorderConfig::require_path(&config.coverage_log, COVERAGE_LOG_ENV)?;
                // With the accumulative measurement report the summary itself
                // becomes append-only, one block of lines per execution.
                channel.coverage = Some(if config.measure_cov {
                    append_log(coverage)?
                } else {
                    File::create(coverage)?
                });
                channel.node = Some(append_log(RecorderConfig::require_path(
                    &config.node_log,
                    NODE_LOG_ENV,
                )?)?);
                channel.edge = Some(append_log(RecorderConfig::require_path(
                    &config.edge_log,
                    EDGE_LOG_ENV,
                )?)?);
                channel.path = Some(append_log(RecorderConfig::require_path(
                    &config.path_log,
                    PATH_LOG_ENV,
                )?)?);
            }
            RunMode::HashOnly => {
                channel.hash = Some(File::create(RecorderConfig::require_path(
                    &config.hash_log,
                    HASH_LOG_ENV,
                )?)?);
            }
            RunMode::SetDump | RunMode::BitmapAccum => {
                channel.coverage = Some(File::create(RecorderConfig::require_path(
                    &config.coverage_log,
                    COVERAGE_LOG_ENV,
                )?)?);
            }
        }

        if let Some(dbg_path) = &config.dbg_log {
            channel.dbg = Some(File::create(dbg_path)?);
        }

        Ok(channel)
    }

    /// Open the handles a branch-capture recorder needs.
    pub fn open_branch(config: &RecorderConfig) -> Result<Self, Error> {
        Ok(Self {
            feed: Some(File::create(RecorderConfig::require_path(
                &config.feed_log,
                FEED_LOG_ENV,
            )?)?),
            hash: Some(File::create(RecorderConfig::require_path(
                &config.hash_log,
                HASH_LOG_ENV,
            )?)?),
            ..Self::default()
        })
    }

    /// Whether [`detach`](Self::detach) was called.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Drop every handle without writing anything.
    ///
    /// A child created by the *guest's* own fork() inherits the parent's
    /// handles and must call this immediately, or both processes would dump
    /// feedback into the same files.
    pub fn detach(&mut self) {
        self.coverage = None;
        self.node = None;
        self.edge = None;
        self.path = None;
        self.hash = None;
        self.feed = None;
        self.dbg = None;
        self.detached = true;
    }

    fn append_word(file: &mut Option<File>, word: GuestAddr) {
        if let Some(file) = file {
            let _ = file.write_all(&word.to_ne_bytes());
        }
    }

    /// Append a newly discovered node to the accumulative node log.
    pub fn append_node(&mut self, node: GuestAddr) {
        Self::append_word(&mut self.node, node);
    }

    /// Append a newly discovered edge to the accumulative edge log.
    pub fn append_edge(&mut self, edge: GuestAddr) {
        Self::append_word(&mut self.edge, edge);
    }

    /// Append a newly observed path hash to the accumulative path log.
    pub fn append_path(&mut self, path_hash: GuestAddr) {
        Self::append_word(&mut self.path, path_hash);
    }

    /// Mirror a new node's coordinates to the debug log, if one is open.
    pub fn dbg_pair(&mut self, addr: GuestAddr, ctx: GuestAddr) {
        if let Some(dbg) = &mut self.dbg {
            let _ = writeln!(dbg, "(0x{addr:x}, 0x{ctx:x})");
        }
    }

    /// Mirror a new edge's source address to the debug log, if one is open.
    pub fn dbg_addr(&mut self, addr: GuestAddr) {
        if let Some(dbg) = &mut self.dbg {
            let _ = writeln!(dbg, "(0x{addr:x})");
        }
    }

    /// Write the three-line coverage summary (count-new and bitmap modes).
    pub fn write_summary(&mut self, new_elems: u32, path_hash: GuestAddr, set_hash: GuestAddr) {
        if let Some(coverage) = &mut self.coverage {
            let _ = writeln!(coverage, "{new_elems}");
            let _ = writeln!(coverage, "{path_hash}");
            let _ = writeln!(coverage, "{set_hash}");
        }
    }

    /// Append one execution's accumulative measurement report, each counter as
    /// `total (+new)`.
    pub fn write_measure_report(
        &mut self,
        nodes: (usize, usize),
        edges: (usize, usize),
        paths: (usize, usize),
    ) {
        if let Some(coverage) = &mut self.coverage {
            let _ = writeln!(coverage, "Visited nodes : {} (+{})", nodes.0, nodes.1);
            let _ = writeln!(coverage, "Visited edges : {} (+{})", edges.0, edges.1);
            let _ = writeln!(coverage, "Explored paths : {} (+{})", paths.0, paths.1);
            let _ = writeln!(coverage, "=========================");
        }
    }

    /// Write the single-line hash output (hash-only mode, branch sessions).
    pub fn write_hash(&mut self, hash: GuestAddr) {
        if let Some(hash_file) = &mut self.hash {
            let _ = writeln!(hash_file, "{hash}");
        }
    }

    /// Dump a raw per-execution set as flat native-endian words.
    pub fn write_set_dump<I>(&mut self, elems: I)
    where
        I: IntoIterator<Item = GuestAddr>,
    {
        if let Some(coverage) = &mut self.coverage {
            for elem in elems {
                let _ = coverage.write_all(&elem.to_ne_bytes());
            }
        }
    }

    /// Write one comparison record to the branch trace.
    ///
    /// Both operands must already be truncated; only their lowest `width`
    /// bytes go on the wire.
    pub fn write_feed_record(
        &mut self,
        addr: GuestAddr,
        type_tag: u8,
        operand1: u64,
        operand2: u64,
        width: u8,
    ) {
        if let Some(feed) = &mut self.feed {
            let _ = feed.write_all(&addr.to_ne_bytes());
            let _ = feed.write_all(&[type_tag]);
            let _ = feed.write_all(&operand1.to_le_bytes()[..width as usize]);
            let _ = feed.write_all(&operand2.to_le_bytes()[..width as usize]);
        }
    }

    /// Flush pre-encoded trace records to the branch trace.
    pub fn write_feed_bytes(&mut self, bytes: &[u8]) {
        if let Some(feed) = &mut self.feed {
            let _ = feed.write_all(bytes);
        }
    }

    /// Write the all-zero word that terminates a branch trace.
    pub fn write_feed_terminator(&mut self) {
        Self::append_word(&mut self.feed, 0);
    }
}
