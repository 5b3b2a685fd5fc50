//! The unified trace recorder for basic-block coverage.
//!
//! One recorder, four policies ([`RunMode`]): per-execution sets diffed
//! against accumulative sets, a bare set hash, a raw set dump, or the
//! bitmap-backed edge counter. The embedding layer constructs a recorder
//! once per execution (in a fork-server child, right after the stub forks)
//! and calls [`record_block`](CoverageRecorder::record_block) from its
//! basic-block hook.

use hashbrown::HashSet;

use greyfork::{
    executors::forkserver::{RunMode, BITMAP_LOG_ENV, EDGE_LOG_ENV, NODE_LOG_ENV, PATH_LOG_ENV},
    feedback::read_accum_log,
};

use crate::{
    bitmap::{LocalBitmap, SharedBitmap},
    callstack::CallStack,
    channel::{block_all_signals, FeedbackChannel},
    config::RecorderConfig,
    djb2,
    maps::LibraryMap,
    Error, GuestAddr, ADDR_FOLD_SHIFT,
};

/// Records every visited basic block under the policy picked at setup.
#[derive(Debug)]
pub struct CoverageRecorder {
    mode: RunMode,
    channel: FeedbackChannel,
    measure_cov: bool,
    ctx_sensitivity: usize,
    callstack: CallStack,
    library_map: Option<LibraryMap>,
    path_hash: GuestAddr,
    prev_node: GuestAddr,
    /// Per-execution sets, reset by construction (one recorder per run)
    node_set: HashSet<GuestAddr>,
    edge_set: HashSet<GuestAddr>,
    /// Accumulative sets, loaded from the append-only logs (count-new mode)
    accum_nodes: HashSet<GuestAddr>,
    accum_edges: HashSet<GuestAddr>,
    accum_paths: HashSet<GuestAddr>,
    baseline_nodes: usize,
    baseline_edges: usize,
    baseline_paths: usize,
    new_node_cnt: u32,
    new_edge_cnt: u32,
    local_bitmap: Option<LocalBitmap>,
    shared_bitmap: Option<SharedBitmap>,
    new_bitmap_edges: u32,
    finished: bool,
}

impl CoverageRecorder {
    /// Set up a recorder for one execution.
    ///
    /// Opens every output handle now and, in count-new mode, loads the
    /// accumulative sets back from their logs. The mode comes from the
    /// configuration directly, or from the fork-server request when a stub
    /// delivered it.
    pub fn new(config: &RecorderConfig, mode: RunMode) -> Result<Self, Error> {
        // The channel opens the logs first (creating missing ones), so the
        // accumulative sets load cleanly on the very first run.
        let channel = FeedbackChannel::open_coverage(config, mode)?;

        let mut recorder = Self {
            mode,
            channel,
            measure_cov: config.measure_cov,
            ctx_sensitivity: config.ctx_sensitivity,
            callstack: CallStack::new(),
            library_map: None,
            path_hash: djb2::SEED,
            prev_node: 0,
            node_set: HashSet::new(),
            edge_set: HashSet::new(),
            accum_nodes: HashSet::new(),
            accum_edges: HashSet::new(),
            accum_paths: HashSet::new(),
            baseline_nodes: 0,
            baseline_edges: 0,
            baseline_paths: 0,
            new_node_cnt: 0,
            new_edge_cnt: 0,
            local_bitmap: None,
            shared_bitmap: None,
            new_bitmap_edges: 0,
            finished: false,
        };

        match mode {
            RunMode::CountNew => {
                recorder.accum_nodes = read_accum_log(RecorderConfig::require_path(
                    &config.node_log,
                    NODE_LOG_ENV,
                )?)?;
                recorder.accum_edges = read_accum_log(RecorderConfig::require_path(
                    &config.edge_log,
                    EDGE_LOG_ENV,
                )?)?;
                recorder.accum_paths = read_accum_log(RecorderConfig::require_path(
                    &config.path_log,
                    PATH_LOG_ENV,
                )?)?;
                recorder.baseline_nodes = recorder.accum_nodes.len();
                recorder.baseline_edges = recorder.accum_edges.len();
                recorder.baseline_paths = recorder.accum_paths.len();
                log::info!(
                    "Accumulative state loaded: {} nodes, {} edges, {} paths",
                    recorder.baseline_nodes,
                    recorder.baseline_edges,
                    recorder.baseline_paths
                );
            }
            RunMode::BitmapAccum => {
                recorder.local_bitmap = Some(LocalBitmap::new_local());
                recorder.shared_bitmap = Some(
                    SharedBitmap::attach_from_config(config)?
                        .ok_or_else(|| Error::key_not_found(BITMAP_LOG_ENV))?,
                );
            }
            RunMode::HashOnly | RunMode::SetDump => {}
        }

        Ok(recorder)
    }

    /// Adopt the library map built by the syscall tracer while the loader ran.
    pub fn set_library_map(&mut self, map: LibraryMap) {
        self.library_map = Some(map);
    }

    /// The mode this recorder was set up with
    #[must_use]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// The path hash folded so far
    #[must_use]
    pub fn path_hash(&self) -> GuestAddr {
        self.path_hash
    }

    /// Elements first discovered by this execution
    #[must_use]
    pub fn new_element_count(&self) -> u32 {
        match self.mode {
            RunMode::BitmapAccum => self.new_bitmap_edges,
            _ => self.new_node_cnt + self.new_edge_cnt,
        }
    }

    /// Record a call, for context-sensitive coverage.
    pub fn record_call(&mut self, ret_addr: GuestAddr) {
        self.callstack.push(ret_addr);
    }

    /// Record a return.
    pub fn record_ret(&mut self) {
        let _ = self.callstack.pop();
    }

    /// Record a longjmp-style unwind past intermediate frames.
    pub fn record_unwind(&mut self, ret_addr: GuestAddr) {
        self.callstack.unwind_to(ret_addr);
    }

    /// The block-entry hook: fold `addr` into the path hash, derive the node
    /// and edge identifiers, and update the mode's state.
    pub fn record_block(&mut self, addr: GuestAddr) {
        if self.finished {
            return;
        }

        let addr = match &self.library_map {
            Some(map) => map.normalize(addr),
            None => addr,
        };
        self.path_hash = djb2::fold_word(self.path_hash, addr);

        let ctx = self.callstack.context(self.ctx_sensitivity);
        let node = addr ^ ctx.wrapping_shl(ADDR_FOLD_SHIFT);
        let edge = self.prev_node.wrapping_shl(ADDR_FOLD_SHIFT) ^ node;
        self.prev_node = node;

        match self.mode {
            RunMode::CountNew => {
                // Dump new elements back to the log right away; a timeout kill
                // arrives without warning and must not lose them.
                if self.node_set.insert(node) && self.accum_nodes.insert(node) {
                    self.new_node_cnt += 1;
                    self.channel.append_node(node);
                    self.channel.dbg_pair(addr, ctx);
                }
                if self.edge_set.insert(edge) && self.accum_edges.insert(edge) {
                    self.new_edge_cnt += 1;
                    self.channel.append_edge(edge);
                }
            }
            RunMode::HashOnly | RunMode::SetDump => {
                self.node_set.insert(node);
            }
            RunMode::BitmapAccum => {
                if let Some(local) = &mut self.local_bitmap {
                    local.set(edge);
                }
                if let Some(shared) = &mut self.shared_bitmap {
                    if shared.set(edge) {
                        self.new_bitmap_edges += 1;
                        self.channel.dbg_addr(addr);
                    }
                }
            }
        }
    }

    /// Hash over the per-execution node set.
    ///
    /// Folded in sorted element order so the same set always hashes the same,
    /// whatever order the blocks were visited in.
    #[must_use]
    pub fn set_hash(&self) -> GuestAddr {
        let mut elems: Vec<GuestAddr> = self.node_set.iter().copied().collect();
        elems.sort_unstable();
        elems
            .into_iter()
            .fold(djb2::SEED, |hash, elem| djb2::fold_word(hash, elem))
    }

    /// Flush the once-per-execution outputs at normal exit.
    ///
    /// Idempotent, and a no-op after [`detach`](Self::detach).
    pub fn finish(&mut self) {
        if self.finished || self.channel.is_detached() {
            return;
        }
        self.finished = true;
        block_all_signals();

        match self.mode {
            RunMode::CountNew => {
                if self.accum_paths.insert(self.path_hash) {
                    self.channel.append_path(self.path_hash);
                }
                if self.measure_cov {
                    let nodes = self.accum_nodes.len();
                    let edges = self.accum_edges.len();
                    let paths = self.accum_paths.len();
                    self.channel.write_measure_report(
                        (nodes, nodes - self.baseline_nodes),
                        (edges, edges - self.baseline_edges),
                        (paths, paths - self.baseline_paths),
                    );
                } else {
                    self.channel.write_summary(
                        self.new_node_cnt + self.new_edge_cnt,
                        self.path_hash,
                        self.set_hash(),
                    );
                }
            }
            RunMode::HashOnly => {
                self.channel.write_hash(self.set_hash());
            }
            RunMode::SetDump => {
                let mut elems: Vec<GuestAddr> = self.node_set.iter().copied().collect();
                elems.sort_unstable();
                self.channel.write_set_dump(elems);
            }
            RunMode::BitmapAccum => {
                let set_hash = self
                    .local_bitmap
                    .as_ref()
                    .map_or(0, LocalBitmap::content_hash);
                self.channel
                    .write_summary(self.new_bitmap_edges, self.path_hash, set_hash);
            }
        }
    }

    /// Drop the output handles after a guest fork(); see
    /// [`FeedbackChannel::detach`].
    pub fn detach(&mut self) {
        self.channel.detach();
    }
}
