//! Comparison capture: branch-distance feedback for the search algorithm.
//!
//! Two exclusive capture policies, selected by whether a target address is
//! configured. *Targeted* capture waits for the n-th execution of one
//! compare/test instruction, writes that single operand pair and, if the
//! operands differ, asks the embedding to end the run (nothing after the
//! capture point matters to the consumer). *Full-trace* capture buffers every
//! comparison up to a fixed cap and flushes the buffer once at exit.
//!
//! The hooks never terminate the process themselves; they hand back a
//! [`CmpOutcome`] and the embedding layer owns the actual exit.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use greyfork::feedback::{CMP_KIND_MASK, CMP_SIZE_MASK};

use crate::{
    channel::{block_all_signals, FeedbackChannel},
    config::RecorderConfig,
    djb2, Error, GuestAddr,
};

/// Cap on buffered comparison records in full-trace mode.
pub const MAX_TRACE_LEN: usize = 1_000_000;

/// Operand width code carried in the low bits of an incoming type tag.
///
/// On the wire the code is replaced by the width in bytes, so trace files
/// are self-describing without this table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OperandWidth {
    /// 1-byte operands
    Byte = 0,
    /// 2-byte operands
    Word = 1,
    /// 4-byte operands
    Long = 2,
    /// 8-byte operands, 64-bit guests only
    #[cfg(not(feature = "guest32"))]
    Quad = 3,
}

impl OperandWidth {
    /// The width in bytes
    #[must_use]
    pub fn bytes(self) -> u8 {
        match self {
            OperandWidth::Byte => 1,
            OperandWidth::Word => 2,
            OperandWidth::Long => 4,
            #[cfg(not(feature = "guest32"))]
            OperandWidth::Quad => 8,
        }
    }

    /// Truncate `operand` to this width.
    #[must_use]
    pub fn truncate(self, operand: u64) -> u64 {
        match self {
            OperandWidth::Byte => operand & 0xff,
            OperandWidth::Word => operand & 0xffff,
            OperandWidth::Long => operand & 0xffff_ffff,
            #[cfg(not(feature = "guest32"))]
            OperandWidth::Quad => operand,
        }
    }
}

/// What the embedding layer should do after a comparison hook.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum CmpOutcome {
    /// Keep executing the target.
    Continue,
    /// The capture is complete (or the trace overflowed): call
    /// [`CmpRecorder::finish`] and end the run.
    FinishRun,
}

/// Records compare/test instructions under one of the two capture policies.
#[derive(Debug)]
pub struct CmpRecorder {
    channel: FeedbackChannel,
    /// `Some` selects targeted capture; `None` the full trace
    targ_addr: Option<GuestAddr>,
    targ_index: u64,
    targ_hits: u64,
    trace: Vec<u8>,
    trace_count: usize,
    path_hash: GuestAddr,
    overflowed: bool,
    finished: bool,
}

impl CmpRecorder {
    /// Set up a recorder for one execution, opening the feed and hash outputs.
    ///
    /// `target` is the `(address, 1-based hit index)` pair for targeted
    /// capture, resolved from the environment or from a fork-server request;
    /// `None` (or a zero address) selects full-trace capture.
    pub fn new(config: &RecorderConfig, target: Option<(GuestAddr, u64)>) -> Result<Self, Error> {
        let channel = FeedbackChannel::open_branch(config)?;
        let target = target.filter(|&(addr, _)| addr != 0);
        Ok(Self {
            channel,
            targ_addr: target.map(|(addr, _)| addr),
            targ_index: target.map_or(0, |(_, index)| index),
            targ_hits: 0,
            trace: Vec::new(),
            trace_count: 0,
            path_hash: djb2::SEED,
            overflowed: false,
            finished: false,
        })
    }

    /// The hash folded over every visited block so far
    #[must_use]
    pub fn path_hash(&self) -> GuestAddr {
        self.path_hash
    }

    /// The block-entry hook: fold the address into the path hash.
    pub fn record_block(&mut self, addr: GuestAddr) {
        if self.finished {
            return;
        }
        self.path_hash = djb2::fold_word(self.path_hash, addr);
    }

    /// The comparison hook.
    ///
    /// `type_tag` carries the comparison kind in its high bits and an
    /// [`OperandWidth`] code in its low bits. An unknown width code means the
    /// instrumentation feeding this hook is broken, which is a fatal internal
    /// error, not a recoverable one.
    pub fn record_comparison(
        &mut self,
        curr_addr: GuestAddr,
        operand1: u64,
        operand2: u64,
        type_tag: u8,
    ) -> CmpOutcome {
        if self.finished {
            return CmpOutcome::Continue;
        }

        let width = OperandWidth::try_from(type_tag & CMP_SIZE_MASK)
            .expect("comparison type tag carries an unknown operand width");
        let kind = type_tag & CMP_KIND_MASK;
        let wire_tag = kind | width.bytes();
        let operand1 = width.truncate(operand1);
        let operand2 = width.truncate(operand2);

        if let Some(targ_addr) = self.targ_addr {
            if curr_addr == targ_addr {
                self.targ_hits += 1;
                // The hit index is 1-based; only the requested hit is captured.
                if self.targ_hits == self.targ_index {
                    self.channel.write_feed_record(
                        curr_addr,
                        wire_tag,
                        operand1,
                        operand2,
                        width.bytes(),
                    );
                    if operand1 != operand2 {
                        // Unequal operands: the distance data is complete and
                        // the rest of this execution is irrelevant.
                        return CmpOutcome::FinishRun;
                    }
                }
            }
            return CmpOutcome::Continue;
        }

        if self.trace_count >= MAX_TRACE_LEN {
            // Trace cap exceeded: truncate work, let the exit path write the
            // `0` hash sentinel so the consumer knows the data is unusable.
            self.overflowed = true;
            return CmpOutcome::FinishRun;
        }
        self.trace_count += 1;
        self.trace.extend_from_slice(&curr_addr.to_ne_bytes());
        self.trace.push(wire_tag);
        let width = width.bytes() as usize;
        self.trace.extend_from_slice(&operand1.to_le_bytes()[..width]);
        self.trace.extend_from_slice(&operand2.to_le_bytes()[..width]);
        CmpOutcome::Continue
    }

    /// Number of records buffered so far (full-trace mode)
    #[must_use]
    pub fn trace_len(&self) -> usize {
        self.trace_count
    }

    /// Flush the trace buffer, terminate the stream and write the path hash
    /// (`0` if the trace overflowed). Idempotent; no-op after
    /// [`detach`](Self::detach).
    pub fn finish(&mut self) {
        if self.finished || self.channel.is_detached() {
            return;
        }
        self.finished = true;
        block_all_signals();

        self.channel.write_feed_bytes(&self.trace);
        self.channel.write_feed_terminator();
        self.channel
            .write_hash(if self.overflowed { 0 } else { self.path_hash });
    }

    /// Drop the output handles after a guest fork(); see
    /// [`FeedbackChannel::detach`].
    pub fn detach(&mut self) {
        self.channel.detach();
    }
}

#[cfg(test)]
mod tests {
    use greyfork::feedback::{parse_branch_trace, read_hash_log, CMP_KIND_CMP, CMP_KIND_TEST};

    use super::{CmpOutcome, CmpRecorder, OperandWidth, MAX_TRACE_LEN};
    use crate::config::RecorderConfig;

    fn test_config(tag: &str) -> RecorderConfig {
        let dir = std::env::temp_dir().join(format!("gf_cmps_{}_{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        RecorderConfig {
            feed_log: Some(dir.join("feed")),
            hash_log: Some(dir.join("hash")),
            ..RecorderConfig::default()
        }
    }

    fn cleanup(config: &RecorderConfig) {
        let dir = config.feed_log.as_ref().unwrap().parent().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    fn cmp_tag(width: OperandWidth) -> u8 {
        CMP_KIND_CMP | u8::from(width)
    }

    #[test]
    fn widths_truncate_operands() {
        assert_eq!(OperandWidth::Byte.truncate(0x1234), 0x34);
        assert_eq!(OperandWidth::Word.truncate(0xdead_beef), 0xbeef);
        assert_eq!(OperandWidth::Long.truncate(0x1122_3344_5566_7788), 0x5566_7788);
        #[cfg(not(feature = "guest32"))]
        assert_eq!(
            OperandWidth::Quad.truncate(0x1122_3344_5566_7788),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    #[should_panic(expected = "unknown operand width")]
    fn unknown_width_is_fatal() {
        let config = test_config("badwidth");
        let mut recorder = CmpRecorder::new(&config, None).unwrap();
        let _ = recorder.record_comparison(0x1000, 1, 2, CMP_KIND_CMP | 0x3f);
    }

    #[test]
    fn targeted_capture_fires_on_the_right_hit() {
        let config = test_config("targeted");
        let mut recorder = CmpRecorder::new(&config, Some((0x4100, 3))).unwrap();

        // Hits 1 and 2 are not the requested index; nothing is recorded.
        assert_eq!(
            recorder.record_comparison(0x4100, 0x42, 0x42, cmp_tag(OperandWidth::Byte)),
            CmpOutcome::Continue
        );
        // A comparison at a different address never counts as a hit.
        assert_eq!(
            recorder.record_comparison(0x9999, 0x01, 0x02, cmp_tag(OperandWidth::Byte)),
            CmpOutcome::Continue
        );
        assert_eq!(
            recorder.record_comparison(0x4100, 0x42, 0x42, cmp_tag(OperandWidth::Byte)),
            CmpOutcome::Continue
        );
        // Hit 3 with unequal operands: captured, then the run ends.
        assert_eq!(
            recorder.record_comparison(0x4100, 0x17a, 0x42, cmp_tag(OperandWidth::Byte)),
            CmpOutcome::FinishRun
        );
        recorder.finish();

        let records =
            parse_branch_trace(&std::fs::read(config.feed_log.as_ref().unwrap()).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, 0x4100);
        assert_eq!(records[0].operand_size(), 1);
        // 0x17a truncated to its 1-byte width
        assert_eq!(records[0].operand1, 0x7a);
        assert_eq!(records[0].operand2, 0x42);
        cleanup(&config);
    }

    #[test]
    fn targeted_capture_with_equal_operands_continues() {
        let config = test_config("equal");
        let mut recorder = CmpRecorder::new(&config, Some((0x4100, 1))).unwrap();

        assert_eq!(
            recorder.record_comparison(0x4100, 0x42, 0x42, cmp_tag(OperandWidth::Byte)),
            CmpOutcome::Continue
        );
        recorder.record_block(0x1000);
        recorder.finish();

        let records =
            parse_branch_trace(&std::fs::read(config.feed_log.as_ref().unwrap()).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operand1, records[0].operand2);
        // The run completed, so the hash is real, not the overflow sentinel.
        assert!(read_hash_log(config.hash_log.as_ref().unwrap())
            .unwrap()
            .is_some());
        cleanup(&config);
    }

    #[test]
    fn full_trace_records_everything_in_order() {
        let config = test_config("fulltrace");
        let mut recorder = CmpRecorder::new(&config, None).unwrap();

        recorder.record_block(0x1000);
        let test_tag = CMP_KIND_TEST | u8::from(OperandWidth::Word);
        assert_eq!(
            recorder.record_comparison(0x2000, 0xaabb, 0xaacc, test_tag),
            CmpOutcome::Continue
        );
        assert_eq!(
            recorder.record_comparison(0x3000, 0x11223344, 0x99887766, cmp_tag(OperandWidth::Long)),
            CmpOutcome::Continue
        );
        assert_eq!(recorder.trace_len(), 2);
        recorder.finish();

        let records =
            parse_branch_trace(&std::fs::read(config.feed_log.as_ref().unwrap()).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].addr, 0x2000);
        assert!(records[0].is_test());
        assert_eq!(records[0].operand1, 0xaabb);
        assert_eq!(records[1].addr, 0x3000);
        assert_eq!(records[1].operand_size(), 4);
        assert_eq!(
            read_hash_log(config.hash_log.as_ref().unwrap()).unwrap(),
            Some(recorder.path_hash())
        );
        cleanup(&config);
    }

    #[test]
    fn trace_overflow_writes_the_sentinel() {
        let config = test_config("overflow");
        let mut recorder = CmpRecorder::new(&config, None).unwrap();
        recorder.record_block(0x1000);

        let tag = cmp_tag(OperandWidth::Byte);
        for i in 0..MAX_TRACE_LEN {
            assert_eq!(
                recorder.record_comparison(0x2000, (i & 0xff) as u64, 0, tag),
                CmpOutcome::Continue
            );
        }
        // One past the cap: truncate and bail out.
        assert_eq!(
            recorder.record_comparison(0x2000, 0, 0, tag),
            CmpOutcome::FinishRun
        );
        recorder.finish();

        assert_eq!(read_hash_log(config.hash_log.as_ref().unwrap()).unwrap(), None);
        let records =
            parse_branch_trace(&std::fs::read(config.feed_log.as_ref().unwrap()).unwrap()).unwrap();
        assert_eq!(records.len(), MAX_TRACE_LEN);
        cleanup(&config);
    }

    #[test]
    fn zero_target_address_means_full_trace() {
        let config = test_config("zerotarg");
        let mut recorder = CmpRecorder::new(&config, Some((0, 1))).unwrap();
        let _ = recorder.record_comparison(0x4100, 1, 2, cmp_tag(OperandWidth::Byte));
        assert_eq!(recorder.trace_len(), 1);
        cleanup(&config);
    }
}
