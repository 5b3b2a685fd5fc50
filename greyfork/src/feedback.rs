//! Parent-side decoding of the artifacts the trace recorder leaves behind.
//!
//! Everything here reads files written by `greyfork_targets` from inside a
//! process that may have been killed without warning, so partially written
//! tails are tolerated (and logged), never fatal.

use std::path::Path;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{executors::forkserver::RunMode, Error, GuestAddr, GUEST_WORD_SIZE};

/// Mask extracting the operand width (in bytes) from a comparison type tag
pub const CMP_SIZE_MASK: u8 = 0x3f;
/// Mask extracting the comparison kind from a type tag
pub const CMP_KIND_MASK: u8 = 0xc0;
/// Type tag kind bit: an arithmetic `cmp`
pub const CMP_KIND_CMP: u8 = 0x80;
/// Type tag kind bit: a `test` (bitwise-and flags check)
pub const CMP_KIND_TEST: u8 = 0x40;

/// Reconstruct an accumulative set from its append-only log file.
///
/// The file is a flat array of native-endian [`GuestAddr`] words. A torn
/// trailing word (the writer was SIGKILL'd mid-append) is skipped.
pub fn read_accum_log<P>(path: P) -> Result<HashSet<GuestAddr>, Error>
where
    P: AsRef<Path>,
{
    let bytes = std::fs::read(path.as_ref())?;
    if bytes.len() % GUEST_WORD_SIZE != 0 {
        log::warn!(
            "Accumulative log {} has a torn tail of {} bytes, ignoring it",
            path.as_ref().display(),
            bytes.len() % GUEST_WORD_SIZE
        );
    }

    let mut set = HashSet::with_capacity(bytes.len() / GUEST_WORD_SIZE);
    for chunk in bytes.chunks_exact(GUEST_WORD_SIZE) {
        set.insert(GuestAddr::from_ne_bytes(chunk.try_into().unwrap()));
    }
    Ok(set)
}

/// The text summary the recorder writes at exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Count of elements first observed in this execution
    /// (absent in hash-only mode)
    pub new_elem_count: Option<u32>,
    /// Path hash of this execution (absent in hash-only mode)
    pub path_hash: Option<GuestAddr>,
    /// Hash over the per-execution set (or bitmap)
    pub set_hash: GuestAddr,
}

/// Read and parse the coverage summary file for the given mode.
pub fn read_coverage_summary<P>(path: P, mode: RunMode) -> Result<CoverageSummary, Error>
where
    P: AsRef<Path>,
{
    let text = std::fs::read_to_string(path)?;
    parse_coverage_summary(&text, mode)
}

/// Parse a coverage summary. Line layout depends on the mode: count-new and
/// bitmap mode emit three lines (new-element count, path hash, set hash),
/// hash-only a single set-hash line.
pub fn parse_coverage_summary(text: &str, mode: RunMode) -> Result<CoverageSummary, Error> {
    let mut lines = text.lines();
    let mut next_line = |what: &str| {
        lines
            .next()
            .ok_or_else(|| Error::illegal_state(format!("Coverage summary is missing {what}")))
    };

    match mode {
        RunMode::CountNew | RunMode::BitmapAccum => {
            let new_elem_count = next_line("the new-element count")?.trim().parse::<u32>()?;
            let path_hash = next_line("the path hash")?.trim().parse::<GuestAddr>()?;
            let set_hash = next_line("the set hash")?.trim().parse::<GuestAddr>()?;
            Ok(CoverageSummary {
                new_elem_count: Some(new_elem_count),
                path_hash: Some(path_hash),
                set_hash,
            })
        }
        RunMode::HashOnly => {
            let set_hash = next_line("the set hash")?.trim().parse::<GuestAddr>()?;
            Ok(CoverageSummary {
                new_elem_count: None,
                path_hash: None,
                set_hash,
            })
        }
        RunMode::SetDump => Err(Error::illegal_argument(
            "Set-dump runs write a binary set, not a text summary",
        )),
    }
}

/// Read a raw per-execution set dump (set-dump mode output).
pub fn read_set_dump<P>(path: P) -> Result<HashSet<GuestAddr>, Error>
where
    P: AsRef<Path>,
{
    read_accum_log(path)
}

/// Read the hash log. A stored `0` is the recorder's "no usable data"
/// sentinel (e.g. the comparison trace overflowed) and maps to `None`.
pub fn read_hash_log<P>(path: P) -> Result<Option<GuestAddr>, Error>
where
    P: AsRef<Path>,
{
    let text = std::fs::read_to_string(path)?;
    let hash = text.trim().parse::<GuestAddr>()?;
    Ok(if hash == 0 { None } else { Some(hash) })
}

/// One captured comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Address of the compare/test instruction
    pub addr: GuestAddr,
    /// Kind | operand width, see the `CMP_*` masks
    pub type_tag: u8,
    /// First operand, zero-extended from its truncated width
    pub operand1: u64,
    /// Second operand, zero-extended from its truncated width
    pub operand2: u64,
}

impl BranchRecord {
    /// Operand width in bytes (1, 2, 4 or 8)
    #[must_use]
    pub fn operand_size(&self) -> u8 {
        self.type_tag & CMP_SIZE_MASK
    }

    /// Whether this was a `test` rather than a `cmp`
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.type_tag & CMP_KIND_MASK == CMP_KIND_TEST
    }
}

/// Read a branch trace file.
pub fn read_branch_trace<P>(path: P) -> Result<Vec<BranchRecord>, Error>
where
    P: AsRef<Path>,
{
    let bytes = std::fs::read(path)?;
    parse_branch_trace(&bytes)
}

/// Decode a branch trace: a sequence of
/// `{addr: word, type_tag: byte, operand1, operand2}` records where the
/// operand width is `type_tag & 0x3f`, ended by an all-zero word.
///
/// A trace cut short by abrupt termination (no terminator) yields the
/// records read so far.
pub fn parse_branch_trace(bytes: &[u8]) -> Result<Vec<BranchRecord>, Error> {
    let mut records = Vec::new();
    let mut pos = 0;

    loop {
        if pos + GUEST_WORD_SIZE > bytes.len() {
            log::warn!("Branch trace ends without a terminator after {} records", records.len());
            break;
        }
        let addr =
            GuestAddr::from_ne_bytes(bytes[pos..pos + GUEST_WORD_SIZE].try_into().unwrap());
        pos += GUEST_WORD_SIZE;
        if addr == 0 {
            break;
        }

        let Some(&type_tag) = bytes.get(pos) else {
            log::warn!("Branch trace ends inside a record, dropping it");
            break;
        };
        pos += 1;

        let width = (type_tag & CMP_SIZE_MASK) as usize;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(Error::illegal_state(format!(
                "Branch trace record at offset {pos} has invalid operand width {width}"
            )));
        }

        if pos + 2 * width > bytes.len() {
            log::warn!("Branch trace ends inside a record, dropping it");
            break;
        }
        let operand1 = read_le_word(&bytes[pos..pos + width]);
        let operand2 = read_le_word(&bytes[pos + width..pos + 2 * width]);
        pos += 2 * width;

        records.push(BranchRecord {
            addr,
            type_tag,
            operand1,
            operand2,
        });
    }

    Ok(records)
}

/// Zero-extend up to 8 little-endian bytes into a u64.
fn read_le_word(bytes: &[u8]) -> u64 {
    let mut buf = [0_u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accum_log_roundtrip_dedups() {
        let path = std::env::temp_dir().join(format!("gf_accum_{}", std::process::id()));
        let values: Vec<GuestAddr> = vec![3, 1, 2, 3, 1, 0xdead_beef as GuestAddr];
        let mut bytes = Vec::new();
        for value in &values {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();

        let set = read_accum_log(&path).unwrap();
        assert_eq!(set.len(), 4);
        assert!(set.contains(&(0xdead_beef as GuestAddr)));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn count_new_summary_has_three_lines() {
        let summary = parse_coverage_summary("7\n12345\n67890\n", RunMode::CountNew).unwrap();
        assert_eq!(summary.new_elem_count, Some(7));
        assert_eq!(summary.path_hash, Some(12345));
        assert_eq!(summary.set_hash, 67890);
    }

    #[test]
    fn hash_only_summary_has_one_line() {
        let summary = parse_coverage_summary("424242\n", RunMode::HashOnly).unwrap();
        assert_eq!(summary.new_elem_count, None);
        assert_eq!(summary.path_hash, None);
        assert_eq!(summary.set_hash, 424242);
    }

    #[test]
    fn truncated_summary_is_an_error() {
        assert!(parse_coverage_summary("7\n12345\n", RunMode::CountNew).is_err());
    }

    #[test]
    fn branch_trace_roundtrip() {
        let mut bytes = Vec::new();
        // 4-byte cmp at 0x1000: 0x11223344 vs 0x11223399
        bytes.extend_from_slice(&(0x1000 as GuestAddr).to_ne_bytes());
        bytes.push(CMP_KIND_CMP | 4);
        bytes.extend_from_slice(&0x1122_3344_u32.to_le_bytes());
        bytes.extend_from_slice(&0x1122_3399_u32.to_le_bytes());
        // 1-byte test at 0x2000
        bytes.extend_from_slice(&(0x2000 as GuestAddr).to_ne_bytes());
        bytes.push(CMP_KIND_TEST | 1);
        bytes.push(0xff);
        bytes.push(0x0f);
        // terminator
        bytes.extend_from_slice(&(0 as GuestAddr).to_ne_bytes());

        let records = parse_branch_trace(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].addr, 0x1000);
        assert_eq!(records[0].operand_size(), 4);
        assert!(!records[0].is_test());
        assert_eq!(records[0].operand1, 0x1122_3344);
        assert_eq!(records[0].operand2, 0x1122_3399);
        assert_eq!(records[1].operand_size(), 1);
        assert!(records[1].is_test());
        assert_eq!(records[1].operand1, 0xff);
    }

    #[test]
    fn branch_trace_without_terminator_keeps_records() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(0x1000 as GuestAddr).to_ne_bytes());
        bytes.push(CMP_KIND_CMP | 2);
        bytes.extend_from_slice(&0xaaaa_u16.to_le_bytes());
        bytes.extend_from_slice(&0xbbbb_u16.to_le_bytes());
        // abrupt end, no terminator

        let records = parse_branch_trace(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operand1, 0xaaaa);
    }

    #[test]
    fn bad_width_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(0x1000 as GuestAddr).to_ne_bytes());
        bytes.push(CMP_KIND_CMP | 3);
        bytes.extend_from_slice(&[0; 6]);
        assert!(parse_branch_trace(&bytes).is_err());
    }

    #[test]
    fn zero_hash_is_a_sentinel() {
        let path = std::env::temp_dir().join(format!("gf_hash_{}", std::process::id()));
        std::fs::write(&path, "0\n").unwrap();
        assert_eq!(read_hash_log(&path).unwrap(), None);
        std::fs::write(&path, "5381\n").unwrap();
        assert_eq!(read_hash_log(&path).unwrap(), Some(5381));
        std::fs::remove_file(&path).unwrap();
    }
}
