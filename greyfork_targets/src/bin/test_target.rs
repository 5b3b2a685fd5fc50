//! A synthetic instrumented guest, used by the integration tests.
//!
//! The binary plays the role of "emulator + target" in one process: it reads
//! its input from stdin, emits a deterministic stream of block and comparison
//! events into the recorders, and then behaves like a target would. Specific
//! inputs trigger specific ends:
//!
//! - first four bytes decoding (little-endian) to `0x41424344` dereference a
//!   null pointer,
//! - an input starting with `hang` loops forever,
//! - anything else exits normally after flushing feedback.
//!
//! When `GF_FORK_SERVER` is set it serves fork-server sessions; the session
//! kind is inferred from the configuration (a branch session always has a
//! feed log). Every input byte raises one block event at a byte-dependent
//! address and one 1-byte comparison against `0x42` at [`CMP_BYTE_ADDR`].

use std::io::Read;

use greyfork::{
    executors::forkserver::RunMode,
    feedback::CMP_KIND_CMP,
};
use greyfork_targets::{
    cmps::{CmpOutcome, CmpRecorder, OperandWidth},
    config::RecorderConfig,
    coverage::CoverageRecorder,
    forkserver::{ForkserverStub, RunRequest, SessionKind, StubState},
    maps::LibraryMap,
    syscalls::{nr, SyscallTracer},
    GuestAddr,
};

/// Block address of the synthetic entry point
const BLOCK_ENTRY: GuestAddr = 0x1000;
/// Each input byte `b` visits block `BLOCK_BYTE_BASE + b * 0x10`
const BLOCK_BYTE_BASE: GuestAddr = 0x2000;
/// Block visited only when the input carries a full 4-byte word
const BLOCK_WORD: GuestAddr = 0x3000;
/// Address of the 4-byte comparison against [`MAGIC`]
const CMP_MAGIC_ADDR: GuestAddr = 0x4000;
/// Address of the per-byte comparison against `0x42`
const CMP_BYTE_ADDR: GuestAddr = 0x4100;
/// Crash trigger: the first four input bytes as a little-endian word
const MAGIC: u32 = 0x4142_4344;
/// Load address of the synthetic shared library
const LIB_BASE: GuestAddr = 0x7f00_0000;
/// Block inside the synthetic library, normalized through the library map
const LIB_BLOCK: GuestAddr = LIB_BASE + 0x123;

enum Behavior {
    Exit,
    Crash,
    Hang,
}

fn behavior(input: &[u8]) -> Behavior {
    if input.len() >= 4 && u32::from_le_bytes(input[..4].try_into().unwrap()) == MAGIC {
        Behavior::Crash
    } else if input.starts_with(b"hang") {
        Behavior::Hang
    } else {
        Behavior::Exit
    }
}

fn act(input: &[u8]) -> ! {
    match behavior(input) {
        Behavior::Crash => unsafe {
            // A genuine SIGSEGV, with no chance to flush anything.
            core::ptr::write_volatile(core::ptr::null_mut::<u32>(), 1);
            unreachable!()
        },
        Behavior::Hang => loop {
            std::thread::sleep(core::time::Duration::from_millis(50));
        },
        Behavior::Exit => std::process::exit(0),
    }
}

fn run_coverage(config: &RecorderConfig, mode: RunMode, map: LibraryMap, input: &[u8]) -> ! {
    let mut recorder =
        CoverageRecorder::new(config, mode).expect("coverage recorder setup failed");
    recorder.set_library_map(map);

    recorder.record_block(BLOCK_ENTRY);
    recorder.record_block(LIB_BLOCK);
    for &byte in input {
        recorder.record_block(BLOCK_BYTE_BASE + GuestAddr::from(byte) * 0x10);
    }
    if input.len() >= 4 {
        recorder.record_block(BLOCK_WORD);
    }

    if let Behavior::Exit = behavior(input) {
        recorder.finish();
    }
    act(input)
}

fn run_branch(config: &RecorderConfig, target: Option<(GuestAddr, u64)>, input: &[u8]) -> ! {
    let mut recorder = CmpRecorder::new(config, target).expect("cmp recorder setup failed");

    recorder.record_block(BLOCK_ENTRY);
    for &byte in input {
        recorder.record_block(BLOCK_BYTE_BASE + GuestAddr::from(byte) * 0x10);
        let outcome = recorder.record_comparison(
            CMP_BYTE_ADDR,
            u64::from(byte),
            0x42,
            CMP_KIND_CMP | u8::from(OperandWidth::Byte),
        );
        if outcome == CmpOutcome::FinishRun {
            recorder.finish();
            std::process::exit(0);
        }
    }
    if input.len() >= 4 {
        let word = u32::from_le_bytes(input[..4].try_into().unwrap());
        let outcome = recorder.record_comparison(
            CMP_MAGIC_ADDR,
            u64::from(word),
            u64::from(MAGIC),
            CMP_KIND_CMP | u8::from(OperandWidth::Long),
        );
        if outcome == CmpOutcome::FinishRun {
            recorder.finish();
            std::process::exit(0);
        }
    }

    if let Behavior::Exit = behavior(input) {
        recorder.finish();
    }
    act(input)
}

fn main() {
    let config = RecorderConfig::from_env().expect("recorder configuration is invalid");
    let branch_session = config.feed_log.is_some();

    // The "loader" runs before the fork-server loop; children inherit the
    // library map it built.
    let mut tracer = SyscallTracer::map_only();
    tracer.post_syscall(nr::OPEN, 0, 0, 0, 7, "/lib/libdemo.so");
    tracer.post_syscall(nr::MMAP, 0, 0x4000, 7, LIB_BASE as i64, "");

    let request = if config.fork_server {
        let kind = if branch_session {
            SessionKind::Branch
        } else {
            SessionKind::Coverage
        };
        match ForkserverStub::new(kind).run().expect("fork-server stub failed") {
            StubState::Child(request) => Some(request),
            StubState::Finished => return,
            StubState::NoServer => None,
        }
    } else {
        None
    };

    let mut input = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut input);

    if branch_session {
        let target = match request {
            Some(RunRequest::Branch {
                targ_addr,
                targ_index,
            }) => Some((targ_addr, targ_index)),
            _ => config.feed_addr.zip(config.feed_idx),
        };
        run_branch(&config, target, &input);
    } else {
        let mode = match request {
            Some(RunRequest::Coverage(mode)) => mode,
            _ => config.mode.expect("no run mode configured"),
        };
        run_coverage(&config, mode, tracer.into_library_map(), &input);
    }
}
