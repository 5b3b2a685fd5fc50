//! greyfork - the supervisor side of a greybox fuzzing execution core.
//!
//! This crate drives instrumented targets, either through a one-shot
//! `exec()`-style run or through a persistent fork server, delivers stdin
//! bytes, enforces timeouts via alarm signals, classifies how each execution
//! ended, and decodes the coverage/branch feedback the instrumented layer
//! leaves behind.
//!
//! The instrumentation-side counterparts (trace recorder, feedback channel,
//! target-side fork-server stub) live in the `greyfork_targets` crate; shared
//! OS plumbing lives in `greyfork_bolts`.

pub use greyfork_bolts::Error;
/// Re-export of the low-level crate
pub use greyfork_bolts as bolts;

#[cfg(unix)]
pub mod executors;
#[cfg(unix)]
pub mod feedback;

/// A guest address, as observed by the instrumented execution layer.
///
/// The width follows the guest architecture, not the host: 64-bit guests use
/// 8-byte coverage words, 32-bit guests (the `guest32` feature) 4-byte words.
/// All on-disk coverage formats are arrays of this type.
#[cfg(not(feature = "guest32"))]
pub type GuestAddr = u64;
/// A guest address, as observed by the instrumented execution layer.
#[cfg(feature = "guest32")]
pub type GuestAddr = u32;

/// Size in bytes of one coverage word in the log files
pub const GUEST_WORD_SIZE: usize = core::mem::size_of::<GuestAddr>();

/// Shift applied when folding two guest addresses into one coverage word
/// (edge derivation `(prev << SHIFT) ^ curr` and calling-context folding).
#[cfg(not(feature = "guest32"))]
pub const ADDR_FOLD_SHIFT: u32 = 16;
/// Shift applied when folding two guest addresses into one coverage word.
#[cfg(feature = "guest32")]
pub const ADDR_FOLD_SHIFT: u32 = 8;
