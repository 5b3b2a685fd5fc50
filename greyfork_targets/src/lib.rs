//! greyfork_targets - the instrumentation side of the greyfork execution core.
//!
//! Everything in this crate runs *inside* the instrumented execution layer
//! (an emulator or interpreter driving the real target): the trace recorder
//! fed by its basic-block and comparison hooks, the feedback channel that
//! persists recorder state for the supervisor, the ASLR-normalizing library
//! map, and the target-side fork-server stub.
//!
//! The hooks are plain methods on explicit state structs; the embedding
//! layer constructs them once at setup and passes them into its callbacks.
//! Before setup has run (a dynamically linked target executes loader code
//! first), the embedding simply has no recorder yet and the events are
//! dropped.

#[cfg(unix)]
pub mod bitmap;
#[cfg(unix)]
pub mod callstack;
#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod cmps;
#[cfg(unix)]
pub mod config;
#[cfg(unix)]
pub mod coverage;
#[cfg(unix)]
pub mod forkserver;
#[cfg(unix)]
pub mod maps;
#[cfg(unix)]
pub mod syscalls;

pub use greyfork::{Error, GuestAddr, ADDR_FOLD_SHIFT, GUEST_WORD_SIZE};

/// The djb2 polynomial hash used by every wire format in this crate.
pub mod djb2 {
    use crate::{GuestAddr, GUEST_WORD_SIZE};

    /// djb2 starting value
    pub const SEED: GuestAddr = 5381;

    /// Fold one coverage word into `hash`, byte by byte, lowest byte first.
    #[inline]
    #[must_use]
    pub fn fold_word(hash: GuestAddr, word: GuestAddr) -> GuestAddr {
        let mut hash = hash;
        for i in 0..GUEST_WORD_SIZE as u32 {
            let byte = (word >> (i << 3)) & 0xff;
            hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte);
        }
        hash
    }

    /// Fold raw bytes (e.g. a filename) into `hash`.
    #[inline]
    #[must_use]
    pub fn fold_bytes(hash: GuestAddr, bytes: &[u8]) -> GuestAddr {
        let mut hash = hash;
        for &byte in bytes {
            hash = hash
                .wrapping_shl(5)
                .wrapping_add(hash)
                .wrapping_add(GuestAddr::from(byte));
        }
        hash
    }

}
