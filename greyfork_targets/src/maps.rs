//! ASLR normalization for dynamically linked targets.
//!
//! Blocks inside a relocatable shared library get different raw addresses on
//! every run. By watching the loader's `open`/`openat` and `mmap` syscalls,
//! we learn which address range belongs to which library and rebase every
//! address in such a range onto a stable hash of the library's filename, so
//! the same block normalizes to the same coverage identifier across runs.

use hashbrown::HashMap;

use crate::{djb2, GuestAddr};

/// Upper bound on tracked libraries; loaders touching more than this are not
/// a realistic target and further mappings are ignored.
pub const MAX_LIB_COUNT: usize = 256;

#[derive(Debug, Clone)]
struct LibRange {
    start: GuestAddr,
    end: GuestAddr,
    lib_hash: GuestAddr,
    /// Kept for debug logging only
    name: String,
}

/// Library address ranges observed so far, plus the fd table needed to
/// connect an `mmap` back to the file it maps.
#[derive(Debug, Default)]
pub struct LibraryMap {
    fd_table: HashMap<i32, String>,
    libs: Vec<LibRange>,
}

impl LibraryMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful `open`/`openat` of `filename` returning `fd`.
    pub fn record_open(&mut self, filename: &str, fd: i32) {
        // We do not care about the cases where open() failed.
        if fd < 0 {
            return;
        }
        self.fd_table.insert(fd, filename.to_string());
    }

    /// Record an `mmap` of `size` bytes of `fd` at `start_addr`.
    pub fn record_mmap(&mut self, size: usize, fd: i32, start_addr: GuestAddr) {
        let Some(libname) = self.fd_table.get(&fd) else {
            return;
        };

        let lib_hash = djb2::fold_bytes(djb2::SEED, libname.as_bytes());
        let end_addr = start_addr.wrapping_add(size as GuestAddr);

        if let Some(existing) = self.libs.iter_mut().find(|lib| lib.lib_hash == lib_hash) {
            // Same library mapped again. Only a mapping that strictly
            // subsumes the known range replaces it; partial remaps of
            // individual segments are ignored.
            if start_addr <= existing.start && end_addr >= existing.end {
                log::debug!("Updating the mapping of {}", existing.name);
                existing.start = start_addr;
                existing.end = end_addr;
            }
            return;
        }

        if self.libs.len() >= MAX_LIB_COUNT {
            log::warn!("Library table full, not tracking {libname}");
            return;
        }

        self.libs.push(LibRange {
            start: start_addr,
            end: end_addr,
            lib_hash,
            name: libname.clone(),
        });
    }

    /// Neutralize the randomization of `addr`.
    ///
    /// Inside a known library range the address rebases to
    /// `addr - range.start + hash(filename)`; first matching range wins.
    /// Addresses outside every range (the main binary, anonymous maps) pass
    /// through unchanged.
    #[must_use]
    pub fn normalize(&self, addr: GuestAddr) -> GuestAddr {
        for lib in &self.libs {
            if lib.start <= addr && addr <= lib.end {
                return addr.wrapping_sub(lib.start).wrapping_add(lib.lib_hash);
            }
        }
        addr
    }

    /// Number of tracked library ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.libs.len()
    }

    /// Whether no library has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }
}
