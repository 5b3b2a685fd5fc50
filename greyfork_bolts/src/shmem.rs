//! Shared memory maps for cross-execution coverage state.
//!
//! Two backings are supported: a SysV segment (`shmget`/`shmat`), whose id
//! travels to the instrumented child through an environment variable, and an
//! mmap of a regular file, used when the accumulative bitmap should survive
//! on disk as an inspectable log.

use core::{
    fmt::{self, Display},
    ops::{Deref, DerefMut},
    ptr, slice,
};
use std::{env, ffi::CString, path::Path};

use libc::{c_int, c_void};
use serde::{Deserialize, Serialize};

use crate::Error;

/// The id describing shared memory for the current backing.
///
/// For [`UnixShMem`] this is the SysV segment id as decimal digits; it is
/// what gets written to / read back from the environment.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ShMemId {
    id: [u8; 20],
}

impl ShMemId {
    /// Create a new id from a string
    #[must_use]
    pub fn from_string(val: &str) -> Self {
        let mut slice: [u8; 20] = [0; 20];
        for (i, val) in val.as_bytes().iter().enumerate() {
            slice[i] = *val;
        }
        Self { id: slice }
    }

    /// Create a new id from an int
    #[must_use]
    pub fn from_int(val: i32) -> Self {
        Self::from_string(&val.to_string())
    }

    /// Returns a `str` representation of this [`ShMemId`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        let null_pos = self.id.iter().position(|&c| c == 0).unwrap_or(20);
        core::str::from_utf8(&self.id[..null_pos]).unwrap()
    }
}

impl From<ShMemId> for i32 {
    fn from(id: ShMemId) -> i32 {
        id.as_str().parse().unwrap()
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An interface to a shared map.
pub trait ShMem: Sized + DerefMut<Target = [u8]> {
    /// Get the id of this shared memory mapping
    fn id(&self) -> ShMemId;

    /// Write this map's config to env, so a child process can attach to it
    /// with [`UnixShMem::existing_from_env`].
    fn write_to_env(&self, env_name: &str) -> Result<(), Error> {
        let map_size = self.len();
        env::set_var(env_name, self.id().to_string());
        env::set_var(format!("{env_name}_SIZE"), format!("{map_size}"));
        Ok(())
    }
}

/// The default sharedmap impl for unix using [`libc::shmget`], [`libc::shmat`].
#[derive(Debug)]
pub struct UnixShMem {
    id: ShMemId,
    map: *mut u8,
    map_size: usize,
    /// Only the creating process removes the segment on drop; children that
    /// merely attached must not tear it down under the parent.
    owner: bool,
}

impl UnixShMem {
    /// Create a new private shared memory segment of `map_size` bytes.
    pub fn new(map_size: usize) -> Result<Self, Error> {
        unsafe {
            let os_id = libc::shmget(
                libc::IPC_PRIVATE,
                map_size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            );
            if os_id < 0 {
                return Err(Error::last_os_error(format!(
                    "Failed to allocate a shared mapping of {map_size} bytes"
                )));
            }

            let map = libc::shmat(os_id, ptr::null(), 0) as *mut u8;
            if map as isize == -1 {
                libc::shmctl(os_id, libc::IPC_RMID, ptr::null_mut());
                return Err(Error::last_os_error(
                    "Failed to map the shared mapping".to_string(),
                ));
            }

            Ok(Self {
                id: ShMemId::from_int(os_id),
                map,
                map_size,
                owner: true,
            })
        }
    }

    /// Attach to an existing segment via its id.
    pub fn from_id_and_size(id: ShMemId, map_size: usize) -> Result<Self, Error> {
        unsafe {
            let id_int: i32 = id.into();
            let map = libc::shmat(id_int, ptr::null(), 0) as *mut u8;

            if map as isize == -1 {
                return Err(Error::last_os_error(format!(
                    "Failed to map the shared mapping with id {id_int}"
                )));
            }

            Ok(Self {
                id,
                map,
                map_size,
                owner: false,
            })
        }
    }

    /// Reads an existing map config from env vars, then attaches to it.
    pub fn existing_from_env(env_name: &str) -> Result<Self, Error> {
        let id_str = env::var(env_name)?;
        let map_size = str::parse::<usize>(&env::var(format!("{env_name}_SIZE"))?)?;
        Self::from_id_and_size(ShMemId::from_string(&id_str), map_size)
    }
}

impl ShMem for UnixShMem {
    fn id(&self) -> ShMemId {
        self.id
    }
}

impl Deref for UnixShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for UnixShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

impl Drop for UnixShMem {
    fn drop(&mut self) {
        unsafe {
            let id_int: i32 = self.id.into();
            libc::shmdt(self.map as *mut c_void);
            if self.owner {
                libc::shmctl(id_int, libc::IPC_RMID, ptr::null_mut());
            }
        }
    }
}

/// A shared map backed by an mmap of a regular file.
///
/// Unlike [`UnixShMem`], the backing outlives every process: reopening the
/// same path attaches to the same accumulated state. Used for the on-disk
/// accumulative edge bitmap.
#[derive(Debug)]
pub struct MmapShMem {
    map: *mut u8,
    map_size: usize,
    fd: c_int,
    id: ShMemId,
}

impl MmapShMem {
    /// Map `map_size` bytes of the file at `path`, creating and extending it
    /// as needed.
    pub fn new<P>(path: P, map_size: usize) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            Error::illegal_argument("Bitmap file path is not valid UTF-8".to_string())
        })?;
        let c_path = CString::new(path_str)
            .map_err(|_| Error::illegal_argument("Bitmap file path contains NUL".to_string()))?;

        log::debug!("Mapping {map_size} bytes of shared map file {path_str}");

        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644);
            if fd < 0 {
                return Err(Error::last_os_error(format!(
                    "Failed to open shared map file {path_str}"
                )));
            }

            if libc::ftruncate(fd, map_size as libc::off_t) != 0 {
                libc::close(fd);
                return Err(Error::last_os_error(format!(
                    "ftruncate() failed for shared map file {path_str}"
                )));
            }

            let map = libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if map == libc::MAP_FAILED {
                libc::close(fd);
                return Err(Error::last_os_error(format!(
                    "mmap() failed for shared map file {path_str}"
                )));
            }

            Ok(Self {
                map: map as *mut u8,
                map_size,
                fd,
                id: ShMemId::from_string(path_str),
            })
        }
    }
}

impl ShMem for MmapShMem {
    fn id(&self) -> ShMemId {
        self.id
    }
}

impl Deref for MmapShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for MmapShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

impl Drop for MmapShMem {
    fn drop(&mut self) {
        unsafe {
            // The file itself stays around, that is the point of this backing.
            libc::munmap(self.map as *mut c_void, self.map_size);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::{MmapShMem, ShMem, ShMemId, UnixShMem};

    #[test]
    #[serial]
    fn sysv_write_then_attach() {
        let mut shmem = UnixShMem::new(1024).unwrap();
        shmem[0] = 0xaa;
        shmem[1023] = 0x55;

        let attached = UnixShMem::from_id_and_size(shmem.id(), 1024).unwrap();
        assert_eq!(attached[0], 0xaa);
        assert_eq!(attached[1023], 0x55);
    }

    #[test]
    #[serial]
    fn sysv_env_roundtrip() {
        let shmem = UnixShMem::new(128).unwrap();
        shmem.write_to_env("GF_TEST_SHM").unwrap();
        let attached = UnixShMem::existing_from_env("GF_TEST_SHM").unwrap();
        assert_eq!(attached.len(), 128);
        assert_eq!(attached.id(), shmem.id());
    }

    #[test]
    fn mmap_file_persists() {
        let path = std::env::temp_dir().join(format!("gf_bitmap_test_{}", std::process::id()));
        {
            let mut shmem = MmapShMem::new(&path, 0x10000).unwrap();
            shmem[42] = 7;
        }
        {
            let shmem = MmapShMem::new(&path, 0x10000).unwrap();
            assert_eq!(shmem[42], 7);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn shmem_id_string() {
        let id = ShMemId::from_int(1234);
        assert_eq!(id.as_str(), "1234");
        assert_eq!(i32::from(id), 1234);
    }
}
