//! Filesystem helpers, most importantly the scratch stdin file.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    os::unix::prelude::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use crate::Error;

/// The default filename used to deliver stdin bytes to the target
pub const SCRATCH_STDIN: &str = ".stdin";

/// The scratch file target stdin is served from.
///
/// Created exclusively once per session and then rewritten in place for every
/// execution; recreating it per run would churn through descriptor numbers,
/// and over millions of runs that eventually collides with the fork-server's
/// reserved low descriptors.
#[derive(Debug)]
pub struct OutFile {
    /// The path of this [`OutFile`]
    pub path: PathBuf,
    /// The underlying file
    pub file: File,
}

impl OutFile {
    /// Create the scratch file, failing if it already exists.
    ///
    /// A stale leftover from a crashed prior run is reported as an error
    /// rather than silently reused. `reserved_fd` is the lowest descriptor
    /// number reserved for fork-server signaling; if the fresh descriptor
    /// lands within 10 of it, some other part of the process is leaking
    /// descriptors and we bail out before the protocol can be corrupted.
    pub fn create_exclusive<P>(path: P, reserved_fd: RawFd) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::illegal_state(format!(
                        "Stale scratch file {} exists, remove it before starting a new session",
                        path.display()
                    ))
                } else {
                    Error::file(err)
                }
            })?;

        let fd = file.as_raw_fd();
        if fd > reserved_fd - 10 {
            return Err(Error::illegal_state(format!(
                "Descriptor leak: scratch fd {fd} is too close to reserved fd {reserved_fd}"
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Gets the file as raw file descriptor
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Rewrite the file in place: seek to the start, write `buf`, truncate to
    /// its length, seek back so the consumer reads from offset 0.
    pub fn write_buf(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.rewind()?;
        self.file.write_all(buf)?;
        self.file.set_len(buf.len() as u64)?;
        self.file.flush()?;
        self.rewind()?;
        Ok(())
    }

    /// Rewind the file to the beginning
    pub fn rewind(&mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Remove the scratch file from disk (session teardown).
    pub fn unlink(self) -> Result<(), Error> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::OutFile;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("gf_outfile_{}_{name}", std::process::id()))
    }

    #[test]
    fn write_buf_truncates() {
        let path = tmp_path("trunc");
        let _ = std::fs::remove_file(&path);
        let mut out_file = OutFile::create_exclusive(&path, 198).unwrap();

        out_file.write_buf(b"a longer input").unwrap();
        out_file.write_buf(b"short").unwrap();

        let mut content = String::new();
        out_file.file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "short");

        out_file.unlink().unwrap();
    }

    #[test]
    fn stale_file_detected() {
        let path = tmp_path("stale");
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, b"leftover").unwrap();

        let err = OutFile::create_exclusive(&path, 198).unwrap_err();
        assert!(format!("{err}").contains("Stale scratch file"));

        std::fs::remove_file(&path).unwrap();
    }
}
