#![forbid(unsafe_code)]
//! Positional I/O over the shared backing file.
//!
//! The cache only ever reads from the file; `write_at` and `sync_all`
//! exist so that the external flusher can work against the same handle.
//! Positional reads carry their own offset and are safe to issue from any
//! number of threads concurrently.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use crate::error::{BrasaError, Result};

pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Tells the OS the byte range will not be needed again soon.
    ///
    /// A hint only; implementations may do nothing and errors are never
    /// reported.
    fn advise_dont_need(&self, _off: u64, _len: u64) {}
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !src.is_empty() {
        let written = file.write_at(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "write_at wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positional I/O unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positional I/O unsupported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn fadvise_dont_need(file: &File, off: u64, len: u64) {
    use std::os::unix::io::AsRawFd;

    use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};

    // Best effort; the kernel is free to ignore the hint and so are we.
    let _ = posix_fadvise(
        file.as_raw_fd(),
        off as nix::libc::off_t,
        len as nix::libc::off_t,
        PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    );
}

/// `FileIo` backed by an ordinary `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens (creating if absent) a read/write backing file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(BrasaError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_exact_at(self.file(), off, dst).map_err(BrasaError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all_at(self.file(), off, src).map_err(BrasaError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(BrasaError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(BrasaError::from)?.len())
    }

    #[cfg(target_os = "linux")]
    fn advise_dont_need(&self, off: u64, len: u64) {
        fadvise_dont_need(self.file(), off, len);
    }
}
