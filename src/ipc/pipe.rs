//! Named-pipe wake-up signals.
//!
//! Each direction of a session uses its own FIFO. The byte written is
//! advisory: a signal only means "the region holds something for you".
//! Read ends are opened non-blocking so that opening never waits for a
//! writer and [`PipeReader::timed_read`] can double as the shutdown poll.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Errors raised by the pipe signal channel.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("could not create pipe {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not open pipe {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not send signal: {0}")]
    Send(#[source] io::Error),

    #[error("could not read signal: {0}")]
    Read(#[source] io::Error),

    #[error("pipe closed by peer")]
    EndOfChannel,

    #[error("could not close pipe: {0}")]
    Close(#[source] io::Error),
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn close_fd(fd: RawFd) -> Result<(), PipeError> {
    if unsafe { libc::close(fd) } == -1 {
        return Err(PipeError::Close(io::Error::last_os_error()));
    }
    Ok(())
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Remove any stale pipe at `path` and create a fresh FIFO there.
pub fn create(path: &Path) -> Result<(), PipeError> {
    // A leftover file from a previous session would make mkfifo fail.
    let _ = std::fs::remove_file(path);

    let to_create_error = |source| PipeError::Create {
        path: path.to_path_buf(),
        source,
    };
    let name = c_path(path).map_err(to_create_error)?;

    if unsafe { libc::mkfifo(name.as_ptr(), 0o600) } == -1 {
        return Err(to_create_error(io::Error::last_os_error()));
    }
    Ok(())
}

/// Read end of a signal pipe.
#[derive(Debug)]
pub struct PipeReader {
    file: File,
    path: PathBuf,
}

impl PipeReader {
    /// Open `path` for reading. Does not wait for a writer.
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| PipeError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the current descriptor and open the pipe again.
    ///
    /// Used after the writer went away so that the next writer is picked up
    /// instead of reporting end-of-channel forever.
    pub fn reopen(&mut self) -> Result<(), PipeError> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    /// Block until one byte arrives.
    pub fn read(&mut self) -> Result<u8, PipeError> {
        loop {
            if let Some(byte) = self.poll_read(-1)? {
                return Ok(byte);
            }
        }
    }

    /// Wait at most `timeout` for one byte.
    ///
    /// `Ok(None)` means nothing arrived in time (or the wait was interrupted
    /// by a signal); it is not an error.
    pub fn timed_read(&mut self, timeout: Duration) -> Result<Option<u8>, PipeError> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.poll_read(timeout_ms)
    }

    fn poll_read(&mut self, timeout_ms: i32) -> Result<Option<u8>, PipeError> {
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(PipeError::Read(err));
        }
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 1];
        match self.file.read(&mut buf) {
            Ok(0) => Err(PipeError::EndOfChannel),
            Ok(_) => Ok(Some(buf[0])),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(PipeError::Read(e)),
        }
    }

    /// Release the descriptor, reporting a failed close.
    pub fn close(self) -> Result<(), PipeError> {
        close_fd(self.file.into_raw_fd())
    }
}

/// Write end of a signal pipe.
#[derive(Debug)]
pub struct PipeWriter {
    file: File,
    path: PathBuf,
}

impl PipeWriter {
    /// Open `path` for writing, blocking until a reader has it open.
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| PipeError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open `path` for writing, giving up if no reader shows up in `timeout`.
    pub fn open_with_timeout(path: &Path, timeout: Duration) -> Result<Self, PipeError> {
        Self::open_while(path, timeout, || true)
    }

    /// Like [`PipeWriter::open_with_timeout`], but also stops retrying as
    /// soon as `keep_waiting` returns false. The error source is then
    /// `ErrorKind::Interrupted`.
    pub fn open_while(
        path: &Path,
        timeout: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> Result<Self, PipeError> {
        let deadline = Instant::now() + timeout;
        let to_open_error = |source| PipeError::Open {
            path: path.to_path_buf(),
            source,
        };

        loop {
            let attempt = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path);

            match attempt {
                Ok(file) => {
                    set_blocking(&file).map_err(to_open_error)?;
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                // ENXIO: no reader yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) && Instant::now() < deadline => {
                    if !keep_waiting() {
                        return Err(to_open_error(io::ErrorKind::Interrupted.into()));
                    }
                    std::thread::sleep(OPEN_RETRY_INTERVAL);
                }
                Err(e) => return Err(to_open_error(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write exactly one byte.
    pub fn send(&mut self, byte: u8) -> Result<(), PipeError> {
        loop {
            match self.file.write(&[byte]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(PipeError::Send(io::ErrorKind::WriteZero.into())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipeError::Send(e)),
            }
        }
    }

    /// Release the descriptor, reporting a failed close.
    pub fn close(self) -> Result<(), PipeError> {
        close_fd(self.file.into_raw_fd())
    }
}
