use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::fd::retry_eintr;

/// Open the physical transport the multiplexer frames its traffic over.
///
/// A path naming a Unix socket is connected to as a stream socket. Anything
/// else is opened read/write as a character device; terminals are switched to
/// raw mode so the line discipline never rewrites framed bytes.
pub fn open_transport(path: impl AsRef<Path>) -> Result<OwnedFd> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(|e| TransportError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;

    if metadata.file_type().is_socket() {
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!(?path, "connected to socket transport");
        return Ok(OwnedFd::from(stream));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(|e| TransportError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

    // SAFETY: `isatty` only inspects the open descriptor owned by `file`.
    if unsafe { libc::isatty(file.as_raw_fd()) } == 1 {
        make_raw(file.as_raw_fd()).map_err(|e| TransportError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "terminal switched to raw mode");
    }

    info!(?path, "opened device transport");
    Ok(OwnedFd::from(file))
}

fn make_raw(fd: libc::c_int) -> std::io::Result<()> {
    // SAFETY: `termios` is plain old data; tcgetattr fully initializes it before use.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is an open terminal descriptor and `tio` is a valid writable termios.
    retry_eintr(|| unsafe { libc::tcgetattr(fd, &mut tio) })?;
    // SAFETY: `tio` was populated by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut tio) };
    // SAFETY: `fd` is an open terminal descriptor and `tio` is a valid termios.
    retry_eintr(|| unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) })?;
    Ok(())
}
