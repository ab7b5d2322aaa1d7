use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Switch a descriptor to non-blocking mode.
///
/// Interrupted `fcntl` calls are retried.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();

    let flags = retry_eintr(|| {
        // SAFETY: `raw` comes from a live `BorrowedFd`, F_GETFL takes no extra argument.
        unsafe { libc::fcntl(raw, libc::F_GETFL) }
    })?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    retry_eintr(|| {
        // SAFETY: `raw` comes from a live `BorrowedFd`, F_SETFL takes an int flag set.
        unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) }
    })?;
    Ok(())
}

pub(crate) fn retry_eintr(mut call: impl FnMut() -> libc::c_int) -> io::Result<libc::c_int> {
    loop {
        let rc = call();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn nonblocking_read_reports_would_block() {
        let (mut left, _right) = UnixStream::pair().unwrap();
        set_nonblocking(left.as_fd()).unwrap();

        let mut buf = [0u8; 4];
        let err = left.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn set_nonblocking_is_idempotent() {
        let (left, _right) = UnixStream::pair().unwrap();
        set_nonblocking(left.as_fd()).unwrap();
        set_nonblocking(left.as_fd()).unwrap();
    }
}
