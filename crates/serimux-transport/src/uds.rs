use std::io::ErrorKind;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Prefix of the environment variables init uses to publish control sockets.
pub const INHERITED_SOCKET_ENV_PREFIX: &str = "ANDROID_SOCKET_";

/// The local listening endpoint clients connect to.
///
/// Filesystem sockets created by [`UnixDomainSocket::bind`] are removed again
/// on `Drop`, but only if the path still refers to the socket we created.
/// Sockets adopted through [`UnixDomainSocket::from_inherited`] belong to
/// whoever created them and are never unlinked.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    /// Whether the path should be removed on drop (filesystem sockets only).
    cleanup_on_drop: bool,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    ///
    /// Every local client of the multiplexer must be able to connect.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o666;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the file already exists and is a socket, it is removed first
    /// (stale socket cleanup).
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on a filesystem-path Unix domain socket with explicit mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            TransportError::Bind {
                path: path.clone(),
                source: e,
            }
        })?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode,
            cleanup_on_drop: true,
        })
    }

    /// Adopt a listening socket published by init as `ANDROID_SOCKET_<name>`.
    pub fn from_inherited(name: &str) -> Result<Self> {
        let var = format!("{INHERITED_SOCKET_ENV_PREFIX}{name}");
        let value = std::env::var(&var).map_err(|_| TransportError::Inherited {
            name: name.to_string(),
            reason: format!("{var} is not set"),
        })?;
        let raw: libc::c_int = value.trim().parse().map_err(|_| TransportError::Inherited {
            name: name.to_string(),
            reason: format!("{var}={value} is not a descriptor number"),
        })?;
        if raw < 0 {
            return Err(TransportError::Inherited {
                name: name.to_string(),
                reason: format!("{var}={value} is negative"),
            });
        }

        // SAFETY: init hands this descriptor to exactly one process and nothing
        // else in serimux takes ownership of it; it stays open for our lifetime.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let listener = UnixListener::from(fd);
        listener.local_addr().map_err(|e| TransportError::Inherited {
            name: name.to_string(),
            reason: format!("fd {raw} is not a unix socket: {e}"),
        })?;

        info!(name, fd = raw, "adopted inherited control socket");

        Ok(Self {
            listener,
            path: PathBuf::from(format!("@{name}")),
            created_inode: None,
            cleanup_on_drop: false,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!("accepted connection");
        Ok(stream)
    }

    /// Accept one pending connection, if any, on a non-blocking listener.
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    pub fn try_accept(&self) -> Result<Option<UnixStream>> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => return Ok(Some(stream)),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(TransportError::Accept(err)),
            }
        }
    }

    /// Switch the listener to non-blocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener
            .set_nonblocking(nonblocking)
            .map_err(Into::into)
    }

    /// Connect to a listening Unix domain socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(stream)
    }

    /// The path this socket is bound to (`@name` for inherited sockets).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for UnixDomainSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl std::fmt::Debug for UnixDomainSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixDomainSocket")
            .field("path", &self.path)
            .field("cleanup_on_drop", &self.cleanup_on_drop)
            .finish()
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Some((expected_dev, expected_ino)) = self.created_inode {
                if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                    if metadata.file_type().is_socket()
                        && metadata.dev() == expected_dev
                        && metadata.ino() == expected_ino
                    {
                        debug!(path = ?self.path, "cleaning up socket file");
                        let _ = std::fs::remove_file(&self.path);
                    } else {
                        debug!(
                            path = ?self.path,
                            "socket path identity changed; skipping cleanup"
                        );
                    }
                }
            }
        }
    }
}
