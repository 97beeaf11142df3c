use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{status_for_io_error, Pipe, Transfer};

// `set_read_timeout(Some(Duration::ZERO))` is rejected by std.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// A bulk pipe carried over a Unix domain socket.
///
/// Stands in for the USB3 FIFO bridge when no hardware is attached: the
/// device side (or a simulator) listens on a socket path and the host
/// connects to it. Timeouts are applied per call through the socket's
/// read/write timeouts.
#[derive(Debug)]
pub struct UnixPipe {
    stream: UnixStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl UnixPipe {
    fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Connect to a listening pipe (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix pipe");
        Ok(Self::from_stream(stream))
    }

    /// Create a connected pair of pipe ends.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    /// Duplicate the handle, so one end can be read on a background thread
    /// while the other is written from the caller's thread.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_stream(self.stream.try_clone()?))
    }

    fn apply_read_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        let timeout = Some(timeout.max(MIN_TIMEOUT));
        if self.read_timeout != timeout {
            self.stream.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }
        Ok(())
    }

    fn apply_write_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        let timeout = Some(timeout.max(MIN_TIMEOUT));
        if self.write_timeout != timeout {
            self.stream.set_write_timeout(timeout)?;
            self.write_timeout = timeout;
        }
        Ok(())
    }
}

impl Pipe for UnixPipe {
    fn write(&mut self, buf: &[u8], timeout: Duration) -> Transfer {
        if let Err(err) = self.apply_write_timeout(timeout) {
            warn!(error = %err, "failed to set write timeout");
            return Transfer::error(0);
        }

        let mut written = 0usize;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Transfer::error(written),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Transfer::new(written, status_for_io_error(&err)),
            }
        }
        Transfer::ok(written)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer {
        if let Err(err) = self.apply_read_timeout(timeout) {
            warn!(error = %err, "failed to set read timeout");
            return Transfer::error(0);
        }

        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                debug!("unix pipe closed by peer");
                Transfer::error(0)
            }
            Ok(n) => Transfer::ok(n),
            Err(err) => Transfer::new(0, status_for_io_error(&err)),
        }
    }
}

/// Listening side of a [`UnixPipe`].
///
/// The socket file is created with mode `0600` and removed on drop, unless
/// the path was replaced by something else in the meantime.
pub struct PipeListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl PipeListener {
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// A stale socket at `path` is removed first; any other kind of file is
    /// left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening for pipe connections");

        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<UnixPipe> {
        self.listener
            .set_nonblocking(false)
            .map_err(TransportError::Accept)?;
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted pipe connection");
        Ok(UnixPipe::from_stream(stream))
    }

    /// Wait up to `timeout` for an incoming connection.
    ///
    /// Returns `Ok(None)` when nobody connected in time, so callers can check
    /// for shutdown between attempts.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<UnixPipe>> {
        self.listener
            .set_nonblocking(true)
            .map_err(TransportError::Accept)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    // Some platforms hand out sockets that inherit O_NONBLOCK.
                    stream
                        .set_nonblocking(false)
                        .map_err(TransportError::Accept)?;
                    debug!(path = ?self.path, "accepted pipe connection");
                    return Ok(Some(UnixPipe::from_stream(stream)));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Accept(err)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep((deadline - now).min(ACCEPT_POLL));
        }
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket()
            && (metadata.dev(), metadata.ino()) == self.created_inode
        {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TransferStatus;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sdrlink-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect() {
        let dir = temp_dir("uds-bind");
        let sock_path = dir.join("pipe.sock");

        let listener = PipeListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixPipe::connect(&path_clone).unwrap();
            client.write(b"hello", Duration::from_secs(1))
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            let t = server.read(&mut buf[got..], Duration::from_secs(1));
            assert!(t.is_ok());
            got += t.bytes;
        }
        assert_eq!(&buf, b"hello");
        assert_eq!(handle.join().unwrap(), Transfer::ok(5));

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_returns_none_when_idle() {
        let dir = temp_dir("uds-idle");
        let listener = PipeListener::bind(dir.join("idle.sock")).unwrap();

        let start = Instant::now();
        assert!(listener.accept_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_hands_out_blocking_pipe() {
        let dir = temp_dir("uds-poll");
        let sock_path = dir.join("poll.sock");
        let listener = PipeListener::bind(&sock_path).unwrap();

        let mut client = UnixPipe::connect(&sock_path).unwrap();
        let mut server = listener
            .accept_timeout(Duration::from_secs(1))
            .unwrap()
            .expect("pending connection should be accepted");

        // A read with a timeout must wait for data instead of failing fast.
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            client.write(&[1, 2, 3, 4], Duration::from_secs(1))
        });
        let mut buf = [0u8; 4];
        let t = server.read(&mut buf, Duration::from_secs(1));
        assert_eq!(t, Transfer::ok(4));
        assert!(writer.join().unwrap().is_ok());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cloned_pipe_shares_the_connection() {
        let (a, mut b) = UnixPipe::pair().unwrap();
        let mut writer = a.try_clone().unwrap();
        drop(a);

        assert!(writer.write(&[9, 8, 7, 6], Duration::from_secs(1)).is_ok());
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf, Duration::from_secs(1)), Transfer::ok(4));
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = PipeListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn bind_rejects_existing_non_socket_file() {
        let dir = temp_dir("uds-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = PipeListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn idle_read_reports_timeout() {
        let (_a, mut b) = UnixPipe::pair().unwrap();
        let mut buf = [0u8; 4];
        let t = b.read(&mut buf, Duration::from_millis(10));
        assert_eq!(t.status, TransferStatus::Timeout);
    }

    #[test]
    fn closed_peer_reports_error() {
        let (a, mut b) = UnixPipe::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let t = b.read(&mut buf, Duration::from_millis(10));
        assert_eq!(t.status, TransferStatus::Error);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let (mut a, mut b) = UnixPipe::pair().unwrap();
        assert!(a.write(&[1, 2, 3, 4], Duration::ZERO).is_ok());
        let mut buf = [0u8; 4];
        let t = b.read(&mut buf, Duration::ZERO);
        assert_ne!(t.status, TransferStatus::Error);
    }
}
