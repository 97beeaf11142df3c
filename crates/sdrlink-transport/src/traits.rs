use std::io::ErrorKind;
use std::time::Duration;

/// Status reported by a single transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The call completed.
    Ok,
    /// The timeout elapsed. Benign: callers are expected to retry.
    Timeout,
    /// The pipe failed or was closed by the peer. Fatal for the caller.
    Error,
}

/// Byte count and status of a single transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes actually moved, even when the status is not `Ok`.
    pub bytes: usize,
    pub status: TransferStatus,
}

impl Transfer {
    pub fn new(bytes: usize, status: TransferStatus) -> Self {
        Self { bytes, status }
    }

    pub fn ok(bytes: usize) -> Self {
        Self::new(bytes, TransferStatus::Ok)
    }

    pub fn timeout(bytes: usize) -> Self {
        Self::new(bytes, TransferStatus::Timeout)
    }

    pub fn error(bytes: usize) -> Self {
        Self::new(bytes, TransferStatus::Error)
    }

    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }
}

/// A byte pipe with bounded-timeout blocking read and write.
///
/// This mirrors the vendor bulk-pipe API (`WritePipe`/`ReadPipe` with a
/// millisecond timeout) rather than `std::io`, so that a timeout is a status
/// instead of an error and partial byte counts are always reported.
pub trait Pipe {
    /// Write `buf` to the pipe, blocking for at most `timeout`.
    fn write(&mut self, buf: &[u8], timeout: Duration) -> Transfer;

    /// Read into `buf`, blocking for at most `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer;
}

impl<P: Pipe + ?Sized> Pipe for &mut P {
    fn write(&mut self, buf: &[u8], timeout: Duration) -> Transfer {
        (**self).write(buf, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer {
        (**self).read(buf, timeout)
    }
}

impl<P: Pipe + ?Sized> Pipe for Box<P> {
    fn write(&mut self, buf: &[u8], timeout: Duration) -> Transfer {
        (**self).write(buf, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer {
        (**self).read(buf, timeout)
    }
}

/// Map an I/O error from a timed blocking call onto a transfer status.
pub fn status_for_io_error(err: &std::io::Error) -> TransferStatus {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
            TransferStatus::Timeout
        }
        _ => TransferStatus::Error,
    }
}
