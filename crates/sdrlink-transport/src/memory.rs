use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::traits::{Pipe, Transfer};

/// In-process pipe end.
///
/// [`MemoryPipe::pair`] returns two connected ends: bytes written to one are
/// read from the other. Dropping either end closes both directions; the
/// surviving end drains whatever is still queued and then reports
/// [`crate::TransferStatus::Error`].
#[derive(Debug)]
pub struct MemoryPipe {
    inbound: Arc<Channel>,
    outbound: Arc<Channel>,
}

#[derive(Debug, Default)]
struct Channel {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct ChannelState {
    bytes: VecDeque<u8>,
    closed: bool,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

impl MemoryPipe {
    /// Create two connected pipe ends.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (a, b)
    }

    /// Close both directions. Queued bytes stay readable by the peer.
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    /// Bytes written by the peer and not yet read from this end.
    pub fn queued(&self) -> usize {
        self.inbound.lock().bytes.len()
    }
}

impl Pipe for MemoryPipe {
    fn write(&mut self, buf: &[u8], _timeout: Duration) -> Transfer {
        let mut state = self.outbound.lock();
        if state.closed {
            return Transfer::error(0);
        }
        state.bytes.extend(buf.iter().copied());
        drop(state);
        self.outbound.ready.notify_all();
        Transfer::ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer {
        let state = self.inbound.lock();
        let (mut state, _) = self
            .inbound
            .ready
            .wait_timeout_while(state, timeout, |s| s.bytes.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if !state.bytes.is_empty() {
            let n = buf.len().min(state.bytes.len());
            for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..n)) {
                *dst = src;
            }
            return Transfer::ok(n);
        }

        if state.closed {
            debug!("memory pipe closed by peer");
            Transfer::error(0)
        } else {
            Transfer::timeout(0)
        }
    }
}

impl Drop for MemoryPipe {
    fn drop(&mut self) {
        self.close();
    }
}
