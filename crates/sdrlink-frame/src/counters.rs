use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shortest reporting interval; anything below is raised to it.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Transmitted/received byte counters shared between the packetizer, the
/// reader thread and a reporting task.
#[derive(Debug, Default)]
pub struct LinkCounters {
    tx: AtomicU64,
    rx: AtomicU64,
}

impl LinkCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read both counters and reset them to zero.
    pub fn take(&self) -> Throughput {
        Throughput {
            tx_bytes: self.tx.swap(0, Ordering::Relaxed),
            rx_bytes: self.rx.swap(0, Ordering::Relaxed),
        }
    }

    /// Read both counters without resetting them.
    pub fn snapshot(&self) -> Throughput {
        Throughput {
            tx_bytes: self.tx.load(Ordering::Relaxed),
            rx_bytes: self.rx.load(Ordering::Relaxed),
        }
    }
}

/// Bytes moved in each direction over one reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throughput {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl Throughput {
    /// Transmit rate in MB/s (10^6 bytes) over `interval`.
    pub fn tx_mbps(&self, interval: Duration) -> f64 {
        rate(self.tx_bytes, interval)
    }

    /// Receive rate in MB/s (10^6 bytes) over `interval`.
    pub fn rx_mbps(&self, interval: Duration) -> f64 {
        rate(self.rx_bytes, interval)
    }

    pub fn total_bytes(&self) -> u64 {
        self.tx_bytes.saturating_add(self.rx_bytes)
    }
}

fn rate(bytes: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / 1_000_000.0 / secs
}

/// Background thread that drains [`LinkCounters`] once per interval.
///
/// Stops when `cancel` fires or when the monitor is dropped.
pub struct ThroughputMonitor {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ThroughputMonitor {
    /// Spawn a monitor that logs each interval at `info`.
    pub fn spawn(
        counters: Arc<LinkCounters>,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> std::io::Result<Self> {
        let interval = interval.max(MIN_REPORT_INTERVAL);
        Self::spawn_with(counters, interval, cancel, move |t: Throughput| {
            info!(
                "TX:{:.2}MB/s RX:{:.2}MB/s total:{:.2}MB",
                t.tx_mbps(interval),
                t.rx_mbps(interval),
                t.total_bytes() as f64 / 1_000_000.0
            );
        })
    }

    /// Spawn a monitor that hands each interval's counts to `sink`.
    ///
    /// `interval` is raised to [`MIN_REPORT_INTERVAL`].
    pub fn spawn_with<F>(
        counters: Arc<LinkCounters>,
        interval: Duration,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(Throughput) + Send + 'static,
    {
        let interval = interval.max(MIN_REPORT_INTERVAL);
        let cancel = cancel.child_token();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("sdrlink-throughput".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while !token.is_cancelled() {
                    let now = Instant::now();
                    if now < next {
                        // Wake at least every 50ms to notice cancellation.
                        std::thread::sleep((next - now).min(Duration::from_millis(50)));
                        continue;
                    }
                    next += interval;
                    sink(counters.take());
                }
                debug!("throughput monitor stopped");
            })?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stop the monitor and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThroughputMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
