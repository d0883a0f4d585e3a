use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Atomic byte counters shared between a metered reader/writer and the
/// socket that exposes them.
///
/// `current` accumulates bytes since the last housekeeping tick; `update`
/// folds it into `total` and publishes the per-second `rate`. No lock is
/// taken on the I/O hot path.
#[derive(Default)]
pub struct Meter {
    total: AtomicU64,
    current: AtomicU64,
    rate: AtomicU64,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        if n > 0 {
            self.current.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn per_second(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Fold the current interval into the totals and derive the per-second
    /// rate. Returns the number of bytes accumulated since the last update.
    pub fn update(&self, interval: Duration) -> u64 {
        let current = self.current.swap(0, Ordering::Relaxed);

        let rate = if interval.is_zero() {
            0
        } else {
            (current as f64 / interval.as_secs_f64()) as u64
        };
        self.rate.store(rate, Ordering::Relaxed);
        self.total.fetch_add(current, Ordering::Relaxed);

        current
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        self.rate.store(0, Ordering::Relaxed);
    }
}

/// Transparent reader wrapper that counts bytes flowing through it.
pub struct MeteredReader<R> {
    inner: R,
    meter: Arc<Meter>,
}

impl<R: Read> MeteredReader<R> {
    pub fn new(inner: R, meter: Arc<Meter>) -> Self {
        Self { inner, meter }
    }
}

impl<R: Read> Read for MeteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }
}

/// Transparent writer wrapper that counts bytes flowing through it.
pub struct MeteredWriter<W> {
    inner: W,
    meter: Arc<Meter>,
}

impl<W: Write> MeteredWriter<W> {
    pub fn new(inner: W, meter: Arc<Meter>) -> Self {
        Self { inner, meter }
    }
}

impl<W: Write> Write for MeteredWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
