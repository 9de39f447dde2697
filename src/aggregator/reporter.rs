use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use flume::TrySendError;

use crate::error::Error;

/// Default capacity of an aggregator's sample queue.
pub const DEFAULT_SAMPLE_QUEUE_SIZE: usize = 256 * 1024;

/// Values that can go back to a pool when a reporter drops them.
pub trait Recycle: Sized + Send + 'static {
    fn recycle(self) {}
}

/// Bounded, non-blocking sample queue.
///
/// `report` never waits: when the queue is full the sample is counted as
/// dropped and recycled. The first drop logs a warning; the total comes back
/// from [`Reporter::dropped_err`].
pub struct Reporter<S: Recycle> {
    tx: flume::Sender<S>,
    rx: flume::Receiver<S>,
    dropped: AtomicU64,
    warned: AtomicBool,
}

impl<S: Recycle> Reporter<S> {
    /// `0` selects [`DEFAULT_SAMPLE_QUEUE_SIZE`].
    pub fn new(size: usize) -> Self {
        let size = if size == 0 {
            DEFAULT_SAMPLE_QUEUE_SIZE
        } else {
            size
        };
        let (tx, rx) = flume::bounded(size);
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
            warned: AtomicBool::new(false),
        }
    }

    pub fn report(&self, sample: S) {
        let sample = match self.tx.try_send(sample) {
            Ok(()) => return,
            Err(TrySendError::Full(sample) | TrySendError::Disconnected(sample)) => sample,
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                capacity = ?self.tx.capacity(),
                "Sample queue is full, dropping samples. Raise sample-queue-size or lower the load"
            );
        }
        sample.recycle();
    }

    pub fn incoming(&self) -> &flume::Receiver<S> {
        &self.rx
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_err(&self) -> Option<Error> {
        match self.dropped() {
            0 => None,
            n => Some(Error::Dropped(n)),
        }
    }
}
