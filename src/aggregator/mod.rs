//! Aggregators collect the samples reported by guns.
//!
//! [`Aggregator::report`] is called from every instance of a pool and must
//! never block; [`Aggregator::run`] drains what was reported until its token
//! is cancelled, then drains the rest and returns.
mod encoder;
#[cfg(feature = "builtins")]
mod format;
mod reporter;
mod sink;

pub use encoder::{
    DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_INTERVAL, EncoderAggregator, EncoderAggregatorConfig,
    SampleEncoder,
};
#[cfg(feature = "builtins")]
pub use format::{JsonLinesEncoder, PhoutEncoder};
pub use reporter::{DEFAULT_SAMPLE_QUEUE_SIZE, Recycle, Reporter};
pub use sink::{DataSink, SharedBuffer, SinkWriter};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, sample::Sample};

#[derive(Debug, Clone, Default)]
pub struct AggregatorDeps {
    pub pool_id: String,
}

/// Consumer of the samples reported by the guns of a pool.
///
/// # Role
///
/// - Receive every [`Sample`] through [`report`](Aggregator::report), called
///   from inside `Gun::shoot` on every instance at once.
/// - Process them in [`run`](Aggregator::run): encode them to a sink, count
///   them, forward them elsewhere.
///
/// `run` is started before the first instance and its token is cancelled
/// only after the last instance has returned. It must then drain what is
/// still queued and return. Returning earlier fails the pool with
/// [`Error::AggregatorStopped`](crate::Error::AggregatorStopped).
///
/// **Important:** `report` must never block or await capacity. When the
/// aggregator cannot keep up it drops the sample, releases it and counts the
/// drop; [`Reporter`] implements that contract and is what most aggregators
/// are built on. Samples are pooled, so call [`Sample::release`] once done
/// with one.
///
/// # Example
/// ```rust, ignore
/// use volley::{Aggregator, AggregatorDeps, Result, Sample, aggregator::Reporter};
///
/// struct ErrorCounter {
///     reporter: Reporter<Box<Sample>>,
///     errors: AtomicU64,
/// }
///
/// #[async_trait::async_trait]
/// impl Aggregator for ErrorCounter {
///     async fn run(&self, cancel: CancellationToken, _deps: AggregatorDeps) -> Result<()> {
///         let incoming = self.reporter.incoming();
///         loop {
///             let sample = tokio::select! {
///                 sample = incoming.recv_async() => sample,
///                 _ = cancel.cancelled() => break,
///             };
///             if let Ok(sample) = sample {
///                 self.count(sample);
///             }
///         }
///         while let Ok(sample) = incoming.try_recv() {
///             self.count(sample);
///         }
///         Ok(())
///     }
///
///     fn report(&self, sample: Box<Sample>) {
///         self.reporter.report(sample);
///     }
/// }
/// ```
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Consumes reported samples until `cancel` fires and the queue is empty.
    async fn run(&self, cancel: CancellationToken, deps: AggregatorDeps) -> Result<()>;

    /// Hands over a sample. Never blocks.
    fn report(&self, sample: Box<Sample>);
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use parking_lot::Mutex;

    use super::*;

    pub type PhoutAggregator = EncoderAggregator<PhoutEncoder>;
    pub type JsonLinesAggregator = EncoderAggregator<JsonLinesEncoder>;

    /// Returns every sample to the pool unseen.
    #[derive(Debug, Default)]
    pub struct DiscardAggregator;

    #[async_trait]
    impl Aggregator for DiscardAggregator {
        async fn run(&self, cancel: CancellationToken, _deps: AggregatorDeps) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        fn report(&self, sample: Box<Sample>) {
            sample.release();
        }
    }

    /// Keeps every sample in memory.
    #[derive(Debug, Default)]
    pub struct CollectingAggregator {
        samples: Mutex<Vec<Box<Sample>>>,
    }

    impl CollectingAggregator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.samples.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.samples.lock().is_empty()
        }

        pub fn take(&self) -> Vec<Box<Sample>> {
            std::mem::take(&mut *self.samples.lock())
        }
    }

    #[async_trait]
    impl Aggregator for CollectingAggregator {
        async fn run(&self, cancel: CancellationToken, _deps: AggregatorDeps) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        fn report(&self, sample: Box<Sample>) {
            self.samples.lock().push(sample);
        }
    }
}
