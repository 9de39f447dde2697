use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    io::AsyncWriteExt,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{Aggregator, AggregatorDeps, DEFAULT_SAMPLE_QUEUE_SIZE, DataSink, Reporter, SinkWriter};
use crate::{
    error::{Error, Result},
    sample::Sample,
};

pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Serializes samples into a byte buffer owned by the aggregator.
pub trait SampleEncoder: Send + 'static {
    fn encode(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[serde(rename_all = "kebab-case")]
pub struct EncoderAggregatorConfig {
    pub sink: DataSink,
    #[serde(default = "default_sample_queue_size")]
    #[builder(default = DEFAULT_SAMPLE_QUEUE_SIZE)]
    pub sample_queue_size: usize,
    /// Encoded bytes kept before writing through to the sink.
    #[serde(default = "default_buffer_size", deserialize_with = "crate::config::size")]
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    #[builder(default = DEFAULT_FLUSH_INTERVAL)]
    pub flush_interval: Duration,
}

fn default_sample_queue_size() -> usize {
    DEFAULT_SAMPLE_QUEUE_SIZE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

/// Aggregator encoding samples with a [`SampleEncoder`] into a [`DataSink`].
///
/// Encoded bytes collect in a buffer that is written through to the sink once
/// it reaches `buffer-size`. A periodic tick flushes the buffer, unless a
/// write-through already happened during that interval. After cancellation
/// every sample still queued is encoded before the sink is closed.
pub struct EncoderAggregator<E> {
    sink: DataSink,
    buffer_size: usize,
    flush_interval: Duration,
    reporter: Reporter<Box<Sample>>,
    encoder: Mutex<Option<E>>,
}

impl<E: SampleEncoder> EncoderAggregator<E> {
    pub fn new(config: EncoderAggregatorConfig, encoder: E) -> Self {
        Self {
            sink: config.sink,
            buffer_size: config.buffer_size.max(1),
            flush_interval: config.flush_interval,
            reporter: Reporter::new(config.sample_queue_size),
            encoder: Mutex::new(Some(encoder)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.reporter.dropped()
    }
}

/// Encoding state of one run.
struct Drain<E> {
    encoder: E,
    sink: SinkWriter,
    buf: Vec<u8>,
    buffer_size: usize,
    written_since_tick: bool,
    encoded: u64,
}

impl<E: SampleEncoder> Drain<E> {
    async fn handle(&mut self, sample: Box<Sample>) -> Result<()> {
        let res = self.encoder.encode(&sample, &mut self.buf);
        sample.release();
        res?;
        self.encoded += 1;
        if self.buf.len() >= self.buffer_size {
            self.write().await?;
            self.written_since_tick = true;
        }
        Ok(())
    }

    async fn write(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.sink.write_all(&self.buf).await?;
            self.buf.clear();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.write().await?;
        self.sink.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<E: SampleEncoder> Aggregator for EncoderAggregator<E> {
    async fn run(&self, cancel: CancellationToken, deps: AggregatorDeps) -> Result<()> {
        let encoder = self
            .encoder
            .lock()
            .take()
            .ok_or_else(|| Error::Config("aggregator is already running".into()))?;
        let sink = self.sink.open().await?;
        let mut drain = Drain {
            encoder,
            sink,
            buf: Vec::with_capacity(self.buffer_size),
            buffer_size: self.buffer_size,
            written_since_tick: false,
            encoded: 0,
        };

        let mut errors = Vec::new();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let incoming = self.reporter.incoming();
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sample = incoming.recv_async() => match sample {
                    Ok(sample) => drain.handle(sample).await,
                    Err(_) => break,
                },
                _ = ticker.tick() => {
                    let res = if drain.written_since_tick { Ok(()) } else { drain.flush().await };
                    drain.written_since_tick = false;
                    res
                },
            };
            if let Err(err) = res {
                tracing::error!(pool = %deps.pool_id, "Aggregator failed: {err}");
                errors.push(err);
                break;
            }
        }

        if errors.is_empty() {
            while let Ok(sample) = incoming.try_recv() {
                if let Err(err) = drain.handle(sample).await {
                    errors.push(err);
                    break;
                }
            }
        }
        // Samples left after a failure are only returned to the pool.
        while let Ok(sample) = incoming.try_recv() {
            sample.release();
        }

        if let Err(err) = drain.flush().await {
            errors.push(err);
        }
        if let Err(err) = drain.sink.shutdown().await {
            errors.push(err.into());
        }
        if let Some(err) = self.reporter.dropped_err() {
            errors.push(err);
        }
        tracing::debug!(pool = %deps.pool_id, encoded = drain.encoded, "Aggregator finished");
        Error::join(errors).map_or(Ok(()), Err)
    }

    fn report(&self, sample: Box<Sample>) {
        self.reporter.report(sample);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    use tokio::io::AsyncWrite;

    use super::*;
    use crate::aggregator::SharedBuffer;

    /// Writes each sample's id on its own line.
    struct IdEncoder;

    impl SampleEncoder for IdEncoder {
        fn encode(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<()> {
            buf.extend_from_slice(format!("{}\n", sample.id()).as_bytes());
            Ok(())
        }
    }

    fn aggregator(buffer: &SharedBuffer, queue: usize, buffer_size: usize) -> Arc<EncoderAggregator<IdEncoder>> {
        let config = EncoderAggregatorConfig::builder()
            .sink(DataSink::Buffer(buffer.clone()))
            .sample_queue_size(queue)
            .buffer_size(buffer_size)
            .build();
        Arc::new(EncoderAggregator::new(config, IdEncoder))
    }

    fn report(aggregator: &EncoderAggregator<IdEncoder>, id: u64) {
        let mut sample = Sample::acquire("t");
        sample.set_id(id);
        aggregator.report(sample);
    }

    fn ids(buffer: &SharedBuffer) -> Vec<u64> {
        buffer
            .to_string_lossy()
            .lines()
            .map(|line| line.parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn drains_queue_after_cancel() {
        let buffer = SharedBuffer::new();
        let aggregator = aggregator(&buffer, 1000, DEFAULT_BUFFER_SIZE);
        for id in 0..500 {
            report(&aggregator, id);
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        aggregator.run(cancel, AggregatorDeps::default()).await.unwrap();
        assert_eq!(ids(&buffer), (0..500).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_flushes_buffered_samples() {
        let buffer = SharedBuffer::new();
        let aggregator = aggregator(&buffer, 100, DEFAULT_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            async move { aggregator.run(cancel, AggregatorDeps::default()).await }
        });

        report(&aggregator, 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ids(&buffer).is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ids(&buffer), vec![1]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_buffer_writes_through() {
        let buffer = SharedBuffer::new();
        // "0\n" .. "9\n" are two bytes each.
        let aggregator = aggregator(&buffer, 100, 4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            async move { aggregator.run(cancel, AggregatorDeps::default()).await }
        });
        for id in 0..3 {
            report(&aggregator, id);
        }
        while ids(&buffer).len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ids(&buffer), vec![0, 1]);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(ids(&buffer), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn dropped_samples_fail_the_run() {
        let buffer = SharedBuffer::new();
        let aggregator = aggregator(&buffer, 2, DEFAULT_BUFFER_SIZE);
        for id in 0..5 {
            report(&aggregator, id);
        }
        assert_eq!(aggregator.dropped(), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = aggregator.run(cancel, AggregatorDeps::default()).await.unwrap_err();
        assert!(matches!(err, Error::Dropped(3)));
        assert_eq!(ids(&buffer), vec![0, 1]);
    }

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("disk on fire")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("close failed")))
        }
    }

    #[tokio::test]
    async fn write_errors_surface() {
        let mut drain = Drain {
            encoder: IdEncoder,
            sink: Box::new(BrokenSink),
            buf: Vec::new(),
            buffer_size: 1,
            written_since_tick: false,
            encoded: 0,
        };
        let mut sample = Sample::acquire("t");
        sample.set_id(1);
        let err = drain.handle(sample).await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(drain.sink.shutdown().await.is_err());
    }
}
