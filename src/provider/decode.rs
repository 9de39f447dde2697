use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{DataSource, Provider, ProviderDeps};
use crate::{
    ammo::{Ammo, AmmoQueue, DEFAULT_AMMO_QUEUE_SIZE},
    error::{BoxError, Error, Result},
};

/// Stateful decoder for one pass over a source.
#[async_trait]
pub trait AmmoDecoder<A: Ammo>: Send {
    /// Fills `ammo` from `input`. Returns `false` at end of input.
    async fn decode(
        &mut self,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        ammo: &mut A,
    ) -> Result<bool, BoxError>;
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[serde(rename_all = "kebab-case")]
pub struct DecodeProviderConfig {
    pub source: DataSource,
    /// Total ammo to produce; `0` means no limit.
    #[serde(default)]
    #[builder(default)]
    pub limit: u64,
    /// Passes over the source; `0` means repeat until the limit or cancellation.
    #[serde(default)]
    #[builder(default)]
    pub passes: u64,
    #[serde(default = "default_ammo_queue_size")]
    #[builder(default = DEFAULT_AMMO_QUEUE_SIZE)]
    pub ammo_queue_size: usize,
}

fn default_ammo_queue_size() -> usize {
    DEFAULT_AMMO_QUEUE_SIZE
}

type NewDecoder<D> = Box<dyn Fn() -> D + Send + Sync>;

/// Provider decoding ammo from a [`DataSource`], optionally in several passes.
///
/// A fresh decoder is built for every pass. Seekable sources are rewound
/// between passes; a stream source is read once.
pub struct DecodeProvider<A: Ammo, D> {
    queue: AmmoQueue<A>,
    source: DataSource,
    new_decoder: NewDecoder<D>,
    limit: u64,
    passes: u64,
}

impl<A, D> DecodeProvider<A, D>
where
    A: Ammo,
    D: AmmoDecoder<A>,
{
    pub fn new(config: DecodeProviderConfig, new_decoder: impl Fn() -> D + Send + Sync + 'static) -> Self {
        Self {
            queue: AmmoQueue::new(config.ammo_queue_size),
            source: config.source,
            new_decoder: Box::new(new_decoder),
            limit: config.limit,
            passes: config.passes,
        }
    }
}

#[async_trait]
impl<A, D> Provider<A> for DecodeProvider<A, D>
where
    A: Ammo,
    D: AmmoDecoder<A> + 'static,
{
    async fn run(&self, cancel: CancellationToken, deps: ProviderDeps) -> Result<()> {
        let producer = self
            .queue
            .producer()
            .ok_or_else(|| Error::Config("provider is already running".into()))?;
        let mut reader = self.source.open().await?;

        let mut index = 0u64;
        let mut pass = 0u64;
        loop {
            let mut decoder = (self.new_decoder)();
            let mut decoded = 0u64;
            loop {
                if self.limit != 0 && index >= self.limit {
                    tracing::debug!(pool = %deps.pool_id, index, "Ammo limit reached");
                    return Ok(());
                }
                let mut ammo = producer.fresh();
                let more = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    res = decoder.decode(reader.reader(), &mut ammo) => res,
                };
                match more {
                    Ok(true) => {}
                    Ok(false) => {
                        producer.recycle(ammo);
                        break;
                    }
                    Err(source) => return Err(Error::Decode { index, source }),
                }
                ammo.set_id(index);
                index += 1;
                decoded += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = producer.send(ammo) => if !sent { return Ok(()) },
                }
            }

            pass += 1;
            if decoded == 0 {
                return Err(Error::EmptySource);
            }
            if self.passes != 0 && pass >= self.passes {
                tracing::debug!(pool = %deps.pool_id, passes = pass, "Ammo source passes done");
                return Ok(());
            }
            if !reader.rewind().await? {
                tracing::warn!(pool = %deps.pool_id, "Ammo source is not seekable, stopping after one pass");
                return Ok(());
            }
        }
    }

    async fn acquire(&self) -> Option<A> {
        self.queue.acquire().await
    }

    fn release(&self, ammo: A) {
        self.queue.release(ammo);
    }
}
