//! Providers feed ammo to the instances of a pool.
//!
//! A provider runs as a background task for the lifetime of its pool. It
//! fills ammo into an [`AmmoQueue`](crate::ammo::AmmoQueue) and closes it when
//! its run ends, for whatever reason, so instances blocked in
//! [`Provider::acquire`] see the end of ammo and drain.
mod chunk;
mod decode;
mod source;

pub use chunk::{ChunkAmmoDecoder, Decoded, LineDecoder, LineError};
pub use decode::{AmmoDecoder, DecodeProvider, DecodeProviderConfig};
pub use source::{DataSource, SourceReader};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ammo::Ammo, error::Result};

#[derive(Debug, Clone, Default)]
pub struct ProviderDeps {
    pub pool_id: String,
}

/// Source of ammo for the instances of one pool.
///
/// # Role
///
/// - [`run`](Provider::run) produces ammo in a background task, started by
///   the pool before any instance and stopped only after the last instance
///   has returned.
/// - [`acquire`](Provider::acquire) hands the next ammo to an instance. It is
///   called concurrently from every instance of the pool.
/// - [`release`](Provider::release) takes shot ammo back so it can be reset
///   and reused instead of reallocated.
///
/// # Implementing
///
/// Once `run` returns, for any reason, `acquire` must drain what was queued
/// and then return `None`. Instances treat `None` as the end of the pool's
/// work. A provider that can only run once should reject a second `run` with
/// [`Error::Config`](crate::Error::Config). Most providers only need a
/// [`ChunkAmmoDecoder`] or an [`AmmoDecoder`] plugged into a
/// [`DecodeProvider`].
///
/// # Example
/// ```rust, ignore
/// use volley::{Ammo, Result, ammo::AmmoQueue, provider::{Provider, ProviderDeps}};
///
/// struct Countdown {
///     queue: AmmoQueue<u64>,
/// }
///
/// #[async_trait::async_trait]
/// impl Provider<u64> for Countdown {
///     async fn run(&self, cancel: CancellationToken, _deps: ProviderDeps) -> Result<()> {
///         let Some(producer) = self.queue.producer() else {
///             return Err(Error::Config("provider already ran".into()));
///         };
///         for id in (0..10).rev() {
///             let mut ammo = producer.fresh();
///             ammo.set_id(id);
///             tokio::select! {
///                 _ = cancel.cancelled() => break,
///                 sent = producer.send(ammo) => if !sent { break },
///             }
///         }
///         Ok(())
///     }
///
///     async fn acquire(&self) -> Option<u64> {
///         self.queue.acquire().await
///     }
///
///     fn release(&self, ammo: u64) {
///         self.queue.release(ammo);
///     }
/// }
/// ```
#[async_trait]
pub trait Provider<A: Ammo>: Send + Sync {
    /// Produces ammo until input ends, a limit is hit or `cancel` fires.
    /// Cancellation is not an error.
    async fn run(&self, cancel: CancellationToken, deps: ProviderDeps) -> Result<()>;

    /// Next ammo, or `None` once the provider has finished.
    async fn acquire(&self) -> Option<A>;

    /// Returns shot ammo for reuse.
    fn release(&self, ammo: A);
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::marker::PhantomData;

    use async_trait::async_trait;
    use serde::{Deserialize, de::DeserializeOwned};
    use tokio_util::sync::CancellationToken;
    use typed_builder::TypedBuilder;

    use super::*;
    use crate::{
        ammo::{AmmoQueue, DEFAULT_AMMO_QUEUE_SIZE},
        error::{BoxError, Error},
    };

    #[derive(Debug, Clone, Deserialize, TypedBuilder)]
    #[serde(default, rename_all = "kebab-case")]
    pub struct NumProviderConfig {
        /// Number of ammo to produce; `0` means no limit.
        #[builder(default)]
        pub limit: u64,
        #[builder(default = DEFAULT_AMMO_QUEUE_SIZE)]
        pub ammo_queue_size: usize,
    }

    impl Default for NumProviderConfig {
        fn default() -> Self {
            Self::builder().build()
        }
    }

    /// Produces default ammo numbered `0..limit`. Handy for guns that need no
    /// input, and for tests.
    pub struct NumProvider<A: Ammo> {
        queue: AmmoQueue<A>,
        limit: u64,
    }

    impl<A: Ammo> NumProvider<A> {
        pub fn new(config: NumProviderConfig) -> Self {
            Self {
                queue: AmmoQueue::new(config.ammo_queue_size),
                limit: config.limit,
            }
        }
    }

    #[async_trait]
    impl<A: Ammo> Provider<A> for NumProvider<A> {
        async fn run(&self, cancel: CancellationToken, deps: ProviderDeps) -> Result<()> {
            let producer = self
                .queue
                .producer()
                .ok_or_else(|| Error::Config("provider is already running".into()))?;
            let mut id = 0;
            while self.limit == 0 || id < self.limit {
                let mut ammo = producer.fresh();
                ammo.set_id(id);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = producer.send(ammo) => if !sent { break },
                }
                id += 1;
            }
            tracing::debug!(pool = %deps.pool_id, produced = id, "Num provider finished");
            Ok(())
        }

        async fn acquire(&self) -> Option<A> {
            self.queue.acquire().await
        }

        fn release(&self, ammo: A) {
            self.queue.release(ammo);
        }
    }

    /// Decodes every non-blank line as one JSON document.
    pub struct JsonLineDecoder<A>(PhantomData<fn() -> A>);

    impl<A> JsonLineDecoder<A> {
        pub fn new() -> Self {
            Self(PhantomData)
        }
    }

    impl<A> Default for JsonLineDecoder<A> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<A: Ammo + DeserializeOwned> ChunkAmmoDecoder<A> for JsonLineDecoder<A> {
        /// Deserializes into the existing ammo, so reset ammo keeps the
        /// buffers it already owns.
        fn decode_chunk(&mut self, chunk: &[u8], ammo: &mut A) -> std::result::Result<Decoded, BoxError> {
            let mut de = serde_json::Deserializer::from_slice(chunk);
            A::deserialize_in_place(&mut de, ammo)?;
            de.end()?;
            Ok(Decoded::Ammo)
        }
    }

    pub type JsonLineProvider<A> = DecodeProvider<A, LineDecoder<JsonLineDecoder<A>>>;

    /// Provider reading newline-delimited JSON ammo.
    pub fn json_line_provider<A: Ammo + DeserializeOwned>(
        config: DecodeProviderConfig,
    ) -> JsonLineProvider<A> {
        DecodeProvider::new(config, || LineDecoder::new(JsonLineDecoder::new()))
    }

}
