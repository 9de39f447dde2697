//! Gun: the protocol driver that turns ammo into a request.
//!
//! Every instance owns one gun, built from the pool's [`NewGun`] factory. The
//! pool calls, in order:
//!
//! 1. [`Gun::warm_up`] once, on a throwaway gun, before any instance exists.
//!    Its output is shared with every instance (connection pools, compiled
//!    templates, ...).
//! 2. [`Gun::accept_warm_up_result`] and [`Gun::bind`] on each instance's gun.
//! 3. [`Gun::shoot`] for every scheduled shot.
//! 4. [`Gun::close`] when the instance finishes.
//!
//! `shoot` must report exactly one [`Sample`] per call, failed shots included.
//! Shot errors belong in the sample, not in control flow.
use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{aggregator::Aggregator, ammo::Ammo, error::BoxError, sample::Sample};

/// State produced by a warm-up and handed to every instance of the pool.
pub type Shared = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct GunDeps {
    /// Cancelled when the instance must stop.
    pub cancel: CancellationToken,
    pub pool_id: String,
    pub instance_id: u64,
    pub shared: Option<Shared>,
}

#[derive(Debug, Clone)]
pub struct WarmUpOptions {
    pub cancel: CancellationToken,
    pub pool_id: String,
}

/// Protocol driver owned by one instance.
///
/// # Role
///
/// A gun turns one ammo into one request and reports how it went. It is
/// only ever called from its own instance, so `&mut self` state such as a
/// connection needs no locking.
///
/// # Implementing
///
/// - Store the aggregator given to [`bind`](Gun::bind) in a
///   [`BoundAggregator`], which panics on a second bind.
/// - [`shoot`](Gun::shoot) reports exactly one [`Sample`] per call. Failures
///   are recorded in the sample (`set_err`, `set_proto_code`), never
///   returned. A panic is caught and fails only this instance.
/// - Long shots should watch [`GunDeps::cancel`]; an instance waits for the
///   current shot to return before it stops.
/// - The ammo is borrowed: the instance hands it back to the provider after
///   the shot.
///
/// # Example
/// ```rust, ignore
/// use volley::{Aggregator, BoxError, Gun, GunDeps, Sample, gun::BoundAggregator};
///
/// #[derive(Default)]
/// struct Ping {
///     aggregator: BoundAggregator,
/// }
///
/// #[async_trait::async_trait]
/// impl Gun<u64> for Ping {
///     fn bind(&mut self, aggregator: Arc<dyn Aggregator>, _deps: GunDeps) -> Result<(), BoxError> {
///         self.aggregator.bind(aggregator);
///         Ok(())
///     }
///
///     async fn shoot(&mut self, ammo: &mut u64) {
///         let mut sample = Sample::acquire("ping");
///         sample.set_id(*ammo);
///         sample.set_proto_code(200);
///         self.aggregator.report(sample);
///     }
/// }
/// ```
#[async_trait]
pub trait Gun<A: Ammo>: Send + 'static {
    /// Attaches the gun to its aggregator. Called once, before any shot;
    /// binding twice is a programmer error and panics.
    fn bind(&mut self, aggregator: Arc<dyn Aggregator>, deps: GunDeps) -> Result<(), BoxError>;

    /// Fires one shot and reports its sample.
    async fn shoot(&mut self, ammo: &mut A);

    async fn warm_up(&mut self, _opts: &WarmUpOptions) -> Result<Option<Shared>, BoxError> {
        Ok(None)
    }

    fn accept_warm_up_result(&mut self, _shared: Option<&Shared>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

pub type NewGun<A> = Arc<dyn Fn() -> Result<Box<dyn Gun<A>>, BoxError> + Send + Sync>;

/// Aggregator slot for gun implementations, enforcing the bind contract.
#[derive(Default)]
pub struct BoundAggregator {
    inner: Option<Arc<dyn Aggregator>>,
}

impl BoundAggregator {
    /// # Panics
    /// If already bound.
    pub fn bind(&mut self, aggregator: Arc<dyn Aggregator>) {
        if self.inner.is_some() {
            panic!("gun is already bound to an aggregator");
        }
        self.inner = Some(aggregator);
    }

    pub fn is_bound(&self) -> bool {
        self.inner.is_some()
    }

    /// # Panics
    /// If not bound yet.
    pub fn report(&self, sample: Box<Sample>) {
        match &self.inner {
            Some(aggregator) => aggregator.report(sample),
            None => panic!("gun reported a sample before being bound"),
        }
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{io, time::Duration};

    use serde::Deserialize;
    use typed_builder::TypedBuilder;

    use super::*;

    #[derive(Debug, Clone, Deserialize, TypedBuilder)]
    #[serde(default)]
    pub struct EchoGunConfig {
        #[builder(default = "echo".into(), setter(into))]
        pub tag: String,
        /// Simulated service time.
        #[serde(with = "humantime_serde")]
        #[builder(default)]
        pub delay: Duration,
    }

    impl Default for EchoGunConfig {
        fn default() -> Self {
            Self::builder().build()
        }
    }

    /// Gun that talks to nobody: every shot succeeds with code 200 after the
    /// configured delay.
    pub struct EchoGun {
        config: EchoGunConfig,
        aggregator: BoundAggregator,
        cancel: CancellationToken,
    }

    impl EchoGun {
        pub fn new(config: EchoGunConfig) -> Self {
            Self {
                config,
                aggregator: BoundAggregator::default(),
                cancel: CancellationToken::new(),
            }
        }

        pub fn factory<A: Ammo>(config: EchoGunConfig) -> NewGun<A> {
            Arc::new(move || Ok(Box::new(EchoGun::new(config.clone())) as Box<dyn Gun<A>>))
        }
    }

    #[async_trait]
    impl<A: Ammo> Gun<A> for EchoGun {
        fn bind(&mut self, aggregator: Arc<dyn Aggregator>, deps: GunDeps) -> Result<(), BoxError> {
            self.aggregator.bind(aggregator);
            self.cancel = deps.cancel;
            Ok(())
        }

        async fn shoot(&mut self, ammo: &mut A) {
            let mut sample = Sample::acquire(&self.config.tag);
            sample.set_id(ammo.id());
            if !self.config.delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        let err = io::Error::new(io::ErrorKind::Interrupted, "shot cancelled");
                        sample.set_err(&err);
                        self.aggregator.report(sample);
                        return;
                    }
                    _ = tokio::time::sleep(self.config.delay) => {}
                }
            }
            sample.set_proto_code(200);
            self.aggregator.report(sample);
        }
    }

}
