use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::Aggregator,
    ammo::Ammo,
    error::{Error, Result},
    gun::Gun,
    metrics::Metrics,
    provider::Provider,
    sample::Sample,
    schedule::Schedule,
    waiter::Waiter,
};

/// A single shooter: one gun driven by one waiter loop.
pub(crate) struct Instance<A: Ammo> {
    pub id: u64,
    pub gun: Box<dyn Gun<A>>,
    pub schedule: Arc<dyn Schedule>,
    pub provider: Arc<dyn Provider<A>>,
    pub aggregator: Arc<dyn Aggregator>,
    pub metrics: Metrics,
    pub discard_overflow: bool,
}

impl<A: Ammo> Instance<A> {
    /// Shoots until the schedule drains, ammo runs out or `cancel` fires, then
    /// closes the gun. Returns [`Error::Cancelled`] when stopped by `cancel`.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.metrics.instance_start.add(1);
        tracing::debug!("Instance started");

        let res = self.shoot(&cancel).await;
        let closed = self.gun.close().await.map_err(Error::Gun);
        if let Err(err) = &closed {
            tracing::warn!("Gun close failed: {err}");
        }

        self.metrics.instance_finish.add(1);
        tracing::debug!(id = self.id, "Instance finished");
        match (res, closed) {
            (Err(shoot), Err(close)) => Err(Error::Multiple(vec![shoot, close])),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn shoot(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut waiter = Waiter::new(self.schedule.clone());
        while !waiter.is_finished(cancel) {
            let ammo = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ammo = self.provider.acquire() => ammo,
            };
            let Some(mut ammo) = ammo else {
                tracing::debug!("Out of ammo");
                break;
            };
            if !waiter.wait(cancel).await {
                self.provider.release(ammo);
                break;
            }

            if self.discard_overflow && waiter.is_slowdown() {
                self.aggregator.report(Sample::discarded());
            } else {
                self.metrics.request.add(1);
                let shot = AssertUnwindSafe(self.gun.shoot(&mut ammo))
                    .catch_unwind()
                    .await;
                self.metrics.response.add(1);
                if let Err(panic) = shot {
                    self.provider.release(ammo);
                    let message = panic_message(panic.as_ref());
                    tracing::error!("Gun panicked: {message}");
                    return Err(Error::GunPanic(message));
                }
            }
            self.provider.release(ammo);
        }

        if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(all(test, feature = "builtins"))]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        aggregator::CollectingAggregator,
        error::BoxError,
        gun::{BoundAggregator, EchoGun, EchoGunConfig, GunDeps},
        provider::{NumProvider, NumProviderConfig, ProviderDeps},
        sample::DISCARDED_TAG,
        schedule::{constant, once},
    };

    struct Fixture {
        provider: Arc<NumProvider<u64>>,
        aggregator: Arc<CollectingAggregator>,
        metrics: Metrics,
    }

    impl Fixture {
        fn new(limit: u64) -> Self {
            let provider = Arc::new(NumProvider::new(NumProviderConfig::builder().limit(limit).build()));
            tokio::spawn({
                let provider = provider.clone();
                async move {
                    provider
                        .run(CancellationToken::new(), ProviderDeps::default())
                        .await
                }
            });
            Self {
                provider,
                aggregator: Arc::new(CollectingAggregator::new()),
                metrics: Metrics::new(),
            }
        }

        fn instance(&self, gun: Box<dyn Gun<u64>>, schedule: Arc<dyn Schedule>) -> Instance<u64> {
            let mut gun = gun;
            gun.bind(
                self.aggregator.clone(),
                GunDeps {
                    cancel: CancellationToken::new(),
                    pool_id: "test".into(),
                    instance_id: 0,
                    shared: None,
                },
            )
            .unwrap();
            Instance {
                id: 0,
                gun,
                schedule,
                provider: self.provider.clone(),
                aggregator: self.aggregator.clone(),
                metrics: self.metrics.clone(),
                discard_overflow: false,
            }
        }
    }

    fn echo() -> Box<dyn Gun<u64>> {
        Box::new(EchoGun::new(EchoGunConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn shoots_every_token() {
        let fixture = Fixture::new(100);
        let instance = fixture.instance(echo(), Arc::new(constant(10.0, Duration::from_secs(1))));
        let start = Instant::now();
        instance.run(CancellationToken::new()).await.unwrap();

        assert_eq!(fixture.aggregator.len(), 10);
        assert!(start.elapsed() >= Duration::from_millis(900));
        let snapshot = fixture.metrics.snapshot();
        assert_eq!((snapshot.requests, snapshot.responses), (10, 10));
        assert_eq!((snapshot.instances_started, snapshot.instances_finished), (1, 1));
    }

    #[tokio::test]
    async fn stops_when_ammo_runs_out() {
        let fixture = Fixture::new(3);
        let instance = fixture.instance(echo(), Arc::new(once(10)));
        instance.run(CancellationToken::new()).await.unwrap();
        assert_eq!(fixture.aggregator.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_reported() {
        let fixture = Fixture::new(0);
        let instance = fixture.instance(echo(), Arc::new(constant(1.0, Duration::from_secs(60))));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(instance.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(fixture.aggregator.len(), 3);
        assert_eq!(fixture.metrics.snapshot().instances_finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_shots_are_discarded() {
        let fixture = Fixture::new(0);
        let schedule = Arc::new(once(2));
        schedule.start(Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;

        let mut instance = fixture.instance(echo(), schedule);
        instance.discard_overflow = true;
        instance.run(CancellationToken::new()).await.unwrap();

        let samples = fixture.aggregator.take();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.tags() == DISCARDED_TAG));
        assert_eq!(fixture.metrics.snapshot().requests, 0);
    }

    struct Faulty {
        aggregator: BoundAggregator,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Gun<u64> for Faulty {
        fn bind(&mut self, aggregator: Arc<dyn Aggregator>, _deps: GunDeps) -> Result<(), BoxError> {
            self.aggregator.bind(aggregator);
            Ok(())
        }

        async fn shoot(&mut self, ammo: &mut u64) {
            if *ammo == 1 {
                panic!("boom on {ammo}");
            }
            self.aggregator.report(Sample::acquire("ok"));
        }

        async fn close(&mut self) -> Result<(), BoxError> {
            self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
            Err("close failed".into())
        }
    }

    #[tokio::test]
    async fn gun_panic_becomes_an_error() {
        let fixture = Fixture::new(10);
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gun = Box::new(Faulty {
            aggregator: BoundAggregator::default(),
            closed: closed.clone(),
        });
        let instance = fixture.instance(gun, Arc::new(once(5)));

        let err = instance.run(CancellationToken::new()).await.unwrap_err();
        let Error::Multiple(errors) = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(matches!(&errors[0], Error::GunPanic(msg) if msg == "boom on 1"));
        assert!(matches!(&errors[1], Error::Gun(_)));
        assert!(closed.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(fixture.aggregator.len(), 1);

        let snapshot = fixture.metrics.snapshot();
        assert_eq!(snapshot.requests, snapshot.responses);
        assert_eq!(snapshot.instances_started, snapshot.instances_finished);
    }
}
