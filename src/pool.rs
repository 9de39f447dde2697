//! InstancePool: a group of instances sharing a provider, an aggregator and
//! a gun factory.
//!
//! # Lifecycle
//! 1. **Warm-up**: a throwaway gun is built and warmed up. Its result is
//!    shared with every instance. Failure aborts the pool.
//! 2. **Startup**: the provider and the aggregator are spawned, then a
//!    launcher task follows the startup schedule, building one instance per
//!    token. Each instance gets either the pool's shared rate schedule or a
//!    private one.
//! 3. **Wait**: the pool watches the provider, the aggregator, the launcher
//!    and every instance. Once the launcher and all instances are done, the
//!    provider and the aggregator are stopped and awaited, so the aggregator
//!    can flush what was reported. Cancelling the pool only stops the
//!    instances; shots already in flight still reach the aggregator.
//!
//! # Failures
//! Provider, aggregator, launcher (gun construction, bind) failures cancel
//! the whole pool. An aggregator that returns before it is asked to stop is a
//! failure too. Instance errors, gun panics included, leave the siblings
//! running and are returned once everything has finished.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    task::JoinError,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    aggregator::{Aggregator, AggregatorDeps},
    ammo::Ammo,
    error::{Error, Result},
    gun::{GunDeps, NewGun, Shared, WarmUpOptions},
    instance::Instance,
    metrics::Metrics,
    provider::{Provider, ProviderDeps},
    schedule::{NewSchedule, Schedule},
    waiter::Waiter,
};

/// Object-safe view of a pool, so that an engine can run pools with
/// different ammo types side by side.
#[async_trait]
pub trait Pool: Send + Sync {
    fn id(&self) -> &str;

    /// Runs the pool to completion. Returns [`Error::Cancelled`] when stopped
    /// by `cancel` without any other failure.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

#[derive(TypedBuilder)]
pub struct InstancePool<A: Ammo> {
    #[builder(setter(into))]
    id: String,
    provider: Arc<dyn Provider<A>>,
    aggregator: Arc<dyn Aggregator>,
    new_gun: NewGun<A>,
    /// Rate schedule factory; called once per instance, or once per pool when
    /// the schedule is shared.
    new_rps_schedule: NewSchedule,
    new_startup_schedule: NewSchedule,
    #[builder(default)]
    shared_schedule: bool,
    /// Report overdue shots as discarded instead of firing them late.
    #[builder(default)]
    discard_overflow: bool,
    #[builder(default)]
    metrics: Metrics,
}

#[async_trait]
impl<A: Ammo> Pool for InstancePool<A> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let span = tracing::info_span!("pool", id = %self.id);
        self.run_pool(cancel).instrument(span).await
    }
}

impl<A: Ammo> InstancePool<A> {
    async fn run_pool(&self, cancel: CancellationToken) -> Result<()> {
        let startup = (self.new_startup_schedule)()?;
        if startup.left() == 0 {
            return Err(Error::EmptyStartup);
        }
        let shared_rps = if self.shared_schedule {
            Some((self.new_rps_schedule)()?)
        } else {
            None
        };

        let warm_up = self.warm_up(&cancel).await?;

        // Instances stop on `run_cancel`. The provider and the aggregator run
        // on an unrelated `util_cancel`, cancelled only once every instance
        // has returned, so samples of shots in flight are still encoded.
        let run_cancel = cancel.child_token();
        let util_cancel = CancellationToken::new();
        let _guard = run_cancel.clone().drop_guard();
        let _util_guard = util_cancel.clone().drop_guard();

        tracing::info!("Spawning ammo provider and aggregator...");
        let mut provider_task = tokio::spawn({
            let provider = self.provider.clone();
            let cancel = util_cancel.clone();
            let deps = ProviderDeps {
                pool_id: self.id.clone(),
            };
            async move { provider.run(cancel, deps).await }.in_current_span()
        });
        let mut aggregator_task = tokio::spawn({
            let aggregator = self.aggregator.clone();
            let cancel = util_cancel.clone();
            let deps = AggregatorDeps {
                pool_id: self.id.clone(),
            };
            async move { aggregator.run(cancel, deps).await }.in_current_span()
        });

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let launcher = Launcher {
            pool_id: self.id.clone(),
            provider: self.provider.clone(),
            aggregator: self.aggregator.clone(),
            new_gun: self.new_gun.clone(),
            new_rps_schedule: self.new_rps_schedule.clone(),
            shared_rps,
            warm_up,
            metrics: self.metrics.clone(),
            discard_overflow: self.discard_overflow,
        };
        tracing::info!("Starting instances...");
        let mut launcher_task = tokio::spawn(
            launcher
                .run(startup, run_cancel.clone(), done_tx)
                .in_current_span(),
        );

        let mut errors = Vec::new();
        let mut provider_done = false;
        let mut aggregator_done = false;
        let mut launcher_done = false;
        let mut instances_done = false;
        while !(launcher_done && instances_done) {
            tokio::select! {
                res = &mut provider_task, if !provider_done => {
                    provider_done = true;
                    match flatten(res) {
                        Ok(()) => tracing::debug!("Ammo provider finished"),
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => {
                            tracing::error!("Ammo provider failed: {err}");
                            errors.push(err);
                            run_cancel.cancel();
                        }
                    }
                }
                res = &mut aggregator_task, if !aggregator_done => {
                    aggregator_done = true;
                    let err = match flatten(res) {
                        Ok(()) if run_cancel.is_cancelled() => {
                            tracing::debug!("Aggregator finished after cancellation");
                            continue;
                        }
                        Ok(()) => Error::AggregatorStopped,
                        Err(err) if err.is_cancelled() => continue,
                        Err(err) => err,
                    };
                    tracing::error!("Aggregator failed: {err}");
                    errors.push(err);
                    run_cancel.cancel();
                }
                res = &mut launcher_task, if !launcher_done => {
                    launcher_done = true;
                    match flatten(res) {
                        Ok(started) => tracing::info!("All {started} instances started"),
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => {
                            tracing::error!("Instance startup failed: {err}");
                            errors.push(err);
                            run_cancel.cancel();
                        }
                    }
                }
                res = done_rx.recv(), if !instances_done => match res {
                    Some(Ok(())) => {}
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => {
                        tracing::warn!("Instance failed: {err}");
                        errors.push(err);
                    }
                    None => instances_done = true,
                },
            }
        }

        tracing::info!("Instances finished, stopping ammo provider and aggregator...");
        util_cancel.cancel();
        if !provider_done {
            match flatten(provider_task.await) {
                Err(err) if !err.is_cancelled() => errors.push(err),
                _ => {}
            }
        }
        if !aggregator_done {
            if let Err(err) = flatten(aggregator_task.await) {
                if !err.is_cancelled() {
                    tracing::error!("Aggregator failed: {err}");
                    errors.push(err);
                }
            }
        }

        if let Some(err) = Error::join(errors) {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::info!("Pool finished");
        Ok(())
    }

    async fn warm_up(&self, cancel: &CancellationToken) -> Result<Option<Shared>> {
        let mut gun = (self.new_gun)().map_err(Error::Gun)?;
        let opts = WarmUpOptions {
            cancel: cancel.clone(),
            pool_id: self.id.clone(),
        };
        let shared = gun.warm_up(&opts).await.map_err(Error::WarmUp)?;
        if let Err(err) = gun.close().await {
            tracing::warn!("Warm up gun close failed: {err}");
        }
        Ok(shared)
    }
}

/// Everything needed to build instances, owned so it can move into a task.
struct Launcher<A: Ammo> {
    pool_id: String,
    provider: Arc<dyn Provider<A>>,
    aggregator: Arc<dyn Aggregator>,
    new_gun: NewGun<A>,
    new_rps_schedule: NewSchedule,
    shared_rps: Option<Arc<dyn Schedule>>,
    warm_up: Option<Shared>,
    metrics: Metrics,
    discard_overflow: bool,
}

impl<A: Ammo> Launcher<A> {
    /// Starts one instance per startup token. Every instance reports its
    /// result on `done`; the channel closes once the launcher and all
    /// instances are gone.
    async fn run(
        self,
        startup: Arc<dyn Schedule>,
        cancel: CancellationToken,
        done: mpsc::UnboundedSender<Result<()>>,
    ) -> Result<u64> {
        let now = Instant::now();
        startup.start(now);
        if let Some(rps) = &self.shared_rps {
            rps.start(now);
        }

        let mut waiter = Waiter::new(startup);
        let mut started = 0u64;
        while waiter.wait(&cancel).await {
            let instance = self.build(started, &cancel)?;
            let done = done.clone();
            let cancel = cancel.clone();
            let span = tracing::debug_span!("instance", id = started);
            tokio::spawn(
                async move {
                    let _ = done.send(instance.run(cancel).await);
                }
                .instrument(span),
            );
            started += 1;
        }
        Ok(started)
    }

    fn build(&self, id: u64, cancel: &CancellationToken) -> Result<Instance<A>> {
        let schedule = match &self.shared_rps {
            Some(shared) => shared.clone(),
            None => (self.new_rps_schedule)()?,
        };
        let mut gun = (self.new_gun)().map_err(Error::Gun)?;
        gun.accept_warm_up_result(self.warm_up.as_ref())
            .map_err(Error::Gun)?;
        let deps = GunDeps {
            cancel: cancel.clone(),
            pool_id: self.pool_id.clone(),
            instance_id: id,
            shared: self.warm_up.clone(),
        };
        gun.bind(self.aggregator.clone(), deps).map_err(Error::Gun)?;
        Ok(Instance {
            id,
            gun,
            schedule,
            provider: self.provider.clone(),
            aggregator: self.aggregator.clone(),
            metrics: self.metrics.clone(),
            discard_overflow: self.discard_overflow,
        })
    }
}

fn flatten<T>(res: Result<Result<T>, JoinError>) -> Result<T> {
    res.map_err(Error::from).and_then(|res| res)
}
