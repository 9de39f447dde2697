use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    pool::Pool,
};

/// Runs every pool concurrently.
///
/// The first pool failure cancels the others and is returned once they have
/// all stopped. Pools that only report cancellation are not failures.
///
/// ```rust, ignore
/// let metrics = Metrics::new();
/// let engine = Engine::builder()
///     .pools(vec![Arc::new(pool) as Arc<dyn Pool>])
///     .metrics(metrics.clone())
///     .build();
/// engine.run(CancellationToken::new()).await?;
/// ```
#[derive(TypedBuilder)]
pub struct Engine {
    pools: Vec<Arc<dyn Pool>>,
    /// Counters shared with the pools, exposed for live reporting.
    #[builder(default)]
    metrics: Metrics,
    #[builder(default, setter(skip))]
    tracker: TaskTracker,
}

impl Engine {
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let run_cancel = cancel.child_token();
        let _guard = run_cancel.clone().drop_guard();

        tracing::info!("Running {} pools...", self.pools.len());
        let mut pools = JoinSet::new();
        for pool in &self.pools {
            let pool = pool.clone();
            let cancel = run_cancel.clone();
            pools.spawn(self.tracker.track_future(async move {
                let res = pool.run(cancel).await;
                (pool.id().to_owned(), res)
            }));
        }
        self.tracker.close();

        let mut failure = None;
        while let Some(joined) = pools.join_next().await {
            let (id, res) = match joined {
                Ok(joined) => joined,
                Err(err) => ("<unknown>".to_owned(), Err(err.into())),
            };
            match res {
                Ok(()) => tracing::info!(pool = %id, "Pool finished"),
                Err(err) if err.is_cancelled() => tracing::debug!(pool = %id, "Pool cancelled"),
                Err(err) => {
                    tracing::error!(pool = %id, "Pool failed: {err}");
                    if failure.is_none() {
                        failure = Some(err);
                        run_cancel.cancel();
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::info!("Engine finished");
        Ok(())
    }

    /// Resolves once every pool started by [`Engine::run`] has returned.
    /// Only meaningful after `run` has been entered.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
