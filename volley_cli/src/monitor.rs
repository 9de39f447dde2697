//! Live counters over HTTP, in expvar layout: `GET /debug/vars`.
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use volley::{Metrics, MetricsSnapshot};

/// Counters plus per-second rates, refreshed by [`Monitor::track`].
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    metrics: Metrics,
    request_rate: Arc<AtomicI64>,
    response_rate: Arc<AtomicI64>,
}

impl Monitor {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    /// Recomputes the rates once per second until cancelled.
    pub async fn track(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prev = self.metrics.snapshot();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = self.metrics.snapshot();
            self.update(&prev, &now);
            prev = now;
        }
    }

    fn update(&self, prev: &MetricsSnapshot, now: &MetricsSnapshot) {
        self.request_rate
            .store(now.requests - prev.requests, Ordering::Relaxed);
        self.response_rate
            .store(now.responses - prev.responses, Ordering::Relaxed);
    }

    pub fn vars(&self) -> BTreeMap<&'static str, Value> {
        let snapshot = self.metrics.snapshot();
        BTreeMap::from([
            ("engine_Requests", json!(snapshot.requests)),
            ("engine_Responses", json!(snapshot.responses)),
            ("engine_UsersStarted", json!(snapshot.instances_started)),
            ("engine_UsersFinished", json!(snapshot.instances_finished)),
            ("engine_ActiveUsers", json!(snapshot.active_instances())),
            ("engine_ActiveRequests", json!(snapshot.active_requests())),
            ("engine_ReqPS", json!(self.request_rate.load(Ordering::Relaxed))),
            ("engine_ResPS", json!(self.response_rate.load(Ordering::Relaxed))),
        ])
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/debug/vars", get(debug_vars))
            .with_state(self)
    }

    /// Serves [`Monitor::router`] on `addr` and tracks rates until cancelled.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind monitor to {addr}"))?;
        tracing::info!("Serving counters on http://{addr}/debug/vars");

        tokio::spawn(self.clone().track(cancel.clone()));
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("monitor server failed")
    }
}

async fn debug_vars(State(monitor): State<Monitor>) -> Json<BTreeMap<&'static str, Value>> {
    Json(monitor.vars())
}
