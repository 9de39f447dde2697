//! Volley: a precisely paced, pluggable load generator engine.
//!
//! Volley fires requests ("shots") at a target following a time plan, records
//! the outcome of every shot and streams the results to a report sink. The
//! engine is built from small, replaceable parts:
//!
//! - [`Schedule`]: a lazy sequence of shot times (constant rate, linear ramp,
//!   steps, bursts of instances, unlimited, or any concatenation of those).
//! - [`Waiter`]: turns a schedule into a paced, cancellable loop.
//! - [`Provider`]: produces [`Ammo`], the payload of a shot, into a bounded
//!   [`AmmoQueue`] that recycles ammo after use.
//! - [`Gun`]: the protocol driver. Shoots one ammo and reports a [`Sample`].
//! - [`Aggregator`]: consumes samples without ever blocking the shooters and
//!   writes them somewhere.
//! - [`InstancePool`]: spawns instances (one gun + one waiter loop each)
//!   following a startup schedule, and coordinates shutdown.
//! - [`Engine`]: runs pools concurrently and aggregates their errors.
//!
//! # Feature flags
//! - `builtins` (default): ready-made plugins: a number provider, a JSON-lines
//!   provider, phout/JSON-lines/discard/collecting aggregators and an echo gun.
//! - `macros` (default): the `#[ammo]` attribute in [`macros`].
//!
//! # Where to start
//! Build an [`InstancePool`] with its builder and run it inside an [`Engine`].
//! The `volley` binary shows a complete configuration-driven setup.
extern crate self as volley;

/// Collectors of shot samples
pub mod aggregator;
/// Ammo and the ammo queue
pub mod ammo;
/// Serde helpers for plugin configs
pub mod config;
pub mod engine;
pub mod error;
/// Protocol drivers
pub mod gun;
mod instance;
/// Engine-wide counters
pub mod metrics;
pub mod pool;
/// Ammo producers
pub mod provider;
pub mod sample;
pub mod schedule;
pub mod waiter;

#[cfg(feature = "macros")]
pub mod macros {
    pub use volley_macros::*;
}

pub use aggregator::{Aggregator, AggregatorDeps, Reporter};
pub use ammo::{Ammo, AmmoQueue};
pub use engine::Engine;
pub use error::{BoxError, Error, Result};
pub use gun::{Gun, GunDeps, NewGun, WarmUpOptions};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{InstancePool, Pool};
pub use provider::{Provider, ProviderDeps};
pub use sample::Sample;
pub use schedule::{NewSchedule, Schedule, Tick};
pub use waiter::Waiter;
