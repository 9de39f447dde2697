//! Schedule: the time plan that shots are paced by.
//!
//! A [`Schedule`] lazily produces the timestamps at which shots should be
//! fired, relative to the moment it was started. Schedules never sleep and know
//! nothing about cancellation: they only answer "when is the next shot?". The
//! [`Waiter`](crate::waiter::Waiter) turns those answers into paced work.
//!
//! # Contract
//! - [`Schedule::start`] is called at most once; a second call panics. If
//!   [`Schedule::next`] is called first the schedule starts at the current time.
//! - [`Schedule::next`] returns [`Tick::Shot`] for every token and
//!   [`Tick::Done`] carrying the finish time once drained. The finish time is a
//!   terminal marker, not a shot.
//! - [`Schedule::left`] is the number of tokens not yet taken, or `-1` when the
//!   schedule is unlimited. A drained schedule reports `0`.
//! - All methods are safe to call concurrently; that is how instances share a
//!   pool-wide schedule.
//!
//! # Built-in plans
//! Most plans are a [`DoAtSchedule`]: a token count `n` and a pure function
//! giving the offset of the i-th token.
//!
//! ```text
//! once(n)                 n tokens at t0, finish t0
//! constant(rps, d)        floor(rps*d) tokens, i-th at t0 + i/rps, finish t0 + d
//! line(from, to, d)       a = (to-from)/d, b = from
//!                         i-th at t0 + (sqrt(2a*i + b^2) - b) / a, finish t0 + d
//! step(from, to, s, d)    constant(from, d), constant(from+s, d), ..., constant(to, d)
//! instance_step(f, t, s, d) once(f), then [constant(0, d), once(s)] until t
//! unlimited(d)            "now" on every call until d elapses
//! ```
//!
//! Plans concatenate through [`CompositeSchedule`], which starts each nested
//! schedule at the finish time of its predecessor.
mod composite;
mod config;
mod do_at;
mod unlimited;

pub use composite::CompositeSchedule;
pub use config::{ScheduleConfig, ScheduleSpec};
pub use do_at::DoAtSchedule;
pub use unlimited::UnlimitedSchedule;

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Answer of [`Schedule::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A token: fire a shot at this instant.
    Shot(Instant),
    /// The schedule is drained; carries its finish time.
    Done(Instant),
}

impl Tick {
    pub fn at(self) -> Instant {
        match self {
            Tick::Shot(at) | Tick::Done(at) => at,
        }
    }

    pub fn is_shot(self) -> bool {
        matches!(self, Tick::Shot(_))
    }
}

pub trait Schedule: Send + Sync + 'static {
    /// Anchors the schedule. Panics when called twice.
    fn start(&self, start: Instant);

    fn next(&self) -> Tick;

    /// Remaining tokens, or `-1` if unknown.
    fn left(&self) -> i64;
}

/// Factory building a fresh schedule; pools call it once per instance when the
/// rate schedule is not shared.
pub type NewSchedule = Arc<dyn Fn() -> Result<Arc<dyn Schedule>> + Send + Sync>;

/// `n` tokens, all at the start time.
pub fn once(times: i64) -> DoAtSchedule {
    DoAtSchedule::new(Duration::ZERO, times.max(0), |_| Duration::ZERO)
}

/// `ops` tokens per second for `duration`.
pub fn constant(ops: f64, duration: Duration) -> DoAtSchedule {
    let ops = if ops.is_finite() { ops.max(0.0) } else { 0.0 };
    let n = (ops * duration.as_secs_f64()).floor() as i64;
    DoAtSchedule::new(duration, n, move |i| {
        Duration::from_secs_f64(i as f64 / ops)
    })
}

/// Rate growing (or shrinking) linearly from `from` to `to` over `duration`.
pub fn line(from: f64, to: f64, duration: Duration) -> DoAtSchedule {
    if from == to {
        return constant(from, duration);
    }
    let secs = duration.as_secs_f64();
    if secs == 0.0 {
        return DoAtSchedule::new(duration, 0, |_| Duration::ZERO);
    }
    let a = (to - from) / secs;
    let b = from;
    let n = (a * secs * secs / 2.0 + b * secs).floor().max(0.0) as i64;
    DoAtSchedule::new(duration, n, move |i| {
        let x = ((b * b + 2.0 * a * i as f64).max(0.0).sqrt() - b) / a;
        Duration::from_secs_f64(x.max(0.0))
    })
}

/// Constant levels from `from` to `to` in increments of `step`, each held for `duration`.
pub fn step(from: f64, to: f64, step: f64, duration: Duration) -> Result<CompositeSchedule> {
    if !(step > 0.0) {
        return Err(Error::Config(format!("step must be positive, got {step}")));
    }
    let mut levels: Vec<Box<dyn Schedule>> = Vec::new();
    if from <= to {
        let mut level = from;
        while level < to {
            levels.push(Box::new(constant(level, duration)));
            level += step;
        }
    } else {
        let mut level = from;
        while level > to {
            levels.push(Box::new(constant(level, duration)));
            level -= step;
        }
    }
    levels.push(Box::new(constant(to, duration)));
    Ok(CompositeSchedule::new(levels))
}

/// Starts `from` instances at once, then adds `step` more every `step_duration`
/// until `to` is reached. Meant for startup schedules.
pub fn instance_step(
    from: i64,
    to: i64,
    step: i64,
    step_duration: Duration,
) -> Result<CompositeSchedule> {
    if step <= 0 {
        return Err(Error::Config(format!("step must be positive, got {step}")));
    }
    let mut nested: Vec<Box<dyn Schedule>> = vec![Box::new(once(from))];
    let mut count = from + step;
    while count <= to {
        nested.push(Box::new(constant(0.0, step_duration)));
        nested.push(Box::new(once(step)));
        count += step;
    }
    Ok(CompositeSchedule::new(nested))
}

/// Unthrottled shots until `duration` elapses.
pub fn unlimited(duration: Duration) -> UnlimitedSchedule {
    UnlimitedSchedule::new(duration)
}

pub fn composite(nested: Vec<Box<dyn Schedule>>) -> CompositeSchedule {
    CompositeSchedule::new(nested)
}
