//! Waiter: turns a [`Schedule`] into a paced, cancellable loop.
//!
//! Each instance owns one waiter. [`Waiter::wait`] pulls the next token and
//! sleeps until it is due, returning early when the instance is cancelled.
//! The current time is cached between calls: while an instance is behind
//! schedule, tokens at or before the cached time are handed out without
//! reading the clock, so a saturated high-rate waiter rarely calls `now`.
use std::{pin::Pin, sync::Arc, time::Duration};

use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::schedule::{Schedule, Tick};

/// How far behind schedule an instance must be before it counts as slowed down.
pub const SLOWDOWN_THRESHOLD: Duration = Duration::from_secs(2);

pub struct Waiter {
    schedule: Arc<dyn Schedule>,
    last_now: Instant,
    overdue: Duration,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Waiter {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self {
            schedule,
            last_now: Instant::now(),
            overdue: Duration::ZERO,
            timer: None,
        }
    }

    /// Waits for the next token. Returns `false` when cancelled or when the
    /// schedule is drained.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Tick::Shot(next) = self.schedule.next() else {
            return false;
        };
        if next <= self.last_now {
            self.overdue = self.last_now - next;
            return true;
        }

        self.last_now = Instant::now();
        if next <= self.last_now {
            self.overdue = self.last_now - next;
            return true;
        }
        self.overdue = Duration::ZERO;

        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(next)));
        timer.as_mut().reset(next);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = timer.as_mut() => true,
        }
    }

    /// Whether the last token was handed out at least [`SLOWDOWN_THRESHOLD`] late.
    pub fn is_slowdown(&self) -> bool {
        self.overdue >= SLOWDOWN_THRESHOLD
    }

    pub fn is_finished(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.schedule.left() == 0
    }

    /// Lateness of the last token handed out.
    pub fn overdue(&self) -> Duration {
        self.overdue
    }

    #[cfg(test)]
    fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{constant, once};

    #[tokio::test(start_paused = true)]
    async fn paces_constant_schedule() {
        let start = Instant::now();
        let schedule = Arc::new(constant(10.0, Duration::from_secs(1)));
        schedule.start(start);
        let mut waiter = Waiter::new(schedule);
        let cancel = CancellationToken::new();

        let mut shots = 0;
        while waiter.wait(&cancel).await {
            assert!(!waiter.is_slowdown());
            shots += 1;
        }
        assert_eq!(shots, 10);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
        assert!(waiter.is_finished(&cancel));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_allocates_no_timer() {
        let schedule = Arc::new(constant(1.0, Duration::from_secs(3600)));
        schedule.start(Instant::now() + Duration::from_secs(60));
        let mut waiter = Waiter::new(schedule.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!waiter.wait(&cancel).await);
        assert!(!waiter.has_timer());
        assert!(waiter.is_finished(&cancel));
        // No token was consumed either.
        assert_eq!(schedule.left(), 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let schedule = Arc::new(once(1));
        schedule.start(Instant::now() + Duration::from_secs(3600));
        let mut waiter = Waiter::new(schedule);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        assert!(!waiter.wait(&cancel).await);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn detects_slowdown() {
        let schedule = Arc::new(once(2));
        schedule.start(Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;

        let mut waiter = Waiter::new(schedule);
        let cancel = CancellationToken::new();
        assert!(waiter.wait(&cancel).await);
        assert!(waiter.is_slowdown());
        assert_eq!(waiter.overdue(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_schedule_stops_waiting() {
        let schedule = Arc::new(once(1));
        let mut waiter = Waiter::new(schedule);
        let cancel = CancellationToken::new();
        assert!(!waiter.is_finished(&cancel));
        assert!(waiter.wait(&cancel).await);
        assert!(waiter.is_finished(&cancel));
        assert!(!waiter.wait(&cancel).await);
    }
}
