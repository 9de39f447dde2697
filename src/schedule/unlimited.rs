use std::{sync::OnceLock, time::Duration};

use tokio::time::Instant;

use super::{Schedule, Tick};

/// Hands out the current time on every call until `duration` elapses.
#[derive(Debug)]
pub struct UnlimitedSchedule {
    duration: Duration,
    start: OnceLock<Instant>,
}

impl UnlimitedSchedule {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            start: OnceLock::new(),
        }
    }

    fn finish(&self) -> Instant {
        *self.start.get_or_init(Instant::now) + self.duration
    }
}

impl Schedule for UnlimitedSchedule {
    fn start(&self, start: Instant) {
        if self.start.set(start).is_err() {
            panic!("schedule started twice");
        }
    }

    fn next(&self) -> Tick {
        let finish = self.finish();
        let now = Instant::now();
        if now >= finish {
            return Tick::Done(finish);
        }
        Tick::Shot(now)
    }

    fn left(&self) -> i64 {
        match self.start.get() {
            Some(start) if Instant::now() >= *start + self.duration => 0,
            _ => -1,
        }
    }
}
