use std::{
    sync::{
        OnceLock,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use super::{Schedule, Tick};

type DoAt = Box<dyn Fn(i64) -> Duration + Send + Sync>;

/// Schedule of `n` tokens whose offsets from the start are given by a pure function.
///
/// The index is advanced with a single atomic add, so any number of instances
/// may pull tokens concurrently without locking.
pub struct DoAtSchedule {
    duration: Duration,
    n: i64,
    do_at: DoAt,
    i: AtomicI64,
    start: OnceLock<Instant>,
}

impl DoAtSchedule {
    pub fn new(
        duration: Duration,
        n: i64,
        do_at: impl Fn(i64) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            duration,
            n: n.max(0),
            do_at: Box::new(do_at),
            i: AtomicI64::new(0),
            start: OnceLock::new(),
        }
    }

    fn start_time(&self) -> Instant {
        *self.start.get_or_init(Instant::now)
    }
}

impl Schedule for DoAtSchedule {
    fn start(&self, start: Instant) {
        if self.start.set(start).is_err() {
            panic!("schedule started twice");
        }
    }

    fn next(&self) -> Tick {
        let start = self.start_time();
        let i = self.i.fetch_add(1, Ordering::AcqRel);
        if i >= self.n {
            return Tick::Done(start + self.duration);
        }
        Tick::Shot(start + (self.do_at)(i))
    }

    fn left(&self) -> i64 {
        (self.n - self.i.load(Ordering::Acquire)).max(0)
    }
}

impl std::fmt::Debug for DoAtSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoAtSchedule")
            .field("duration", &self.duration)
            .field("n", &self.n)
            .field("i", &self.i)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn next_before_start_starts_now() {
        let before = Instant::now();
        let s = DoAtSchedule::new(Duration::from_secs(1), 1, |_| Duration::ZERO);
        let Tick::Shot(at) = s.next() else {
            panic!("expected a shot");
        };
        assert!(at >= before);
        assert_eq!(s.next(), Tick::Done(at + Duration::from_secs(1)));
    }

    #[test]
    fn concurrent_pulls_never_duplicate_tokens() {
        let s = Arc::new(DoAtSchedule::new(Duration::from_secs(1), 1000, |i| {
            Duration::from_micros(i as u64)
        }));
        let start = Instant::now();
        s.start(start);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Tick::Shot(at) = s.next() {
                        taken.push(at - start);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<Duration> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(s.left(), 0);
    }
}
