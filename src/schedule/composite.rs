use std::collections::VecDeque;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::{Schedule, Tick};

/// Concatenation of schedules: each nested schedule starts at the finish time
/// of the one before it.
///
/// Pulling a token from a head that still has tokens only takes the read lock.
/// The write lock is taken when the head drains, and the head is re-checked
/// under it so that concurrent callers shift the chain exactly once.
pub struct CompositeSchedule {
    chain: RwLock<Chain>,
}

struct Chain {
    scheds: VecDeque<Box<dyn Schedule>>,
    /// Tokens held by the schedules after the one at the same index, or `-1`
    /// when any of them is unlimited.
    left_after: VecDeque<i64>,
    start: Option<Instant>,
}

impl CompositeSchedule {
    pub fn new(scheds: Vec<Box<dyn Schedule>>) -> Self {
        let mut left_after = VecDeque::with_capacity(scheds.len());
        let mut after = 0i64;
        for sched in scheds.iter().rev() {
            left_after.push_front(after);
            after = match (after, sched.left()) {
                (-1, _) | (_, -1) => -1,
                (after, left) => after + left,
            };
        }
        Self {
            chain: RwLock::new(Chain {
                scheds: scheds.into(),
                left_after,
                start: None,
            }),
        }
    }
}

impl Chain {
    fn start(&mut self, start: Instant) {
        if self.start.is_some() {
            panic!("schedule started twice");
        }
        self.start = Some(start);
        if let Some(head) = self.scheds.front() {
            head.start(start);
        }
    }
}

impl Schedule for CompositeSchedule {
    fn start(&self, start: Instant) {
        self.chain.write().start(start);
    }

    fn next(&self) -> Tick {
        {
            let chain = self.chain.read();
            if chain.start.is_some() {
                match chain.scheds.front() {
                    Some(head) => {
                        if let Tick::Shot(at) = head.next() {
                            return Tick::Shot(at);
                        }
                    }
                    None => return Tick::Done(chain.start.unwrap_or_else(Instant::now)),
                }
            }
        }

        let mut chain = self.chain.write();
        if chain.start.is_none() {
            chain.start(Instant::now());
        }
        loop {
            let Some(head) = chain.scheds.front() else {
                return Tick::Done(chain.start.unwrap_or_else(Instant::now));
            };
            let finish = match head.next() {
                Tick::Shot(at) => return Tick::Shot(at),
                Tick::Done(finish) => finish,
            };
            if chain.scheds.len() == 1 {
                return Tick::Done(finish);
            }
            chain.scheds.pop_front();
            chain.left_after.pop_front();
            if let Some(head) = chain.scheds.front() {
                head.start(finish);
            }
        }
    }

    fn left(&self) -> i64 {
        let chain = self.chain.read();
        let (Some(head), Some(after)) = (chain.scheds.front(), chain.left_after.front()) else {
            return 0;
        };
        match (head.left(), *after) {
            (-1, _) | (_, -1) => -1,
            (left, after) => left + after,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::schedule::{constant, once, tests::drain, unlimited};

    #[test]
    fn successor_starts_at_predecessor_finish() {
        let start = Instant::now();
        let s = CompositeSchedule::new(vec![
            Box::new(constant(2.0, Duration::from_secs(1))),
            Box::new(once(1)),
            Box::new(constant(1.0, Duration::from_secs(2))),
        ]);
        assert_eq!(s.left(), 5);
        s.start(start);

        assert_eq!(s.next(), Tick::Shot(start));
        assert_eq!(s.left(), 4);
        assert_eq!(s.next(), Tick::Shot(start + Duration::from_millis(500)));
        // Interleaved `left` calls must not shift the chain.
        assert_eq!(s.left(), 3);
        assert_eq!(s.left(), 3);
        assert_eq!(s.next(), Tick::Shot(start + Duration::from_secs(1)));
        assert_eq!(s.next(), Tick::Shot(start + Duration::from_secs(1)));
        assert_eq!(s.next(), Tick::Shot(start + Duration::from_secs(2)));
        assert_eq!(s.next(), Tick::Done(start + Duration::from_secs(3)));
        assert_eq!(s.left(), 0);
        assert_eq!(s.next(), Tick::Done(start + Duration::from_secs(3)));
    }

    #[test]
    fn empty_members_are_skipped() {
        let start = Instant::now();
        let s = CompositeSchedule::new(vec![
            Box::new(constant(0.0, Duration::from_secs(5))),
            Box::new(once(2)),
        ]);
        s.start(start);
        let (shots, finish) = drain(&s);
        assert_eq!(shots, vec![start + Duration::from_secs(5); 2]);
        assert_eq!(finish, start + Duration::from_secs(5));
    }

    #[test]
    fn unlimited_member_makes_left_unknown() {
        let s = CompositeSchedule::new(vec![
            Box::new(once(1)),
            Box::new(unlimited(Duration::from_secs(1))),
        ]);
        assert_eq!(s.left(), -1);
    }

    #[test]
    fn empty_composite_is_done_at_start() {
        let start = Instant::now();
        let s = CompositeSchedule::new(vec![]);
        assert_eq!(s.left(), 0);
        s.start(start);
        assert_eq!(s.next(), Tick::Done(start));
    }

    #[test]
    fn concurrent_shift_hands_out_every_token_once() {
        let start = Instant::now();
        let scheds: Vec<Box<dyn Schedule>> = (0..50)
            .map(|_| Box::new(constant(100.0, Duration::from_millis(100))) as Box<dyn Schedule>)
            .collect();
        let s = Arc::new(CompositeSchedule::new(scheds));
        assert_eq!(s.left(), 500);
        s.start(start);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Tick::Shot(at) = s.next() {
                        taken.push(at);
                    }
                    taken
                })
            })
            .collect();
        let mut all: Vec<Instant> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 500);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 500);
        assert_eq!(s.next(), Tick::Done(start + Duration::from_secs(5)));
    }
}
