//! Sample: the outcome of a single shot.
//!
//! A gun acquires a [`Sample`] when a shot starts, fills in whatever it
//! measured and reports it to its aggregator. The aggregator encodes the sample
//! and hands it back with [`Sample::release`], so under steady load no sample is
//! ever allocated twice.
//!
//! The metric vector mirrors the columns of the phout report format: round-trip
//! time, connect/send/latency/receive durations in microseconds, request and
//! response sizes, the low-level errno and the protocol status code.
use std::{
    fmt,
    io,
    sync::LazyLock,
    time::{Duration, SystemTime},
};

use crossbeam_queue::SegQueue;
use tokio::time::Instant;

use crate::aggregator::Recycle;

/// Tag of the synthetic sample reported instead of an overdue shot.
pub const DISCARDED_TAG: &str = "discarded";

/// Errno used when an error carries no OS error code.
pub const UNKNOWN_ERRNO: i64 = 999;

const ETIMEDOUT: i64 = 110;

static POOL: LazyLock<SegQueue<Box<Sample>>> = LazyLock::new(SegQueue::new);

/// Index into the sample metric vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Field {
    Rtt,
    Connect,
    Send,
    Latency,
    Receive,
    IntervalEvent,
    RequestBytes,
    ResponseBytes,
    Errno,
    ProtoCode,
}

impl Field {
    pub const COUNT: usize = 10;

    pub const ALL: [Field; Field::COUNT] = [
        Field::Rtt,
        Field::Connect,
        Field::Send,
        Field::Latency,
        Field::Receive,
        Field::IntervalEvent,
        Field::RequestBytes,
        Field::ResponseBytes,
        Field::Errno,
        Field::ProtoCode,
    ];
}

#[derive(Clone)]
pub struct Sample {
    timestamp: SystemTime,
    started: Instant,
    tags: String,
    id: u64,
    metrics: [i64; Field::COUNT],
    error: Option<String>,
}

impl Sample {
    /// Takes a sample from the process-wide pool and stamps it with the current time.
    pub fn acquire(tag: &str) -> Box<Sample> {
        let mut sample = POOL.pop().unwrap_or_else(|| {
            Box::new(Sample {
                timestamp: SystemTime::now(),
                started: Instant::now(),
                tags: String::new(),
                id: 0,
                metrics: [0; Field::COUNT],
                error: None,
            })
        });
        sample.timestamp = SystemTime::now();
        sample.started = Instant::now();
        sample.tags.clear();
        sample.tags.push_str(tag);
        sample.id = 0;
        sample.metrics = [0; Field::COUNT];
        sample.error = None;
        sample
    }

    /// Returns the sample to the pool.
    pub fn release(self: Box<Self>) {
        POOL.push(self);
    }

    /// Sample reported in place of a shot skipped because the instance fell behind.
    pub fn discarded() -> Box<Sample> {
        let mut sample = Sample::acquire(DISCARDED_TAG);
        sample.set_proto_code(0);
        sample
    }

    /// Number of samples currently parked in the pool.
    pub fn pool_len() -> usize {
        POOL.len()
    }

    /// Empties the pool. Meant for tests that count pooled samples.
    pub fn clear_pool() {
        while POOL.pop().is_some() {}
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn tags(&self) -> &str {
        &self.tags
    }

    /// Appends a label; tags are pipe separated.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.is_empty() {
            self.tags.push('|');
        }
        self.tags.push_str(tag);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn get(&self, field: Field) -> i64 {
        self.metrics[field as usize]
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn proto_code(&self) -> i64 {
        self.get(Field::ProtoCode)
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.get(Field::Rtt).max(0) as u64)
    }

    pub fn set_proto_code(&mut self, code: i64) {
        self.set(Field::ProtoCode, code);
        self.set_rtt_if_unset();
    }

    /// Records a shot error together with its errno.
    pub fn set_err(&mut self, err: &(dyn std::error::Error + 'static)) {
        self.error = Some(err.to_string());
        self.set(Field::Errno, errno(err));
        self.set_rtt_if_unset();
    }

    /// Sets the round-trip time explicitly. Zero durations are recorded as 1µs.
    pub fn set_rtt(&mut self, rtt: Duration) {
        let micros = micros(rtt).max(1);
        self.set(Field::Rtt, micros);
        self.set(Field::IntervalEvent, micros);
    }

    pub fn set_connect_time(&mut self, d: Duration) {
        self.set(Field::Connect, micros(d));
    }

    pub fn set_send_time(&mut self, d: Duration) {
        self.set(Field::Send, micros(d));
    }

    pub fn set_latency(&mut self, d: Duration) {
        self.set(Field::Latency, micros(d));
    }

    pub fn set_receive_time(&mut self, d: Duration) {
        self.set(Field::Receive, micros(d));
    }

    pub fn set_request_bytes(&mut self, bytes: usize) {
        self.set(Field::RequestBytes, bytes as i64);
    }

    pub fn set_response_bytes(&mut self, bytes: usize) {
        self.set(Field::ResponseBytes, bytes as i64);
    }

    fn set(&mut self, field: Field, value: i64) {
        self.metrics[field as usize] = value;
    }

    fn set_rtt_if_unset(&mut self) {
        if self.get(Field::Rtt) == 0 {
            self.set_rtt(self.started.elapsed());
        }
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("timestamp", &self.timestamp)
            .field("tags", &self.tags)
            .field("id", &self.id)
            .field("metrics", &self.metrics)
            .field("error", &self.error)
            .finish()
    }
}

impl Recycle for Box<Sample> {
    fn recycle(self) {
        self.release();
    }
}

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

fn errno(err: &(dyn std::error::Error + 'static)) -> i64 {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(code) = io_err.raw_os_error() {
                return code as i64;
            }
            if io_err.kind() == io::ErrorKind::TimedOut {
                return ETIMEDOUT;
            }
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return ETIMEDOUT;
        }
        current = e.source();
    }
    UNKNOWN_ERRNO
}
