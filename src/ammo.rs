//! Ammo and the queue that carries it from a provider to the instances.
//!
//! An [`AmmoQueue`] pairs a bounded MPMC channel with a free list. The provider
//! takes ammo from the free list with [`AmmoProducer::fresh`], fills it and
//! sends it; instances [`acquire`](AmmoQueue::acquire) it, shoot it and
//! [`release`](AmmoQueue::release) it back, where it is reset for reuse.
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

/// Default capacity of the channel between a provider and its instances.
pub const DEFAULT_AMMO_QUEUE_SIZE: usize = 8192;

/// One unit of work for a gun.
///
/// `reset` is called before ammo is reused; the default zeroes it by replacing
/// it with `Self::default()`. Override it to keep allocations (buffers, maps)
/// alive across shots.
///
/// Use `#[volley::macros::ammo]` to derive the boilerplate.
pub trait Ammo: Default + Send + 'static {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Id assigned by the provider.
    fn id(&self) -> u64 {
        0
    }

    fn set_id(&mut self, _id: u64) {}
}

impl Ammo for u64 {
    fn id(&self) -> u64 {
        *self
    }

    fn set_id(&mut self, id: u64) {
        *self = id;
    }
}

type NewAmmo<A> = Box<dyn Fn() -> A + Send + Sync>;

pub struct AmmoQueue<A: Ammo> {
    tx: Mutex<Option<flume::Sender<A>>>,
    rx: flume::Receiver<A>,
    free: SegQueue<A>,
    new_ammo: NewAmmo<A>,
}

impl<A: Ammo> AmmoQueue<A> {
    /// Queue of the given capacity; `0` selects [`DEFAULT_AMMO_QUEUE_SIZE`].
    pub fn new(size: usize) -> Self {
        Self::with_factory(size, A::default)
    }

    pub fn with_factory(size: usize, new_ammo: impl Fn() -> A + Send + Sync + 'static) -> Self {
        let size = if size == 0 {
            DEFAULT_AMMO_QUEUE_SIZE
        } else {
            size
        };
        let (tx, rx) = flume::bounded(size);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            free: SegQueue::new(),
            new_ammo: Box::new(new_ammo),
        }
    }

    /// Takes the sending half. Only the first call succeeds; dropping the
    /// producer closes the queue.
    pub fn producer(&self) -> Option<AmmoProducer<'_, A>> {
        let tx = self.tx.lock().take()?;
        Some(AmmoProducer { tx, queue: self })
    }

    /// Next ready ammo, or `None` once the producer is gone and the queue is empty.
    pub async fn acquire(&self) -> Option<A> {
        self.rx.recv_async().await.ok()
    }

    pub fn release(&self, mut ammo: A) {
        ammo.reset();
        self.free.push(ammo);
    }

    /// Ammo from the free list, or a new one.
    pub fn fresh(&self) -> A {
        self.free.pop().unwrap_or_else(|| (self.new_ammo)())
    }

    /// Closes the queue without producing anything.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Ammo waiting in the channel.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The single sending half of an [`AmmoQueue`].
pub struct AmmoProducer<'a, A: Ammo> {
    tx: flume::Sender<A>,
    queue: &'a AmmoQueue<A>,
}

impl<A: Ammo> AmmoProducer<'_, A> {
    pub fn fresh(&self) -> A {
        self.queue.fresh()
    }

    /// Sends ammo, waiting for room. Returns `false` if every consumer is gone.
    pub async fn send(&self, ammo: A) -> bool {
        self.tx.send_async(ammo).await.is_ok()
    }

    /// Returns ammo that will not be sent, e.g. one left unfilled at end of input.
    pub fn recycle(&self, ammo: A) {
        self.queue.release(ammo);
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use crate::macros::ammo;

    /// General purpose ammo decoded from JSON.
    ///
    /// Reset keeps the tag's allocation, so decoding in place into reused
    /// ammo does not allocate for it.
    #[ammo(reset = "JsonAmmo::clear")]
    #[serde(default)]
    pub struct JsonAmmo {
        pub id: u64,
        pub tag: String,
        pub body: serde_json::Value,
    }

    impl JsonAmmo {
        fn clear(&mut self) {
            self.id = 0;
            self.tag.clear();
            self.body = serde_json::Value::Null;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Payload {
        id: u64,
        data: Vec<u8>,
    }

    impl Ammo for Payload {
        fn reset(&mut self) {
            self.id = 0;
            self.data.clear();
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
    }

    #[tokio::test]
    async fn closes_when_producer_is_dropped() {
        let queue = AmmoQueue::<u64>::new(4);
        {
            let producer = queue.producer().unwrap();
            assert!(producer.send(1).await);
            assert!(producer.send(2).await);
            assert!(queue.producer().is_none());
        }
        assert_eq!(queue.acquire().await, Some(1));
        assert_eq!(queue.acquire().await, Some(2));
        assert_eq!(queue.acquire().await, None);
        assert_eq!(queue.acquire().await, None);
    }

    #[tokio::test]
    async fn released_ammo_is_reset_and_reused() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let queue = AmmoQueue::with_factory(0, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Payload {
                id: 0,
                data: Vec::with_capacity(64),
            }
        });

        let producer = queue.producer().unwrap();
        let mut ammo = producer.fresh();
        ammo.set_id(5);
        ammo.data.extend_from_slice(b"payload");
        assert!(producer.send(ammo).await);

        let ammo = queue.acquire().await.unwrap();
        assert_eq!(ammo.id(), 5);
        queue.release(ammo);

        let reused = producer.fresh();
        assert_eq!(reused.id, 0);
        assert!(reused.data.is_empty());
        assert!(reused.data.capacity() >= 64);
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn close_without_producing() {
        let queue = AmmoQueue::<u64>::new(1);
        queue.close();
        assert!(queue.producer().is_none());
        assert_eq!(queue.acquire().await, None);
    }

    #[cfg(feature = "builtins")]
    #[test]
    fn json_ammo_carries_its_id() {
        let mut ammo: JsonAmmo =
            serde_json::from_str(r#"{"tag": "get", "body": {"path": "/"}}"#).unwrap();
        assert_eq!(ammo.id(), 0);
        ammo.set_id(9);
        assert_eq!(ammo.id, 9);
        let capacity = ammo.tag.capacity();
        ammo.reset();
        assert_eq!(ammo.id, 0);
        assert_eq!(ammo.tag, "");
        assert_eq!(ammo.tag.capacity(), capacity);
        assert!(ammo.body.is_null());
    }
}
