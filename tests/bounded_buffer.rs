//! §8 scenario: bounded buffer, 30 producers × 20 consumers × 10 items each.
//!
//! A single monitored buffer of capacity 10 guarded by a `Serial`, with
//! `insert`/`remove` blocking on FIFO `Condition`s when full/empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ucxx::cluster::{Cluster, FifoPolicy};
use ucxx::condition::Condition;
use ucxx::processor::Processor;
use ucxx::serial::Serial;
use ucxx::task::{Task, TaskAttr};

const CAPACITY: usize = 10;
const PRODUCERS: usize = 30;
const CONSUMERS: usize = 20;
const ITEMS_PER_PRODUCER: usize = 10;

struct BoundedBuffer {
    serial: Arc<Serial>,
    not_full: Arc<Condition>,
    not_empty: Arc<Condition>,
    queue: ucxx::sync::spinlock::Spinlock<VecDeque<u32>>,
}

impl BoundedBuffer {
    fn new() -> Arc<Self> {
        let serial = Serial::new("bounded-buffer");
        Arc::new(Self {
            not_full: Condition::new(Arc::clone(&serial)),
            not_empty: Condition::new(Arc::clone(&serial)),
            serial,
            queue: ucxx::sync::spinlock::Spinlock::new(VecDeque::new()),
        })
    }

    fn insert(&self, value: u32) {
        self.serial.enter(1, false).unwrap();
        while self.queue.lock().len() >= CAPACITY {
            self.not_full.wait(None).unwrap();
        }
        self.queue.lock().push_back(value);
        self.not_empty.signal();
        self.serial.exit();
    }

    fn remove(&self) -> u32 {
        self.serial.enter(2, false).unwrap();
        while self.queue.lock().is_empty() {
            self.not_empty.wait(None).unwrap();
        }
        let value = self.queue.lock().pop_front().unwrap();
        self.not_full.signal();
        self.serial.exit();
        value
    }
}

#[test]
fn producers_and_consumers_account_for_every_item() {
    let cluster = Cluster::new("bounded-buffer-cluster", Box::new(FifoPolicy::new()));
    let _processors: Vec<_> = (0..8).map(|_| Processor::spawn(Arc::clone(&cluster))).collect();

    let buffer = BoundedBuffer::new();
    let inserted = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let remaining_to_consume = Arc::new(AtomicUsize::new(PRODUCERS * ITEMS_PER_PRODUCER));

    for _ in 0..PRODUCERS {
        let buffer = Arc::clone(&buffer);
        let inserted = Arc::clone(&inserted);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            for i in 0..ITEMS_PER_PRODUCER {
                buffer.insert(i as u32);
                inserted.fetch_add(1, Ordering::SeqCst);
            }
        });
        task.activate().unwrap();
    }

    for _ in 0..CONSUMERS {
        let buffer = Arc::clone(&buffer);
        let removed = Arc::clone(&removed);
        let remaining = Arc::clone(&remaining_to_consume);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || loop {
            let prev = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 { None } else { Some(n - 1) }
            });
            if prev.is_err() {
                break;
            }
            buffer.remove();
            removed.fetch_add(1, Ordering::SeqCst);
        });
        task.activate().unwrap();
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while (inserted.load(Ordering::SeqCst) < PRODUCERS * ITEMS_PER_PRODUCER
        || removed.load(Ordering::SeqCst) < PRODUCERS * ITEMS_PER_PRODUCER)
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    assert_eq!(inserted.load(Ordering::SeqCst), PRODUCERS * ITEMS_PER_PRODUCER);
    assert_eq!(removed.load(Ordering::SeqCst), PRODUCERS * ITEMS_PER_PRODUCER);
    assert_eq!(buffer.queue.lock().len(), 0);
}
