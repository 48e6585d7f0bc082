//! §8 scenario: dating service, 20 boys × 20 girls, each presenting a
//! unique 7-digit phone number through a monitor that pairs them via
//! `signalBlock` exchange.

use std::sync::Arc;

use ucxx::cluster::{Cluster, FifoPolicy};
use ucxx::condition::Condition;
use ucxx::processor::Processor;
use ucxx::serial::Serial;
use ucxx::sync::spinlock::Spinlock;
use ucxx::task::{Task, TaskAttr};

const COUPLES: usize = 20;

struct Service {
    serial: Arc<Serial>,
    boy_waiting: Arc<Condition>,
    girl_waiting: Arc<Condition>,
    boy_phone: Spinlock<Option<u32>>,
    girl_phone: Spinlock<Option<u32>>,
}

impl Service {
    fn new() -> Arc<Self> {
        let serial = Serial::new("dating-service");
        Arc::new(Self {
            boy_waiting: Condition::new(Arc::clone(&serial)),
            girl_waiting: Condition::new(Arc::clone(&serial)),
            serial,
            boy_phone: Spinlock::new(None),
            girl_phone: Spinlock::new(None),
        })
    }

    /// A boy presents his phone number and waits for a girl's in exchange.
    fn boy(&self, phone: u32) -> u32 {
        self.serial.enter(1, false).unwrap();
        let result = if self.girl_waiting.is_empty() {
            *self.boy_phone.lock() = Some(phone);
            self.boy_waiting.wait(None).unwrap();
            self.girl_phone.lock().take().expect("girl must have left her number")
        } else {
            let hers = self.girl_phone.lock().take().expect("a waiting girl left a number");
            *self.boy_phone.lock() = Some(phone);
            self.girl_waiting.signal_block().unwrap();
            hers
        };
        self.serial.exit();
        result
    }

    fn girl(&self, phone: u32) -> u32 {
        self.serial.enter(2, false).unwrap();
        let result = if self.boy_waiting.is_empty() {
            *self.girl_phone.lock() = Some(phone);
            self.girl_waiting.wait(None).unwrap();
            self.boy_phone.lock().take().expect("boy must have left his number")
        } else {
            let his = self.boy_phone.lock().take().expect("a waiting boy left a number");
            *self.girl_phone.lock() = Some(phone);
            self.boy_waiting.signal_block().unwrap();
            his
        };
        self.serial.exit();
        result
    }
}

#[test]
fn every_couple_exchanges_numbers_exactly_once() {
    let cluster = Cluster::new("dating-cluster", Box::new(FifoPolicy::new()));
    let _processors: Vec<_> = (0..8).map(|_| Processor::spawn(Arc::clone(&cluster))).collect();

    let service = Service::new();
    let results = Arc::new(std::sync::Mutex::new(Vec::<(u32, u32)>::new()));

    for i in 0..COUPLES {
        let boy_phone = 1_000_000 + i as u32;
        let service = Arc::clone(&service);
        let results = Arc::clone(&results);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            let hers = service.boy(boy_phone);
            results.lock().unwrap().push((boy_phone, hers));
        });
        task.activate().unwrap();
    }
    for i in 0..COUPLES {
        let girl_phone = 2_000_000 + i as u32;
        let service = Arc::clone(&service);
        let results = Arc::clone(&results);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            let his = service.girl(girl_phone);
            results.lock().unwrap().push((his, girl_phone));
        });
        task.activate().unwrap();
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while results.lock().unwrap().len() < COUPLES * 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let pairs = results.lock().unwrap();
    assert_eq!(pairs.len(), COUPLES * 2, "not every couple matched before the deadline");

    let mut boys_seen = std::collections::HashSet::new();
    let mut girls_seen = std::collections::HashSet::new();
    for &(boy, girl) in pairs.iter() {
        assert!((1_000_000..1_000_000 + COUPLES as u32).contains(&boy));
        assert!((2_000_000..2_000_000 + COUPLES as u32).contains(&girl));
        boys_seen.insert(boy);
        girls_seen.insert(girl);
    }
    assert_eq!(boys_seen.len(), COUPLES, "every boy's number must appear exactly once across all pairs");
    assert_eq!(girls_seen.len(), COUPLES, "every girl's number must appear exactly once across all pairs");
}
