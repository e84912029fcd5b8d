use drift_config::{Config, EvictionPolicy};
use drift_detector::{Race, RaceDetector, ThreadHandle};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

// Quick stress sizes for CI (~1 sec)
const THREADS: u64 = 8;
const ITERATIONS: usize = 2_000;

const SHARED: usize = 0x5000;
const LOCK: usize = 0x9000;

struct Harness {
    detector: Arc<RaceDetector>,
    races: Arc<AtomicUsize>,
    workers: Vec<ThreadHandle>,
}

impl Harness {
    fn new(config: Config) -> Self {
        let races = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&races);
        let detector = Arc::new(RaceDetector::new(&config, move |_: &Race| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        detector.fork(0, 1).unwrap();
        let workers = (0..THREADS)
            .map(|i| detector.fork(1, 10 + i).unwrap())
            .collect();
        Self {
            detector,
            races,
            workers,
        }
    }

    /// Run `body` on one OS thread per worker and join them all back into main.
    fn run<F>(self, body: F) -> (Arc<RaceDetector>, usize)
    where
        F: Fn(&RaceDetector, &ThreadHandle, usize) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let start = Instant::now();
        let joins: Vec<_> = self
            .workers
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                let detector = Arc::clone(&self.detector);
                let handle = Arc::clone(handle);
                let body = Arc::clone(&body);
                thread::spawn(move || body(&detector, &handle, i))
            })
            .collect();
        for join in joins {
            join.join().unwrap();
        }
        for handle in &self.workers {
            self.detector.join(1, handle.tid());
        }
        println!("{} threads took: {:?}", THREADS, start.elapsed());
        println!("Stats: {:?}", self.detector.stats());
        (self.detector, self.races.load(Ordering::Relaxed))
    }
}

#[test]
fn stress_test_lock_protected_counter() {
    let h = Harness::new(Config::default());
    let mutex = Arc::new(Mutex::new(0u64));

    let guarded = Arc::clone(&mutex);
    let (detector, races) = h.run(move |d, me, _| {
        for _ in 0..ITERATIONS {
            let mut value = guarded.lock().unwrap();
            d.acquire(me, LOCK, 1, true);
            d.read(me, 0x100, SHARED, 8);
            *value += 1;
            d.write(me, 0x104, SHARED, 8);
            d.release(me, LOCK, true).unwrap();
        }
    });

    assert_eq!(*mutex.lock().unwrap(), THREADS * ITERATIONS as u64);
    assert_eq!(races, 0);
    assert_eq!(detector.live_threads(), 1);
    detector.finalize();
}

#[test]
fn stress_test_disjoint_addresses() {
    let h = Harness::new(Config::default());

    let (detector, races) = h.run(|d, me, i| {
        let base = 0x100_000 * (i + 1);
        for n in 0..ITERATIONS {
            d.write(me, 0x200, base + n * 8, 8);
            d.read(me, 0x204, base + n * 8, 8);
        }
    });

    assert_eq!(races, 0);
    assert_eq!(detector.tracked_locations(), THREADS as usize * ITERATIONS);
    detector.finalize();
}

#[test]
fn stress_test_unsynchronized_writes_race() {
    let h = Harness::new(Config::default());

    let (detector, races) = h.run(|d, me, _| {
        for _ in 0..ITERATIONS / 10 {
            d.write(me, 0x300, SHARED, 8);
        }
    });

    println!("Races reported: {}", races);
    assert!(races > 0);
    assert_eq!(races as u64, detector.stats().races());
    detector.finalize();
}

#[test]
fn stress_test_concurrent_eviction() {
    let mut config = Config::default();
    config.detector.capacity = 64;
    config.detector.lock_shards = 8;
    config.eviction.policy = EvictionPolicy::RandomSample;
    config.eviction.sample_size = 16;
    config.eviction.seed = Some(7);
    let h = Harness::new(config);
    let mutex = Arc::new(Mutex::new(()));

    let guarded = Arc::clone(&mutex);
    let (detector, races) = h.run(move |d, me, i| {
        let base = 0x100_000 * (i + 1);
        for n in 0..ITERATIONS {
            d.write(me, 0x400, base + n * 8, 8);
            if n % 16 == 0 {
                let _held = guarded.lock().unwrap();
                d.acquire(me, LOCK, 1, true);
                d.write(me, 0x404, SHARED, 8);
                d.release(me, LOCK, true).unwrap();
            }
        }
    });

    // Dropping history can hide races but never invents one.
    assert_eq!(races, 0);
    let stats = detector.stats();
    assert!(stats.eviction_runs > 0);
    assert!(stats.evicted > 0);
    assert!(detector.tracked_locations() < THREADS as usize * ITERATIONS);
    detector.finalize();
}

const TEARDOWN_ADDRESSES: usize = 256;
const TEARDOWN_BASE: usize = 0x200_000;
// Idle threads make the teardown purge long enough to overlap with accesses.
const IDLE_THREADS: u64 = 20_000;
const TEARDOWN_TRIALS: usize = 5;

/// Detector with main (1), a writer (2) that wrote every teardown address, an
/// observer (3), and a crowd of idle threads.
fn teardown_setup(
    synchronized: bool,
) -> (Arc<RaceDetector>, Arc<Mutex<Vec<Race>>>, ThreadHandle) {
    let races = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&races);
    let detector = Arc::new(RaceDetector::new(&Config::default(), move |race: &Race| {
        sink.lock().unwrap().push(race.clone());
    }));
    detector.fork(0, 1).unwrap();
    let writer = detector.fork(1, 2).unwrap();
    let observer = detector.fork(1, 3).unwrap();

    detector.acquire(&writer, LOCK, 1, true);
    for n in 0..TEARDOWN_ADDRESSES {
        detector.write(&writer, 0x500, TEARDOWN_BASE + n * 8, 8);
    }
    detector.release(&writer, LOCK, true).unwrap();
    if synchronized {
        detector.acquire(&observer, LOCK, 1, true);
    }
    for i in 0..IDLE_THREADS {
        detector.fork(1, 1_000 + i).unwrap();
    }
    (detector, races, observer)
}

/// Keep re-reading the teardown addresses in fresh epochs until `finish(2)`
/// has returned on this thread.
fn finish_writer_while_observing(detector: &Arc<RaceDetector>, observer: ThreadHandle) {
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let detector = Arc::clone(detector);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                observer.advance_own_clock().unwrap();
                for n in 0..TEARDOWN_ADDRESSES {
                    detector.read(&observer, 0x504, TEARDOWN_BASE + n * 8, 8);
                }
            }
        })
    };

    let start = Instant::now();
    detector.finish(2);
    println!("Teardown took: {:?}", start.elapsed());
    done.store(true, Ordering::Release);
    reader.join().unwrap();
}

#[test]
fn stress_test_teardown_keeps_observed_history_ordered() {
    for trial in 0..TEARDOWN_TRIALS {
        let (detector, races, observer) = teardown_setup(true);
        finish_writer_while_observing(&detector, observer);

        let races = races.lock().unwrap();
        assert!(races.is_empty(), "trial {}: {:?}", trial, races.first());
        detector.finalize();
    }
}

#[test]
fn stress_test_races_against_departing_thread_name_it() {
    for _ in 0..TEARDOWN_TRIALS {
        let (detector, races, observer) = teardown_setup(false);
        for n in 0..TEARDOWN_ADDRESSES {
            detector.read(&observer, 0x508, TEARDOWN_BASE + n * 8, 8);
        }
        finish_writer_while_observing(&detector, observer);

        // Reads race until the writer is retired. Whatever was delivered names
        // the writer, never a placeholder id.
        let races = races.lock().unwrap();
        println!("Races reported: {}", races.len());
        assert!(!races.is_empty());
        assert!(races.iter().all(|race| race.prior.thread_id == 2));
        assert!(races.iter().all(|race| race.current.thread_id == 3));
        detector.finalize();
    }
}
