// Declare the common module *within this test crate*
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use strand::{ConcurrencyLock, StrandError, ThreadToken};

use common::wait_until;

#[test]
fn test_mutual_exclusion_under_contention() {
    // Test Scenario: 8 threads hammer the lock with random modes and hold times.
    // Expected: no thread ever observes another one inside the critical section.
    let lock = Arc::new(ConcurrencyLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let inside = inside.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();
                for _ in 0..50 {
                    let exclusive = rng.random_bool(0.5);
                    lock.acquire(exclusive).unwrap();
                    assert_eq!(
                        inside.fetch_add(1, Ordering::SeqCst),
                        0,
                        "another thread is inside the lock"
                    );
                    assert!(lock.is_held_by_current_thread());
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(lock.owner().is_none());
    assert_eq!(lock.depth(), 0);
}

#[test]
fn test_reentrant_acquisition() {
    let lock = ConcurrencyLock::new();
    for _ in 0..3 {
        lock.acquire(true).unwrap();
    }
    assert_eq!(lock.depth(), 3);

    lock.release().unwrap();
    lock.release().unwrap();
    assert!(lock.is_held_by_current_thread(), "still owned after 2 of 3 releases");
    assert_eq!(lock.depth(), 1);

    lock.release().unwrap();
    assert!(lock.owner().is_none());
    assert_eq!(lock.depth(), 0);
}

#[test]
fn test_release_all_returns_depth() {
    let lock = ConcurrencyLock::new();
    lock.acquire(false).unwrap();
    lock.acquire(false).unwrap();
    assert_eq!(lock.release_all().unwrap(), 2);
    assert!(lock.owner().is_none());
}

#[test]
fn test_release_by_non_owner_fails() {
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(false).unwrap();

    let other = lock.clone();
    let result = thread::spawn(move || other.release()).join().unwrap();
    assert!(matches!(result, Err(StrandError::NotOwner)));
    assert!(lock.is_held_by_current_thread());
    lock.release().unwrap();

    assert!(matches!(lock.release(), Err(StrandError::NotOwner)));
}

#[test]
fn test_negative_timeout_is_rejected() {
    let lock = ConcurrencyLock::new();
    assert!(matches!(
        lock.try_acquire(-1, false),
        Err(StrandError::InvalidArgument(_))
    ));
    assert!(lock.owner().is_none());
}

#[test]
fn test_try_acquire_times_out() {
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(true).unwrap();

    let contender = lock.clone();
    let (acquired, elapsed, held) = thread::spawn(move || {
        let start = Instant::now();
        let acquired = contender.try_acquire(100, false).unwrap();
        (acquired, start.elapsed(), contender.is_held_by_current_thread())
    })
    .join()
    .unwrap();

    assert!(!acquired);
    assert!(elapsed >= Duration::from_millis(100), "gave up after {:?}", elapsed);
    assert!(!held);
    assert_eq!(lock.depth(), 1);
    lock.release().unwrap();
}

#[test]
fn test_fifo_order_survives_timeouts() {
    // Test Scenario: 4 readers queue one after another while the main thread
    // holds the lock, each retrying in 50ms slices.
    // Expected: they are granted the lock in the order they first queued.
    let lock = Arc::new(ConcurrencyLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    lock.acquire(true).unwrap();

    let mut handles = Vec::new();
    for index in 0..4 {
        let lock_clone = lock.clone();
        let order = order.clone();
        handles.push(thread::spawn(move || {
            while !lock_clone.try_acquire(50, false).unwrap() {}
            order.lock().push(index);
            lock_clone.release().unwrap();
        }));
        assert!(
            wait_until(Duration::from_secs(2), || lock.queue_len() == index + 1),
            "reader {} never queued",
            index
        );
    }

    // Let every reader time out and re-queue a few times.
    thread::sleep(Duration::from_millis(180));
    lock.release().unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn test_yield_without_reader_waiting_returns_false() {
    // Test Scenario: A holds the lock non-exclusively, B waits for exclusive access.
    // Expected: A cannot yield to B; once A releases, B gets the lock.
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(false).unwrap();

    let writer_lock = lock.clone();
    let writer = thread::spawn(move || {
        writer_lock.acquire(true).unwrap();
        let exclusive = writer_lock.is_exclusive_holder();
        writer_lock.release().unwrap();
        exclusive
    });
    assert!(wait_until(Duration::from_secs(2), || lock.exclusive_waiters() == 1));

    assert!(!lock.yield_now().unwrap());
    assert_eq!(lock.yielder_count(), 0);
    lock.release().unwrap();

    assert!(writer.join().unwrap(), "writer should hold the lock exclusively");
}

#[test]
fn test_yield_holds_back_exclusive_waiters() {
    // Test Scenario: A reads and yields; W (writer) queued before R (reader).
    // Expected: R runs first, then A resumes, and W only gets the lock after A releases.
    let lock = Arc::new(ConcurrencyLock::new());
    let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    lock.acquire(false).unwrap();

    let writer = {
        let lock = lock.clone();
        let events = events.clone();
        thread::spawn(move || {
            lock.acquire(true).unwrap();
            events.lock().push("writer");
            lock.release().unwrap();
        })
    };
    assert!(wait_until(Duration::from_secs(2), || lock.queue_len() == 1));

    let reader = {
        let lock = lock.clone();
        let events = events.clone();
        thread::spawn(move || {
            lock.acquire(false).unwrap();
            events.lock().push("reader");
            thread::sleep(Duration::from_millis(20));
            lock.release().unwrap();
        })
    };
    assert!(wait_until(Duration::from_secs(2), || lock.queue_len() == 2));

    assert!(lock.yield_now().unwrap());
    assert_eq!(lock.yielder_count(), 1);
    let depth = lock.release_all().unwrap();
    lock.acquire(false).unwrap();
    events.lock().push("yielder resumed");
    assert_eq!(lock.yielder_count(), 0);
    thread::sleep(Duration::from_millis(20));
    events.lock().push("yielder released");
    assert_eq!(depth, 1);
    lock.release().unwrap();

    reader.join().unwrap();
    writer.join().unwrap();
    assert_eq!(
        *events.lock(),
        vec!["reader", "yielder resumed", "yielder released", "writer"]
    );
}

#[test]
fn test_exclusive_reacquire_while_yielding_is_refused() {
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(false).unwrap();

    let reader_lock = lock.clone();
    let reader = thread::spawn(move || {
        reader_lock.acquire(false).unwrap();
        reader_lock.release().unwrap();
    });
    assert!(wait_until(Duration::from_secs(2), || lock.queue_len() == 1));
    assert!(lock.yield_now().unwrap());

    // Upgrading now would wait on the thread's own hold.
    assert!(matches!(lock.acquire(true), Err(StrandError::Interrupted)));
    assert_eq!(lock.depth(), 1);

    lock.release_all().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_interrupt_aborts_wait() {
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(true).unwrap();

    let (token_tx, token_rx) = crossbeam_channel::bounded(1);
    let waiter_lock = lock.clone();
    let waiter = thread::spawn(move || {
        token_tx.send(ThreadToken::current()).unwrap();
        let result = waiter_lock.acquire(false);
        (result, waiter_lock.is_held_by_current_thread())
    });

    let token = token_rx.recv().unwrap();
    assert!(wait_until(Duration::from_secs(2), || lock.queue_len() == 1));
    token.interrupt();

    let (result, held) = waiter.join().unwrap();
    assert!(matches!(result, Err(StrandError::Interrupted)));
    assert!(!held);

    // The abandoned node must not receive the lock.
    lock.release().unwrap();
    assert!(lock.owner().is_none());
}

#[test]
fn test_pending_interrupt_fails_fast() {
    let lock = ConcurrencyLock::new();
    let me = ThreadToken::current();
    me.interrupt();
    assert!(matches!(lock.try_acquire(10, false), Err(StrandError::Interrupted)));
    assert!(!me.is_interrupted(), "the interrupt is consumed");
    lock.acquire(false).unwrap();
    lock.release().unwrap();
}

#[test]
fn test_yielder_resumes_exclusively_on_free_lock() {
    // Test Scenario: A reads and yields to a queued reader, releases, and the
    // reader finishes. A then resumes asking for exclusive access.
    // Expected: A's own yield does not hold it back; it takes the free lock.
    let lock = Arc::new(ConcurrencyLock::new());
    lock.acquire(false).unwrap();

    let reader_lock = lock.clone();
    let reader = thread::spawn(move || {
        reader_lock.acquire(false).unwrap();
        reader_lock.release().unwrap();
    });
    assert!(wait_until(Duration::from_secs(2), || lock.queue_len() == 1));

    assert!(lock.yield_now().unwrap());
    lock.release_all().unwrap();
    reader.join().unwrap();
    assert!(lock.owner().is_none());
    assert_eq!(lock.yielder_count(), 1);

    assert!(lock.try_acquire(300, true).unwrap());
    assert!(lock.is_exclusive_holder());
    assert_eq!(lock.yielder_count(), 0);
    lock.release().unwrap();
}
