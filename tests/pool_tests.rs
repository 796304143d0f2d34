use std::{
    collections::HashSet,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use graph_db_api::{
    AccessMode, ErrorKind, GraphDbError, PoolConfig, ReleaseOutcome, SessionPool,
    backend::ScriptedConnector,
};
use rand::Rng;

fn pool(max_size: usize, acquire_timeout: Duration) -> (ScriptedConnector, SessionPool<ScriptedConnector>) {
    let connector = ScriptedConnector::new();
    let pool = SessionPool::new(
        connector.clone(),
        PoolConfig {
            max_size,
            acquire_timeout,
            ..PoolConfig::default()
        },
    )
    .expect("pool");
    (connector, pool)
}

#[test]
fn test_three_writers_on_pool_of_two() {
    let (_, pool) = pool(2, Duration::from_millis(100));
    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let started = Instant::now();
                let result = pool.acquire(AccessMode::Write, Duration::from_millis(100));
                let elapsed = started.elapsed();
                match result {
                    // Hold the session past the loser's timeout.
                    Ok(session) => {
                        thread::sleep(Duration::from_millis(250));
                        session.release(ReleaseOutcome::Ok);
                        Ok(elapsed)
                    }
                    Err(err) => Err((err, elapsed)),
                }
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert_eq!(failures.len(), 1);
    let (err, waited) = failures[0];
    assert!(matches!(err, GraphDbError::PoolExhausted { max_size: 2, .. }));
    assert!(*waited >= Duration::from_millis(100));
    assert!(*waited < Duration::from_millis(240));
    assert_eq!(pool.stats().exhausted_total, 1);
}

#[test]
fn test_leases_never_exceed_max_under_contention() {
    let (connector, pool) = pool(3, Duration::from_millis(500));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..40 {
                    let mode = if rng.gen_bool(0.5) {
                        AccessMode::Read
                    } else {
                        AccessMode::Write
                    };
                    let Ok(session) = pool.acquire(mode, Duration::from_millis(500)) else {
                        continue;
                    };
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(pool.stats().leased <= 3);
                    thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let outcome = if rng.gen_bool(0.2) {
                        ReleaseOutcome::Error
                    } else {
                        ReleaseOutcome::Ok
                    };
                    session.release(outcome);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.opening, 0);
    assert!(stats.idle <= 3);
    let counts = connector.counts();
    assert_eq!(counts.connects - counts.closes, stats.idle);
}

#[test]
fn test_error_released_connection_is_never_reused() {
    let (connector, pool) = pool(2, Duration::from_millis(50));
    let mut retired = HashSet::new();
    for _ in 0..5 {
        let mut session = pool.acquire(AccessMode::Write, Duration::from_millis(50)).unwrap();
        let id = session.connection().id();
        assert!(!retired.contains(&id), "connection {id} handed out after error release");
        retired.insert(id);
        session.release(ReleaseOutcome::Error);
    }
    assert_eq!(connector.counts().connects, 5);
    assert_eq!(pool.stats().discarded_total, 5);
}

#[test]
fn test_waiter_wakes_on_release() {
    let (_, pool) = pool(1, Duration::from_secs(2));
    let held = pool.acquire(AccessMode::Read, Duration::from_millis(10)).unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let session = pool.acquire(AccessMode::Read, Duration::from_secs(2)).unwrap();
            session.release(ReleaseOutcome::Ok);
            started.elapsed()
        })
    };
    thread::sleep(Duration::from_millis(50));
    held.release(ReleaseOutcome::Ok);
    let waited = waiter.join().unwrap();
    assert!(waited < Duration::from_secs(1));
}

#[test]
fn test_close_wakes_waiters() {
    let (_, pool) = pool(1, Duration::from_secs(5));
    let held = pool.acquire(AccessMode::Write, Duration::from_millis(10)).unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire(AccessMode::Write, Duration::from_secs(5)).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));
    pool.close();
    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);
    held.release(ReleaseOutcome::Ok);
    assert_eq!(pool.stats().idle, 0);
}
