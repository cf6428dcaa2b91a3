// SPDX-License-Identifier: MIT
//
// Integration tests for NamedMutex: acquisition, contention, multi-wait
// and error surfaces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use filemap::{wait, CreateDisposition, ErrorKind, NamedMutex, WaitOutcome};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    init_logging();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_mtx_{}_{n}", std::process::id())
}

// RUST_LOG=filemap=debug surfaces the crate's trace output per test.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn create_reports_disposition() {
    let name = unique_name("disposition");
    NamedMutex::remove(&name);

    let mut first = NamedMutex::new();
    assert_eq!(
        first.create(&name).expect("create"),
        CreateDisposition::Created
    );
    assert!(first.is_open());

    let mut second = NamedMutex::new();
    assert_eq!(
        second.create(&name).expect("create again"),
        CreateDisposition::AlreadyExisted
    );
}

#[test]
fn open_requires_existing_mutex() {
    let name = unique_name("open_missing");
    NamedMutex::remove(&name);

    let mut m = NamedMutex::new();
    let err = m.open(&name).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OpenFailed);
    assert!(!m.is_open());
}

#[test]
fn uncontended_wait_succeeds_immediately() {
    let name = unique_name("uncontended");
    NamedMutex::remove(&name);

    let mut m = NamedMutex::new();
    m.create(&name).expect("create");

    let outcome = m.wait(0).expect("wait");
    assert_eq!(outcome, WaitOutcome::Signaled(0));
    assert_eq!(outcome.code(), wait::WAIT_OBJECT_0);
    assert!(outcome.acquired());
    m.release().expect("release");
}

#[test]
fn contended_wait_times_out() {
    let name = unique_name("contended");
    NamedMutex::remove(&name);

    let mut owner = NamedMutex::new();
    owner.create(&name).expect("create");
    assert!(owner.wait(0).expect("acquire").acquired());

    // The owning thread holds the mutex for the duration of the probe.
    let (probe_done_tx, probe_done_rx) = mpsc::channel();
    let probe_name = name.clone();
    let probe = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&probe_name).expect("open");
        let outcome = m.wait(50).expect("wait");
        probe_done_tx.send(()).unwrap();
        outcome
    });

    let outcome = probe.join().expect("probe thread");
    probe_done_rx.recv().unwrap();
    assert_eq!(outcome, WaitOutcome::Timeout);
    assert_eq!(outcome.code(), wait::WAIT_TIMEOUT);
    assert!(!outcome.acquired());

    owner.release().expect("release");
}

#[test]
fn wait_blocks_until_owner_releases() {
    let name = unique_name("handoff");
    NamedMutex::remove(&name);

    let mut owner = NamedMutex::new();
    owner.create(&name).expect("create");
    assert!(owner.wait(0).expect("acquire").acquired());

    let (started_tx, started_rx) = mpsc::channel();
    let waiter_name = name.clone();
    let waiter = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&waiter_name).expect("open");
        started_tx.send(()).unwrap();
        let outcome = m.wait(wait::INFINITE).expect("wait");
        m.release().expect("release");
        outcome
    });

    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));
    owner.release().expect("release");

    let outcome = waiter.join().expect("waiter thread");
    assert!(outcome.acquired());
}

#[test]
fn release_without_ownership_fails() {
    let name = unique_name("not_owned");
    NamedMutex::remove(&name);

    let mut m = NamedMutex::new();
    m.create(&name).expect("create");

    let err = m.release().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOwned);
}

#[test]
fn mutual_exclusion_across_threads() {
    let name = unique_name("exclusion");
    NamedMutex::remove(&name);

    let mut seed = NamedMutex::new();
    seed.create(&name).expect("create");

    const THREADS: usize = 4;
    const ROUNDS: usize = 200;
    static SHARED: AtomicUsize = AtomicUsize::new(0);
    SHARED.store(0, Ordering::SeqCst);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let thread_name = name.clone();
        handles.push(thread::spawn(move || {
            let mut m = NamedMutex::new();
            m.open(&thread_name).expect("open");
            for _ in 0..ROUNDS {
                assert!(m.wait(wait::INFINITE).expect("wait").acquired());
                // Non-atomic read-modify-write; only mutual exclusion
                // keeps the final count exact.
                let v = SHARED.load(Ordering::Relaxed);
                thread::yield_now();
                SHARED.store(v + 1, Ordering::Relaxed);
                m.release().expect("release");
            }
        }));
    }
    for h in handles {
        h.join().expect("worker thread");
    }

    assert_eq!(SHARED.load(Ordering::SeqCst), THREADS * ROUNDS);
}

#[test]
fn wait_multiple_any_picks_available_member() {
    let name_a = unique_name("multi_any_a");
    let name_b = unique_name("multi_any_b");
    NamedMutex::remove(&name_a);
    NamedMutex::remove(&name_b);

    let mut a = NamedMutex::new();
    a.create(&name_a).expect("create a");
    let mut b = NamedMutex::new();
    b.create(&name_b).expect("create b");

    // Hold `a` on another thread so only `b` is available.
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    let (held_tx, held_rx) = mpsc::channel();
    let holder_name = name_a.clone();
    let holder = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&holder_name).expect("open");
        assert!(m.wait(0).expect("acquire").acquired());
        held_tx.send(()).unwrap();
        hold_rx.recv().unwrap();
        m.release().expect("release");
    });
    held_rx.recv().unwrap();

    let outcome = NamedMutex::wait_multiple(&[&a, &b], false, 1000).expect("wait any");
    assert_eq!(outcome, WaitOutcome::Signaled(1));
    assert_eq!(outcome.index(), Some(1));
    b.release().expect("release b");

    hold_tx.send(()).unwrap();
    holder.join().expect("holder thread");
}

#[test]
fn wait_multiple_all_acquires_every_member() {
    let name_a = unique_name("multi_all_a");
    let name_b = unique_name("multi_all_b");
    NamedMutex::remove(&name_a);
    NamedMutex::remove(&name_b);

    let mut a = NamedMutex::new();
    a.create(&name_a).expect("create a");
    let mut b = NamedMutex::new();
    b.create(&name_b).expect("create b");

    let outcome = NamedMutex::wait_multiple(&[&a, &b], true, 1000).expect("wait all");
    assert!(outcome.acquired());

    // Both are now held by this thread; a zero-timeout probe from another
    // thread must fail on each.
    let probe_a = name_a.clone();
    let probe_b = name_b.clone();
    let probe = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&probe_a).expect("open a");
        assert_eq!(m.wait(0).expect("probe a"), WaitOutcome::Timeout);
        let mut m = NamedMutex::new();
        m.open(&probe_b).expect("open b");
        assert_eq!(m.wait(0).expect("probe b"), WaitOutcome::Timeout);
    });
    probe.join().expect("probe thread");

    a.release().expect("release a");
    b.release().expect("release b");
}

#[test]
fn wait_multiple_all_rolls_back_on_timeout() {
    let name_a = unique_name("rollback_a");
    let name_b = unique_name("rollback_b");
    NamedMutex::remove(&name_a);
    NamedMutex::remove(&name_b);

    let mut a = NamedMutex::new();
    a.create(&name_a).expect("create a");
    let mut b = NamedMutex::new();
    b.create(&name_b).expect("create b");

    // Hold `b` elsewhere so the wait-all cannot complete.
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    let (held_tx, held_rx) = mpsc::channel();
    let holder_name = name_b.clone();
    let holder = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&holder_name).expect("open");
        assert!(m.wait(0).expect("acquire").acquired());
        held_tx.send(()).unwrap();
        hold_rx.recv().unwrap();
        m.release().expect("release");
    });
    held_rx.recv().unwrap();

    let outcome = NamedMutex::wait_multiple(&[&a, &b], true, 50).expect("wait all");
    assert_eq!(outcome, WaitOutcome::Timeout);

    // A timed-out wait-all must not leave `a` held.
    let probe_name = name_a.clone();
    let probe = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&probe_name).expect("open");
        let outcome = m.wait(0).expect("probe");
        if outcome.acquired() {
            m.release().expect("release");
        }
        outcome
    });
    assert!(probe.join().expect("probe thread").acquired());

    hold_tx.send(()).unwrap();
    holder.join().expect("holder thread");
}

#[test]
fn wait_multiple_validates_the_set() {
    let name = unique_name("validate_set");
    NamedMutex::remove(&name);

    let mut m = NamedMutex::new();
    m.create(&name).expect("create");

    let empty: [&NamedMutex; 0] = [];
    assert_eq!(
        NamedMutex::wait_multiple(&empty, false, 0).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let too_many: Vec<&NamedMutex> = std::iter::repeat(&m)
        .take(wait::MAX_WAIT_OBJECTS + 1)
        .collect();
    assert_eq!(
        NamedMutex::wait_multiple(&too_many, false, 0).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let unopened = NamedMutex::new();
    assert_eq!(
        NamedMutex::wait_multiple(&[&m, &unopened], false, 0)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidHandle
    );
}

#[test]
fn operations_require_an_open_handle() {
    let mut m = NamedMutex::new();
    assert_eq!(m.wait(0).unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(m.release().unwrap_err().kind(), ErrorKind::InvalidHandle);

    let name = unique_name("closed");
    NamedMutex::remove(&name);
    m.create(&name).expect("create");
    m.close();
    m.close();
    assert!(!m.is_open());
    assert_eq!(m.wait(0).unwrap_err().kind(), ErrorKind::InvalidHandle);
}

#[cfg(target_os = "linux")]
#[test]
fn abandoned_owner_is_reported_once() {
    let name = unique_name("abandoned");
    NamedMutex::remove(&name);

    let mut seed = NamedMutex::new();
    seed.create(&name).expect("create");

    // A thread that acquires and exits without releasing abandons the
    // mutex; the next waiter observes that exactly once.
    let holder_name = name.clone();
    let holder = thread::spawn(move || {
        let mut m = NamedMutex::new();
        m.open(&holder_name).expect("open");
        assert!(m.wait(0).expect("acquire").acquired());
        std::mem::forget(m);
    });
    holder.join().expect("holder thread");

    let outcome = seed.wait(1000).expect("wait");
    assert_eq!(outcome, WaitOutcome::Abandoned(0));
    assert_eq!(outcome.code(), wait::WAIT_ABANDONED_0);
    assert!(outcome.acquired());
    seed.release().expect("release");

    // Ownership was recovered; subsequent acquisitions are ordinary.
    let outcome = seed.wait(0).expect("wait again");
    assert_eq!(outcome, WaitOutcome::Signaled(0));
    seed.release().expect("release again");
}
