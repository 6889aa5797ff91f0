//! Plan store behaviour across threads.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use storyloop::error::StoreError;
use storyloop::io::plan_store::FilePlanStore;
use storyloop::test_support::{plan_with, story};

fn store_in(dir: &tempfile::TempDir, timeout: Duration) -> FilePlanStore {
    FilePlanStore::new(dir.path().join("plan.json"), timeout)
        .with_retry_interval(Duration::from_millis(5))
}

#[test]
fn readers_never_observe_a_partial_document() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp, Duration::from_secs(10));
    let stories = (1..=40)
        .map(|n| story(&format!("s{n}"), n, false))
        .collect();
    let mut seed = plan_with(stories);
    store.save_blocking(&mut seed).expect("seed");

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = store.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) {
                let plan = store.load_blocking().expect("every read parses");
                assert_eq!(plan.stories.len(), 40);
                reads += 1;
            }
            reads
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let mut plan = seed.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    store.save_blocking(&mut plan).expect("save");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }
    done.store(true, Ordering::SeqCst);
    let reads = reader.join().expect("reader");

    assert!(reads > 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn waiting_writer_proceeds_once_the_lock_is_released() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp, Duration::from_secs(5));
    let holder = File::create(store.lock_path()).expect("lock file");
    holder.lock().expect("hold lock");

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        holder.unlock().expect("unlock");
    });

    let started = Instant::now();
    let mut plan = plan_with(vec![story("s1", 1, false)]);
    store.save_blocking(&mut plan).expect("save after release");
    releaser.join().expect("releaser");

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(plan.version, 1);
}

#[test]
fn timeout_reports_the_lock_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp, Duration::from_millis(60));
    let holder = File::create(store.lock_path()).expect("lock file");
    holder.lock().expect("hold lock");

    let mut plan = plan_with(vec![story("s1", 1, false)]);
    let err = store.save_blocking(&mut plan).expect_err("timed out");
    let StoreError::LockTimeout { path, waited } = err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(path, store.lock_path());
    assert!(waited >= Duration::from_millis(60));
    assert_eq!(plan.version, 0, "failed save leaves the version alone");
    assert!(!store.path().exists());
}

#[test]
fn writer_waiting_on_an_unlinked_lock_file_does_not_bypass_the_new_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp, Duration::from_secs(5));
    let old = File::create(store.lock_path()).expect("old lock file");
    old.lock().expect("hold old lock");

    let released = Arc::new(AtomicBool::new(false));
    let writer = {
        let store = store.clone();
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let mut plan = plan_with(vec![story("s1", 1, false)]);
            store.save_blocking(&mut plan).expect("save");
            released.load(Ordering::SeqCst)
        })
    };
    thread::sleep(Duration::from_millis(50));

    // The sidecar is swapped for a fresh, already-held file while the old one
    // is still locked, as when a delete races a new writer.
    let staged = temp.path().join("fresh.lock");
    let new = File::create(&staged).expect("new lock file");
    new.lock().expect("hold new lock");
    std::fs::rename(&staged, store.lock_path()).expect("swap lock file");
    drop(old);

    thread::sleep(Duration::from_millis(150));
    released.store(true, Ordering::SeqCst);
    new.unlock().expect("unlock");

    assert!(
        writer.join().expect("writer"),
        "writer must wait for the lock file now at the path"
    );
}

