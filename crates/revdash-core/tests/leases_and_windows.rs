//! Leases shared by several store handles, and the issue poller working
//! through a feed that keeps overflowing its page.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Harness, at, issue};
use revdash_core::clock::ManualClock;
use revdash_core::jobs::cron::{CronRun, last_run_key};
use revdash_core::lease;
use revdash_core::store::{DataKinds, Store};
use revdash_core::tracker::{ISSUE_COUNT_KEY, ISSUE_MTIME_KEY, LOAD_JOB};

fn open(path: &std::path::Path, clock: &Arc<ManualClock>) -> anyhow::Result<Store> {
    Store::open(path, Arc::new(DataKinds::default()), clock.clone())
}

#[test]
fn one_of_many_handles_wins_a_lease() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("revdash.sqlite3");
    let clock = Arc::new(ManualClock::new(at(0)));
    let stores = (0..6)
        .map(|_| open(&path, &clock))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let barrier = Barrier::new(stores.len());
    let won = AtomicUsize::new(0);
    thread::scope(|s| {
        for store in stores {
            let barrier = &barrier;
            let won = &won;
            s.spawn(move || {
                barrier.wait();
                if lease::acquire(&store, "app.update", Duration::from_secs(900)) {
                    won.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    assert_eq!(won.load(Ordering::SeqCst), 1);

    let other = open(&path, &clock)?;
    assert_eq!(lease::held_until(&other, "app.update")?, Some(at(900)));
    assert!(!lease::acquire(&other, "app.update", Duration::from_secs(900)));

    // A crashed holder never releases; expiry frees the name.
    clock.advance(chrono::Duration::seconds(901));
    assert_eq!(lease::held_until(&other, "app.update")?, None);
    assert!(lease::acquire(&other, "app.update", Duration::from_secs(900)));
    lease::release(&other, "app.update");
    assert!(lease::acquire(&open(&path, &clock)?, "app.update", Duration::from_secs(60)));
    Ok(())
}

#[test]
fn crowded_feed_is_read_in_narrowed_windows() {
    let h = Harness::new();
    for i in 0..25 {
        h.tracker
            .add_issue(issue(100 + i, &format!("pkg{i}: broken"), at(-3000 + i * 100), &[]));
    }
    let loaded = |h: &Harness| {
        h.store()
            .read_meta::<i64>(ISSUE_COUNT_KEY)
            .expect("meta")
            .unwrap_or(0)
    };

    h.round();
    assert!(loaded(&h) < 25, "first pass should stop at a narrowed window");
    for _ in 0..20 {
        if loaded(&h) == 25 {
            break;
        }
        h.advance_minutes(1);
        h.round();
    }
    assert_eq!(loaded(&h), 25);

    let windows = h.tracker.windows();
    assert!(
        windows.windows(2).any(|w| w[0].0 == w[1].0 && w[1].1 < w[0].1),
        "some window should have been narrowed: {windows:?}"
    );
    assert!(windows.iter().all(|(start, end)| start < end));
    assert!(
        windows.windows(2).all(|w| w[0].0 <= w[1].0),
        "checkpoint went backwards: {windows:?}"
    );
}

#[test]
fn feed_stuck_on_one_instant_gives_up() {
    let h = Harness::new();
    for i in 0..12 {
        h.tracker
            .add_issue(issue(200 + i, "cmd/go: flood", at(-1800), &[]));
    }

    let outcome = |h: &Harness| {
        h.store()
            .read_meta::<CronRun>(&last_run_key(LOAD_JOB))
            .expect("meta")
            .map(|run| run.outcome)
            .unwrap_or_default()
    };

    h.round();
    for _ in 0..60 {
        if outcome(&h).starts_with("failed") {
            break;
        }
        h.advance_minutes(1);
        h.round();
    }
    assert!(outcome(&h).starts_with("failed"), "{}", outcome(&h));
    assert_eq!(h.store().read_meta::<i64>(ISSUE_COUNT_KEY).expect("meta"), None);
    let checkpoint: DateTime<Utc> = h
        .store()
        .read_meta(ISSUE_MTIME_KEY)
        .expect("meta")
        .expect("checkpoint written while narrowing");
    assert!(checkpoint <= at(-1800));
}
