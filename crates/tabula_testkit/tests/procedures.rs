//! Procedure scenarios: atomicity, isolation, lock ordering, redo and the
//! watchdog.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tabula_core::{procedure_fn, Completion, Config, CoreError, Outcome, TableOptions};
use tabula_testkit::{memory_db, scenarios, stress_lock_order, test_config, Account, StressConfig, TestDatabase};

fn balance(account: &mut Account) -> &mut i64 {
    &mut account.balance
}

#[test]
fn failed_procedure_leaves_tables_untouched() {
    let db = memory_db();
    let accounts = scenarios::accounts(&db);
    let names = db.open_table::<String, u64>(2, "names").unwrap();
    scenarios::seed_accounts(&db, &accounts, 2, 100);
    let dirty_before = db.dirty_count();

    let result = db.execute(procedure_fn("half_done", |ctx| {
        ctx.lock3(
            accounts.lock_id(&0),
            accounts.lock_id(&1),
            names.lock_id(&"ada".to_string()),
        )?;
        let from = accounts.get_for_update(ctx, &0)?.unwrap();
        from.set(ctx, balance, 0)?;
        accounts.remove(ctx, &1)?;
        names.put(ctx, "ada".to_string(), 7)?;
        Err(CoreError::procedure_failed("halfway"))
    }));

    assert!(result.is_err());
    assert_eq!(accounts.get_no_lock(&0).unwrap().unwrap().balance, 100);
    assert_eq!(accounts.get_no_lock(&1).unwrap().unwrap().balance, 100);
    assert_eq!(names.get_no_lock(&"ada".to_string()).unwrap(), None);
    assert_eq!(db.dirty_count(), dirty_before);
}

#[test]
fn rolled_back_change_keeps_committed_value() {
    let db = memory_db();
    let table = db.open_table::<u64, String>(3, "letters").unwrap();

    db.execute(procedure_fn("p1", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        table.put(ctx, 1, "a".to_string())?;
        Ok(Outcome::Done)
    }))
    .unwrap();

    let result = db.execute(procedure_fn("p3", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        let record = table.get_for_update(ctx, &1)?.unwrap();
        record.assign(ctx, "b".to_string())?;
        assert_eq!(record.get(ctx)?, "b");
        Err(CoreError::procedure_failed("changed my mind"))
    }));
    assert!(result.is_err());

    let value = db
        .execute(procedure_fn("reader", |ctx| {
            ctx.lock(table.lock_id(&1))?;
            assert_eq!(table.get(ctx, &1)?.as_deref(), Some("a"));
            Ok(Outcome::Done)
        }))
        .unwrap();
    assert!(value.is_committed());
}

#[test]
fn access_without_lock_fails_fast() {
    let db = memory_db();
    let table = db.open_table::<u64, String>(3, "letters").unwrap();
    let attempts = AtomicUsize::new(0);
    let result = db.execute(procedure_fn("sloppy", |ctx| {
        attempts.fetch_add(1, Ordering::SeqCst);
        table.put(ctx, 1, "x".to_string())?;
        Ok(Outcome::Done)
    }));
    assert!(matches!(result, Err(CoreError::IllegalUnlockedAccess { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn redo_fails_after_exactly_max_redo_attempts() {
    let db = TestDatabase::memory_with(test_config().max_redo(5));
    let attempts = AtomicUsize::new(0);
    let result = db.execute(procedure_fn("always_redo", |_ctx| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Redo)
    }));
    assert!(matches!(result, Err(CoreError::RedoExhausted { attempts: 5, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[test]
fn redo_retries_with_a_clean_slate() {
    let db = memory_db();
    let table = db.open_table::<u64, u64>(4, "counter").unwrap();
    let mut attempt = 0;
    let completion = db
        .execute(procedure_fn("retry_once", |ctx| {
            attempt += 1;
            ctx.lock(table.lock_id(&1))?;
            let current = table.get(ctx, &1)?.unwrap_or(0);
            table.put(ctx, 1, current + 1)?;
            Ok(if attempt == 1 { Outcome::Redo } else { Outcome::Done })
        }))
        .unwrap();
    assert_eq!(completion, Completion::Committed { attempts: 2 });
    assert_eq!(table.get_no_lock(&1).unwrap(), Some(1));
}

#[test]
fn overlapping_increments_serialize() {
    let db = memory_db();
    let table = db.open_table::<u64, u64>(4, "counter").unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    db.execute(procedure_fn("increment", |ctx| {
                        ctx.lock(table.lock_id(&0))?;
                        let current = table.get(ctx, &0)?.unwrap_or(0);
                        table.put(ctx, 0, current + 1)?;
                        Ok(Outcome::Done)
                    }))
                    .unwrap();
                }
            });
        }
    });

    assert_eq!(table.get_no_lock(&0).unwrap(), Some(800));
}

#[test]
fn shuffled_lock_sets_never_deadlock() {
    let db = TestDatabase::memory_with(test_config().lock_pool_size(64));
    let counters = db.open_table::<u64, u64>(5, "counters").unwrap();
    let config = StressConfig {
        operations: 200,
        threads: 8,
        record_count: 12,
        locks_per_procedure: 4,
    };

    let result = stress_lock_order(&db, &counters, &config);

    assert_eq!(result.failed_ops, 0);
    assert_eq!(result.successful_ops, 1_600);
    let total: u64 = (0..12).filter_map(|k| counters.get_no_lock(&k).unwrap()).sum();
    assert_eq!(total, 1_600 * 4);
    assert_eq!(db.stats().procedures_interrupted, 0);
}

#[test]
fn lock_all_enforces_limit() {
    let db = TestDatabase::memory_with(test_config().max_locks_per_procedure(4));
    let table = db.open_table::<u64, u64>(6, "wide").unwrap();
    let result = db.execute(procedure_fn("too_wide", |ctx| {
        let ids: Vec<_> = (0..64u64).map(|k| table.lock_id(&k)).collect();
        ctx.lock_all(&ids)?;
        Ok(Outcome::Done)
    }));
    assert!(matches!(result, Err(CoreError::LockLimitExceeded { max: 4, .. })));
}

#[test]
fn auto_ids_are_distinct_and_increasing_per_caller() {
    let db = memory_db();
    let items = db.open_table_by_long::<u64>(7, "items").unwrap();

    let per_thread: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let (db, items) = (&db, &items);
                s.spawn(move || {
                    let mut ids = Vec::with_capacity(125);
                    for n in 0..125u64 {
                        let mut id = 0;
                        db.execute(procedure_fn("insert", |ctx| {
                            id = items.insert(ctx, t * 1_000 + n)?;
                            Ok(Outcome::Done)
                        }))
                        .unwrap();
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for ids in &per_thread {
        assert!(ids.windows(2).all(|w| w[0] <= w[1]));
    }
    let mut all: Vec<u64> = per_thread.into_iter().flatten().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 1_000);
    assert_eq!(items.id_counter(), 1_000);
}

#[test]
fn rolled_back_insert_leaves_a_gap() {
    let db = memory_db();
    let items = db.open_table_by_long::<String>(7, "items").unwrap();

    let mut lost = 0;
    let _ = db.execute(procedure_fn("lost_insert", |ctx| {
        lost = items.insert(ctx, "gone".to_string())?;
        Ok(Outcome::Abort)
    }));
    let mut kept = 0;
    db.execute(procedure_fn("kept_insert", |ctx| {
        kept = items.insert(ctx, "here".to_string())?;
        Ok(Outcome::Done)
    }))
    .unwrap();

    assert!(kept > lost);
    assert_eq!(items.get_no_lock(&lost).unwrap(), None);
    assert_eq!(items.get_no_lock(&kept).unwrap().as_deref(), Some("here"));
}

#[test]
fn watchdog_interrupts_slow_procedure() {
    let mut config = test_config();
    config.procedure_timeout = Duration::from_millis(100);
    config.watchdog_interval = Duration::from_millis(20);
    let db = TestDatabase::memory_with(config);
    let table = db.open_table::<u64, u64>(8, "slow").unwrap();

    let result = db.execute(procedure_fn("sleepy", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        table.put(ctx, 1, 1)?;
        for _ in 0..500 {
            ctx.check_interrupted()?;
            thread::sleep(Duration::from_millis(10));
        }
        Ok(Outcome::Done)
    }));

    assert!(matches!(result, Err(CoreError::Interrupted { .. })));
    assert_eq!(table.get_no_lock(&1).unwrap(), None);
    assert_eq!(db.stats().procedures_interrupted, 1);
}

#[test]
fn uninterruptible_procedure_outlives_timeout() {
    let mut config = test_config();
    config.procedure_timeout = Duration::from_millis(30);
    config.watchdog_interval = Duration::from_millis(10);
    let db = TestDatabase::memory_with(config);

    let completion = db
        .execute(procedure_fn("long_batch", |ctx| {
            ctx.set_uninterruptible();
            thread::sleep(Duration::from_millis(120));
            ctx.check_interrupted()?;
            Ok(Outcome::Done)
        }))
        .unwrap();
    assert!(completion.is_committed());
}

#[test]
fn commit_callbacks_run_after_commit_only() {
    let db = memory_db();
    let committed = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    for outcome in [Outcome::Done, Outcome::Abort] {
        let (c, r) = (Arc::clone(&committed), Arc::clone(&rolled_back));
        db.execute(procedure_fn("callbacks", move |ctx| {
            let c = Arc::clone(&c);
            ctx.on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            let r = Arc::clone(&r);
            ctx.on_rollback(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            Ok(outcome)
        }))
        .unwrap();
    }

    assert_eq!(committed.load(Ordering::SeqCst), 1);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_commit_callback_keeps_the_commit() {
    let db = memory_db();
    let table = db.open_table::<u64, u64>(9, "kept").unwrap();
    let completion = db
        .execute(procedure_fn("noisy", |ctx| {
            ctx.lock(table.lock_id(&1))?;
            table.put(ctx, 1, 42)?;
            ctx.on_commit(|| Err(CoreError::invalid_operation("listener gone")));
            ctx.on_commit(|| panic!("listener exploded"));
            Ok(Outcome::Done)
        }))
        .unwrap();

    assert!(completion.is_committed());
    assert_eq!(table.get_no_lock(&1).unwrap(), Some(42));
    assert_eq!(db.stats().commit_callbacks_failed, 2);
}

#[test]
fn panic_in_procedure_rolls_back() {
    let db = memory_db();
    let table = db.open_table::<u64, u64>(10, "panicky").unwrap();
    let result = db.execute(procedure_fn("boom", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        table.put(ctx, 1, 1)?;
        panic!("bad input");
    }));
    assert!(matches!(result, Err(CoreError::Panicked { .. })));
    assert_eq!(table.get_no_lock(&1).unwrap(), None);
}

#[test]
fn memory_table_drops_evicted_records() {
    let db = memory_db();
    let options = TableOptions::new().cache_capacity(2);
    let table = db.open_memory_table::<u64, u64>(11, "scratch", &options).unwrap();
    for key in 0..3u64 {
        db.execute(procedure_fn("fill", |ctx| {
            ctx.lock(table.lock_id(&key))?;
            table.put(ctx, key, key)?;
            Ok(Outcome::Done)
        }))
        .unwrap();
    }
    assert_eq!(table.cache_len(), 2);
    assert_eq!(table.get_no_lock(&0).unwrap(), None);
    assert_eq!(table.stats().evictions, 1);
    assert_eq!(db.dirty_count(), 0);
}

#[test]
fn session_overflow_drops_queue() {
    let config = Config::default().worker_threads(1).max_session_procedures(4);
    let db = TestDatabase::memory_with(config);
    let gate = Arc::new(parking_lot::Mutex::new(()));
    let held = gate.lock();

    let session = tabula_core::SessionId(1);
    let g = Arc::clone(&gate);
    db.submit_session(
        session,
        procedure_fn("blocker", move |_ctx| {
            drop(g.lock());
            Ok(Outcome::Done)
        }),
    )
    .unwrap();

    let mut overflowed = false;
    for _ in 0..10 {
        if let Err(CoreError::SessionOverflow { .. }) =
            db.submit_session(session, procedure_fn("filler", |_ctx| Ok(Outcome::Done)))
        {
            overflowed = true;
            break;
        }
    }
    drop(held);
    assert!(overflowed);
    assert!(db.scheduler_stats().dropped > 0);
}

#[test]
fn relocking_reloads_records_changed_meanwhile() {
    let db = memory_db();
    let table = db.open_table::<u64, String>(4, "words").unwrap();
    db.execute(procedure_fn("seed", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        table.put(ctx, 1, "old".to_string())?;
        Ok(Outcome::Done)
    }))
    .unwrap();

    let released = Barrier::new(2);
    let changed = Barrier::new(2);
    let mut seen = None;
    thread::scope(|s| {
        let first = s.spawn(|| {
            db.execute(procedure_fn("p1", |ctx| {
                ctx.lock(table.lock_id(&1))?;
                let early = table.get_for_update(ctx, &1)?.unwrap();
                ctx.lock(table.lock_id(&2))?;
                released.wait();
                changed.wait();

                ctx.lock2(table.lock_id(&1), table.lock_id(&2))?;
                assert!(matches!(early.get(ctx), Err(CoreError::StaleRecord { .. })));
                seen = table.get(ctx, &1)?;
                let record = table.get_for_update(ctx, &1)?.unwrap();
                record.update(ctx, |v| v.push_str("+p1"))?;
                Ok(Outcome::Done)
            }))
        });

        released.wait();
        db.execute(procedure_fn("p2", |ctx| {
            ctx.lock(table.lock_id(&1))?;
            table.put(ctx, 1, "new".to_string())?;
            Ok(Outcome::Done)
        }))
        .unwrap();
        changed.wait();

        assert!(first.join().unwrap().unwrap().is_committed());
    });

    assert_eq!(seen.as_deref(), Some("new"));
    assert_eq!(table.get_no_lock(&1).unwrap().as_deref(), Some("new+p1"));
}

#[test]
fn put_over_a_held_record_makes_its_handle_stale() {
    let db = memory_db();
    let table = db.open_table::<u64, String>(4, "words").unwrap();
    db.execute(procedure_fn("seed", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        table.put(ctx, 1, "a".to_string())?;
        Ok(Outcome::Done)
    }))
    .unwrap();

    let result = db.execute(procedure_fn("replace", |ctx| {
        ctx.lock(table.lock_id(&1))?;
        let record = table.get_for_update(ctx, &1)?.unwrap();
        table.put(ctx, 1, "b".to_string())?;
        record.assign(ctx, "c".to_string())?;
        Ok(Outcome::Done)
    }));

    assert!(matches!(result, Err(CoreError::StaleRecord { .. })));
    assert_eq!(table.get_no_lock(&1).unwrap().as_deref(), Some("a"));
}
