//! Exercises the end-to-end lifecycle scenarios against the public API only,
//! the way a caller embedding the engine would: build a driver, `add` it,
//! advance the clock, `run` ticks, and observe group membership.

use std::sync::Arc;

use chrono::Utc;
use defdel::mock::{MockDriver, MockRegistry, Script};
use defdel::{DeferredStorage, DeletionEngine, DriverError, EngineConfig, Group, MemoryDeferredStorage, ServiceDriver};
use defer_ids::{TestClock, VmId};

fn harness() -> (DeletionEngine, Arc<MemoryDeferredStorage>, Arc<MockRegistry>, Arc<TestClock>, EngineConfig) {
    let clock = Arc::new(TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryDeferredStorage::new());
    let registry = Arc::new(MockRegistry::new());
    let config = EngineConfig::default();
    let engine = DeletionEngine::new(storage.clone(), registry.clone(), clock.clone(), config.clone());
    (engine, storage, registry, clock, config)
}

#[tokio::test]
async fn stop_then_delete_happy_path() {
    let (engine, storage, registry, clock, config) = harness();

    let mut driver = MockDriver::new("svc-stop", "vmware-like").must_stop(true).soft_shutdown(true);
    driver.is_running = Script::sequence(vec![Ok(true), Ok(true), Ok(false)]);
    let driver = Arc::new(driver);
    registry.insert(driver.clone());

    engine.add(driver.clone(), VmId::from("vm-stop"), false).await.unwrap();
    assert_eq!(storage.snapshot(Group::Stopping).await.unwrap().len(), 1, "eager add() lands in STOPPING");

    // Tick: is_running -> true, retries (1) <= RETRIES_TO_RETRY, soft shutdown reissued, stays in STOPPING.
    clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
    engine.run().await.unwrap();
    assert_eq!(storage.snapshot(Group::Stopping).await.unwrap().len(), 1);
    assert_eq!(storage.snapshot(Group::ToDelete).await.unwrap().len(), 0);

    // Tick: is_running -> false -> TO_DELETE.
    clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
    engine.run().await.unwrap();
    assert_eq!(storage.snapshot(Group::Stopping).await.unwrap().len(), 0);
    assert_eq!(storage.snapshot(Group::ToDelete).await.unwrap().len(), 1);

    // Tick: (is_running re-checked since must_stop_before_deletion, now false) execute_delete succeeds -> DELETING.
    clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
    engine.run().await.unwrap();
    assert_eq!(storage.snapshot(Group::ToDelete).await.unwrap().len(), 0);
    assert_eq!(storage.snapshot(Group::Deleting).await.unwrap().len(), 1);

    // Tick: is_deleted -> true -> dropped.
    clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
    engine.run().await.unwrap();
    assert!(storage.snapshot(Group::Deleting).await.unwrap().is_empty());
    assert!(storage.snapshot(Group::ToStop).await.unwrap().is_empty());
    assert!(storage.snapshot(Group::Stopping).await.unwrap().is_empty());
    assert!(storage.snapshot(Group::ToDelete).await.unwrap().is_empty());
}

#[tokio::test]
async fn stuck_shutdown_escalates_to_force_stop() {
    let (engine, storage, registry, clock, config) = harness();

    // Always running: STOPPING never sees is_running=false.
    let mut driver = MockDriver::new("svc-stuck", "stubborn").must_stop(true).soft_shutdown(true);
    driver.is_running = Script::Fixed(Ok(true));
    let driver = Arc::new(driver);
    registry.insert(driver.clone());

    engine.add(driver.clone(), VmId::from("vm-stuck"), true).await.unwrap();
    assert_eq!(storage.snapshot(Group::ToStop).await.unwrap().len(), 1);

    // First visit to TO_STOP: retries (0) < RETRIES_TO_RETRY, issues shutdown, lands in STOPPING.
    engine.run().await.unwrap();
    assert_eq!(storage.snapshot(Group::Stopping).await.unwrap().len(), 1);

    // Cycle through STOPPING until escalated back to TO_STOP.
    for _ in 0..=config.retries_to_retry {
        clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
        engine.run().await.unwrap();
    }

    let escalated = storage.snapshot(Group::ToStop).await.unwrap();
    assert_eq!(
        escalated.len(),
        1,
        "after exceeding RETRIES_TO_RETRY polls in STOPPING the item escalates back to TO_STOP"
    );
    assert!(
        escalated[0].next_check >= clock.now() + chrono::Duration::seconds(config.check_interval_secs as i64),
        "escalating back to TO_STOP must still advance next_check by at least CHECK_INTERVAL, not leave it due immediately"
    );

    let before = driver.call_count("stop");
    // Next visit to TO_STOP: retries >= RETRIES_TO_RETRY there too, forces a hard stop.
    clock.advance(chrono::Duration::seconds(config.check_interval_secs as i64 + 1));
    engine.run().await.unwrap();
    assert!(driver.call_count("stop") > before, "escalation issues a direct stop() call");
    assert_eq!(storage.snapshot(Group::Stopping).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fatal_error_lengthens_next_check_and_bumps_fatal_retries() {
    let (engine, storage, registry, clock, config) = harness();

    let mut driver = MockDriver::new("svc-fatal", "broken").must_stop(false);
    driver.execute_delete = Script::Fixed(Err(DriverError::fatal("auth rejected")));
    let driver = Arc::new(driver);
    registry.insert(driver.clone());

    engine.add(driver.clone(), VmId::from("vm-fatal"), true).await.unwrap();

    let before_tick = clock.now();
    engine.run().await.unwrap();

    let items = storage.snapshot(Group::ToDelete).await.unwrap();
    assert_eq!(items.len(), 1, "fatal error keeps the item in TO_DELETE, the group it failed in");
    let info = &items[0];
    assert_eq!(info.fatal_retries, 1);
    assert_eq!(info.total_retries, 1);

    let expected_backoff =
        config.check_interval().as_millis() as i64 * i64::from(config.fatal_error_interval_multiplier);
    let actual_backoff = (info.next_check - before_tick).num_milliseconds();
    assert!(
        actual_backoff >= expected_backoff,
        "next_check should reflect at least CHECK_INTERVAL * FATAL_ERROR_INTERVAL_MULTIPLIER: got {actual_backoff}ms, wanted >= {expected_backoff}ms"
    );
}

#[tokio::test]
async fn adding_the_same_vm_twice_deferred_leaves_one_entry() {
    let (engine, storage, registry, _clock, _config) = harness();

    let driver = Arc::new(MockDriver::new("svc-dup", "test").must_stop(false));
    registry.insert(driver.clone());

    engine.add(driver.clone(), VmId::from("vm-dup"), true).await.unwrap();
    engine.add(driver.clone(), VmId::from("vm-dup"), true).await.unwrap();

    assert_eq!(storage.snapshot(Group::ToDelete).await.unwrap().len(), 1);
}
