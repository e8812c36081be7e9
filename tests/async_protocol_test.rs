//! Staged acquisition protocol: ordering, cancellation, failure reporting and
//! multi-instrument sweeps.

use instrument_core::acquisition::{read_all, AsyncLevel, AsyncStage};
use instrument_core::device::{DeviceBuilder, FnBackend, OptionValues, ScpiBackend};
use instrument_core::instrument::{Instrument, ScriptedHooks};
use instrument_core::transport::MockTransport;
use instrument_core::wait::Interrupt;
use instrument_core::{DaqError, Device, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Bench {
    instr: Arc<Instrument>,
    hooks: Arc<ScriptedHooks>,
    mock: Arc<MockTransport>,
}

fn bench(name: &str) -> Bench {
    let mock = Arc::new(MockTransport::new());
    let hooks = Arc::new(ScriptedHooks::new().with_polls(2));
    let instr = Instrument::builder(name, Arc::clone(&mock))
        .hooks(hooks.clone())
        .interrupt(&Interrupt::new())
        .build()
        .unwrap();
    Bench { instr, hooks, mock }
}

fn triggered(bench: &Bench, name: &str, query: &str, reply: &str) -> Arc<Device> {
    bench.mock.set_reply(query, reply);
    bench
        .instr
        .add_device(DeviceBuilder::new(name).backend(ScpiBackend::query(query)).trig())
        .unwrap()
}

fn stage(dev: &Arc<Device>, stage: AsyncStage) -> Result<Option<Value>, DaqError> {
    dev.get_async(stage, &OptionValues::new())
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn results_are_collected_in_registration_order() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.5");
    let c = triggered(&b, "c", "FETCH2?", "2.5");

    assert_eq!(stage(&a, AsyncStage::Register).unwrap(), None);
    assert_eq!(stage(&c, AsyncStage::Register).unwrap(), None);
    assert_eq!(b.instr.async_level(), AsyncLevel::Registering);
    stage(&a, AsyncStage::Start).unwrap();
    stage(&a, AsyncStage::Start).unwrap();
    stage(&a, AsyncStage::Wait).unwrap();
    stage(&c, AsyncStage::Wait).unwrap();
    assert_eq!(b.instr.async_level(), AsyncLevel::Waited);

    assert_eq!(stage(&a, AsyncStage::Collect).unwrap(), Some(Value::Float(1.5)));
    assert_eq!(b.instr.async_level(), AsyncLevel::Waited);
    assert_eq!(stage(&c, AsyncStage::Collect).unwrap(), Some(Value::Float(2.5)));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);

    assert_eq!(b.hooks.triggers(), 1);
    assert_eq!(b.hooks.cleanups(), 1);
    assert_eq!(b.hooks.selected(), vec!["a", "c"]);
    assert_eq!(c.getcache_local().unwrap(), Some(Value::Float(2.5)));
}

#[test]
fn results_follow_registration_even_when_the_second_is_ready_first() {
    let b = bench("dmm");
    let slow = b
        .instr
        .add_device(
            DeviceBuilder::new("slow")
                .backend(FnBackend::new().getter(|_, _| {
                    thread::sleep(Duration::from_millis(40));
                    Ok(Value::Float(1.0))
                }))
                .trig(),
        )
        .unwrap();
    let fast = b
        .instr
        .add_device(
            DeviceBuilder::new("fast")
                .backend(FnBackend::new().getter(|_, _| Ok(Value::Float(2.0))))
                .trig(),
        )
        .unwrap();

    stage(&slow, AsyncStage::Register).unwrap();
    stage(&fast, AsyncStage::Register).unwrap();
    stage(&slow, AsyncStage::Start).unwrap();
    stage(&slow, AsyncStage::Wait).unwrap();
    assert_eq!(stage(&slow, AsyncStage::Collect).unwrap(), Some(Value::Float(1.0)));
    assert_eq!(stage(&fast, AsyncStage::Collect).unwrap(), Some(Value::Float(2.0)));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
}

#[test]
fn concurrent_direct_gets_queue_behind_each_other() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.0");
    let c = triggered(&b, "c", "FETCH2?", "2.0");

    let reader = |dev: Arc<Device>, expected: f64| {
        thread::spawn(move || {
            for _ in 0..20 {
                assert_eq!(dev.get().unwrap(), Value::Float(expected));
            }
        })
    };
    let first = reader(Arc::clone(&a), 1.0);
    let second = reader(Arc::clone(&c), 2.0);
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(b.hooks.triggers(), 40);
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
}

#[test]
fn a_queued_reader_does_not_reset_the_running_cycle() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.0");
    let c = triggered(&b, "c", "FETCH2?", "2.0");
    b.hooks.hold();
    stage(&a, AsyncStage::Register).unwrap();
    stage(&a, AsyncStage::Start).unwrap();
    wait_until(|| b.hooks.detects() > 0);

    let queued = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.get())
    };
    thread::sleep(Duration::from_millis(30));
    assert_eq!(b.instr.async_level(), AsyncLevel::Started);

    b.hooks.release();
    stage(&a, AsyncStage::Wait).unwrap();
    assert_eq!(stage(&a, AsyncStage::Collect).unwrap(), Some(Value::Float(1.0)));
    assert_eq!(queued.join().unwrap().unwrap(), Value::Float(2.0));
}

#[test]
fn waiting_before_start_is_a_protocol_error() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    stage(&a, AsyncStage::Register).unwrap();

    let err = stage(&a, AsyncStage::Wait).unwrap_err();
    assert!(matches!(err, DaqError::ProtocolOrder { requested: 2, level: 0 }));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
    assert_eq!(b.hooks.triggers(), 0);

    // A fresh cycle works after the reset.
    assert_eq!(a.get().unwrap(), Value::Float(1.0));
}

#[test]
fn collect_before_wait_and_wait_after_collect_are_rejected() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.0");
    let c = triggered(&b, "c", "FETCH2?", "2.0");

    for dev in [&a, &c] {
        stage(dev, AsyncStage::Register).unwrap();
    }
    stage(&a, AsyncStage::Start).unwrap();
    assert!(matches!(
        stage(&a, AsyncStage::Collect),
        Err(DaqError::ProtocolOrder { requested: 3, level: 1 })
    ));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);

    for dev in [&a, &c] {
        stage(dev, AsyncStage::Register).unwrap();
    }
    stage(&a, AsyncStage::Start).unwrap();
    stage(&a, AsyncStage::Wait).unwrap();
    stage(&a, AsyncStage::Collect).unwrap();
    assert!(matches!(
        stage(&c, AsyncStage::Wait),
        Err(DaqError::ProtocolOrder { requested: 2, level: 2 })
    ));
    assert!(matches!(
        stage(&a, AsyncStage::Register),
        Ok(None)
    ));
    b.instr.async_reset();
}

#[test]
fn collecting_out_of_order_is_a_violation() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.0");
    let c = triggered(&b, "c", "FETCH2?", "2.0");
    for dev in [&a, &c] {
        stage(dev, AsyncStage::Register).unwrap();
    }
    stage(&a, AsyncStage::Start).unwrap();
    stage(&a, AsyncStage::Wait).unwrap();

    let err = stage(&c, AsyncStage::Collect).unwrap_err();
    assert!(matches!(err, DaqError::ProtocolOrder { requested: 3, level: 2 }));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
}

#[test]
fn registering_a_foreign_device_is_rejected() {
    let b1 = bench("dmm");
    let b2 = bench("scope");
    let a = triggered(&b1, "a", "FETCH?", "1.0");
    let err = b2
        .instr
        .get_async(AsyncStage::Register, &a, &OptionValues::new())
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidArgument(_)));
}

#[test]
fn direct_get_refuses_to_interleave_with_a_cycle() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH1?", "1.0");
    let c = triggered(&b, "c", "FETCH2?", "2.0");
    stage(&a, AsyncStage::Register).unwrap();

    let err = c.get().unwrap_err();
    assert!(matches!(err, DaqError::ProtocolOrder { requested: 0, level: 0 }));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
    assert_eq!(c.get().unwrap(), Value::Float(2.0));
}

#[test]
fn reset_cancels_a_running_worker_and_runs_cleanup() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    b.hooks.hold();
    stage(&a, AsyncStage::Register).unwrap();
    stage(&a, AsyncStage::Start).unwrap();
    wait_until(|| b.hooks.detects() > 0);

    b.instr.async_reset();
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
    wait_until(|| b.hooks.cleanups() == 1);
    assert_eq!(b.mock.query_count("FETCH?"), 0);

    b.hooks.release();
    assert_eq!(a.get().unwrap(), Value::Float(1.0));
    assert_eq!(b.hooks.triggers(), 2);
}

#[test]
fn reset_while_another_thread_waits_fails_that_wait() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    b.hooks.hold();
    stage(&a, AsyncStage::Register).unwrap();
    stage(&a, AsyncStage::Start).unwrap();

    let resetter = {
        let instr = Arc::clone(&b.instr);
        let hooks = Arc::clone(&b.hooks);
        thread::spawn(move || {
            wait_until(|| hooks.detects() > 0);
            thread::sleep(Duration::from_millis(50));
            instr.async_reset();
        })
    };

    let err = stage(&a, AsyncStage::Wait).unwrap_err();
    resetter.join().unwrap();
    assert!(matches!(err, DaqError::AsyncFailed(_)));
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
}

#[test]
fn worker_failure_surfaces_at_wait() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    b.hooks.fail_next_trigger("trigger refused");
    stage(&a, AsyncStage::Register).unwrap();
    stage(&a, AsyncStage::Start).unwrap();

    match stage(&a, AsyncStage::Wait) {
        Err(DaqError::AsyncFailed(message)) => assert!(message.contains("trigger refused")),
        other => panic!("expected AsyncFailed, got {other:?}"),
    }
    assert_eq!(b.instr.async_level(), AsyncLevel::Idle);
    assert_eq!(b.hooks.cleanups(), 1);
    assert_eq!(b.mock.query_count("FETCH?"), 0);
}

#[test]
fn wait_releases_the_callers_lock() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "4.0");
    let _guard = b.instr.lock().unwrap();
    stage(&a, AsyncStage::Register).unwrap();
    stage(&a, AsyncStage::Start).unwrap();
    stage(&a, AsyncStage::Wait).unwrap();
    assert!(b.instr.lock_is_owned());
    assert_eq!(stage(&a, AsyncStage::Collect).unwrap(), Some(Value::Float(4.0)));
}

#[test]
fn async_delay_postpones_the_trigger() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    b.instr.device("async_delay").unwrap().set(0.05).unwrap();

    let start = Instant::now();
    assert_eq!(a.get().unwrap(), Value::Float(1.0));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn checking_mode_skips_the_trigger() {
    let b = bench("dmm");
    let a = triggered(&b, "a", "FETCH?", "1.0");
    a.setcache(Some(Value::Float(9.0))).unwrap();
    let _checking = b.instr.checking_scope(true);
    assert_eq!(a.get().unwrap(), Value::Float(9.0));
    assert_eq!(read_all(&[(a, OptionValues::new())]).unwrap(), vec![Value::Float(9.0)]);
    assert_eq!(b.hooks.triggers(), 0);
    assert!(b.mock.writes().is_empty());
}

#[test]
fn read_all_overlaps_instruments_and_keeps_request_order() {
    let dmm = bench("dmm");
    let scope = bench("scope");
    let v1 = triggered(&dmm, "v1", "FETCH1?", "1.0");
    let v2 = triggered(&dmm, "v2", "FETCH2?", "2.0");
    let trace = triggered(&scope, "peak", "PEAK?", "3.0");
    dmm.mock.set_reply("TEMP?", "25.0");
    let temp = dmm
        .instr
        .add_device(DeviceBuilder::new("temp").backend(ScpiBackend::query("TEMP?")))
        .unwrap();

    let values = read_all(&[
        (Arc::clone(&v2), OptionValues::new()),
        (Arc::clone(&trace), OptionValues::new()),
        (Arc::clone(&temp), OptionValues::new()),
        (Arc::clone(&v1), OptionValues::new()),
    ])
    .unwrap();
    assert_eq!(
        values,
        vec![Value::Float(2.0), Value::Float(3.0), Value::Float(25.0), Value::Float(1.0)]
    );
    assert_eq!(dmm.hooks.triggers(), 1);
    assert_eq!(scope.hooks.triggers(), 1);
    assert_eq!(dmm.hooks.selected(), vec!["v2", "v1"]);
    assert_eq!(dmm.instr.async_level(), AsyncLevel::Idle);
    assert_eq!(scope.instr.async_level(), AsyncLevel::Idle);
}

#[test]
fn read_all_resets_every_instrument_on_failure() {
    let dmm = bench("dmm");
    let scope = bench("scope");
    let v = triggered(&dmm, "v", "FETCH?", "1.0");
    let peak = triggered(&scope, "peak", "PEAK?", "3.0");
    scope.hooks.fail_next_trigger("scope not armed");

    let err = read_all(&[(v, OptionValues::new()), (peak, OptionValues::new())]).unwrap_err();
    assert!(matches!(err, DaqError::AsyncFailed(_)));
    assert_eq!(dmm.instr.async_level(), AsyncLevel::Idle);
    assert_eq!(scope.instr.async_level(), AsyncLevel::Idle);
}
