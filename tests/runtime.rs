// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Scheduler behavior and the full runtime-to-engine pipeline.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use vesper::prelude::*;

fn engine() -> Arc<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Engine::new_with(&EngineSettings::default()).unwrap())
}

fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn beat_loop_runs_ten_times_per_second_at_600_bpm() {
    let engine = engine();
    engine.start().unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(600.0));
    runtime.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::<usize>::new()));

    let counter_in_loop = counter.clone();
    let order_in_loop = order.clone();
    runtime.push_code_update(Box::new(move |api: &mut RuntimeApi| {
        let at = api.current_beat();
        api.schedule(
            at,
            Box::new(move |api: &mut RuntimeApi| {
                let i = counter_in_loop.fetch_add(1, Ordering::SeqCst);
                order_in_loop.lock().unwrap().push(i);
                CallbackOutcome::Reschedule(api.current_beat() + MicroBeat::ONE_BEAT)
            }),
        );
        CallbackOutcome::Done
    }));

    // At 600 BPM a beat lasts 100ms: ten iterations fit well within 1.1s
    // plus scheduling slack.
    assert!(wait_for(
        || counter.load(Ordering::SeqCst) >= 10,
        Duration::from_millis(1500)
    ));

    let order = order.lock().unwrap().clone();
    assert_eq!(&order[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn same_beat_callbacks_run_in_insertion_order() {
    let engine = engine();
    engine.start().unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(240.0));
    runtime.start();

    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (a, b, c) = (order.clone(), order.clone(), order.clone());
    runtime.push_code_update(Box::new(move |api: &mut RuntimeApi| {
        // Schedule out of order across two beats; insertion order only
        // breaks ties within a beat.
        let next = api.current_beat() + MicroBeat::ONE_BEAT;
        let later = next + MicroBeat::ONE_BEAT;
        api.schedule(
            later,
            Box::new(move |_: &mut RuntimeApi| {
                c.lock().unwrap().push("later");
                CallbackOutcome::Done
            }),
        );
        api.schedule(
            next,
            Box::new(move |_: &mut RuntimeApi| {
                a.lock().unwrap().push("first");
                CallbackOutcome::Done
            }),
        );
        api.schedule(
            next,
            Box::new(move |_: &mut RuntimeApi| {
                b.lock().unwrap().push("second");
                CallbackOutcome::Done
            }),
        );
        CallbackOutcome::Done
    }));

    assert!(wait_for(
        || order.lock().unwrap().len() == 3,
        Duration::from_millis(2000)
    ));
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["first", "second", "later"]
    );

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn set_bpm_affects_future_beats_only() {
    let engine = engine();
    engine.start().unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));
    runtime.start();

    let seen_bpm = Arc::new(Mutex::new(0.0f64));
    let seen = seen_bpm.clone();
    runtime.push_code_update(Box::new(move |api: &mut RuntimeApi| {
        let beat_before = api.current_beat();
        api.set_bpm(240.0);
        // The beat position is not reset by a tempo change.
        assert_eq!(api.current_beat(), beat_before);
        *seen.lock().unwrap() = api.bpm();
        CallbackOutcome::Done
    }));

    assert!(wait_for(
        || *seen_bpm.lock().unwrap() == 240.0,
        Duration::from_millis(1000)
    ));
    assert_eq!(runtime.bpm(), 240.0);

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn exit_outcome_stops_the_loop_gracefully() {
    let engine = engine();
    engine.start().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exit.wav");
    engine.start_recording(&path).unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));
    runtime.start();

    runtime.push_code_update(Box::new(|_: &mut RuntimeApi| CallbackOutcome::Exit));

    assert!(wait_for(
        || !runtime.is_running(),
        Duration::from_millis(1000)
    ));

    // Shutdown after a graceful exit still works end to end, and the
    // recording is flushed to a valid file.
    runtime.stop();
    engine.stop_recording().unwrap();
    engine.stop().unwrap();
    assert!(hound::WavReader::open(&path).is_ok());
}

#[test]
fn runtime_midi_reaches_a_track_as_sound() {
    let engine = engine();
    let mut pack = SamplePack::default();
    pack.insert(SampleData::new_with(
        "tone",
        vec![0.5; SAMPLE_RATE],
        vec![0.5; SAMPLE_RATE],
    ));
    engine.samples().add_pack("test", pack);

    engine
        .setup_tracks(&[TrackSettings::new_with("sp1", InstrumentKind::Sampler)])
        .unwrap();
    engine.start().unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));
    runtime.start();

    runtime.push_code_update(Box::new(|api: &mut RuntimeApi| {
        api.midi_sysex(
            "sp1",
            SysexKind::SamplerPlay,
            r#"{"pack": "test", "name": "tone"}"#,
        );
        CallbackOutcome::Done
    }));

    // The trigger crosses the runtime, the inbox, the look-ahead, and the
    // track worker before it meters.
    assert!(wait_for(
        || engine.track_levels("sp1").is_some_and(|l| l.peak_left > 0.0),
        Duration::from_millis(1500)
    ));

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn control_updates_flow_to_the_registry() {
    let engine = engine();
    engine.start().unwrap();

    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));
    runtime.start();

    runtime.push_code_update(Box::new(|api: &mut RuntimeApi| {
        api.midi_sysex(
            INTERNAL_CONTROLS_TRACK,
            SysexKind::UpdateControls,
            r#"{"knobs": {"cutoff": 0.8, "res": 0.2}}"#,
        );
        CallbackOutcome::Done
    }));

    assert!(wait_for(
        || engine.controls().knob("cutoff").is_some(),
        Duration::from_millis(1000)
    ));
    let knob = engine.controls().knob("cutoff").unwrap();
    assert_eq!(knob.value_at(u64::MAX), 0.8);
    assert!(engine.controls().knob("res").is_some());

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn post_eval_hook_runs_after_each_update() {
    let engine = engine();
    engine.start().unwrap();

    let hook_runs = Arc::new(AtomicUsize::new(0));
    let hook_counter = hook_runs.clone();

    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));
    runtime.set_post_eval_hook(Box::new(move |_: &mut RuntimeApi| {
        hook_counter.fetch_add(1, Ordering::SeqCst);
    }));
    runtime.start();

    runtime.push_code_update(Box::new(|_: &mut RuntimeApi| CallbackOutcome::Done));
    assert!(wait_for(
        || hook_runs.load(Ordering::SeqCst) == 1,
        Duration::from_millis(1000)
    ));

    runtime.push_code_update(Box::new(|_: &mut RuntimeApi| CallbackOutcome::Done));
    assert!(wait_for(
        || hook_runs.load(Ordering::SeqCst) == 2,
        Duration::from_millis(1000)
    ));

    runtime.stop();
    engine.stop().unwrap();
}

#[test]
fn newer_code_update_overwrites_a_pending_one() {
    let engine = engine();

    // Don't start the runtime yet: both updates land in the single slot
    // before the loop first looks at it.
    let mut runtime = Runtime::new_with(&engine, Tempo(120.0));

    let applied = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (first, second) = (applied.clone(), applied.clone());
    runtime.push_code_update(Box::new(move |_: &mut RuntimeApi| {
        first.lock().unwrap().push("first");
        CallbackOutcome::Done
    }));
    runtime.push_code_update(Box::new(move |_: &mut RuntimeApi| {
        second.lock().unwrap().push("second");
        CallbackOutcome::Done
    }));

    engine.start().unwrap();
    runtime.start();

    assert!(wait_for(
        || !applied.lock().unwrap().is_empty(),
        Duration::from_millis(1000)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(applied.lock().unwrap().clone(), vec!["second"]);

    runtime.stop();
    engine.stop().unwrap();
}
