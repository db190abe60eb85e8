// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! Tests for the duplex adapter.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::executor::LocalPool;
use stream_lifecycle::testing::FakeResource;
use stream_lifecycle::{CancellationToken, DelayScheduler, DuplexAdapter, DuplexAdapterBuilder, Flow, Resource, WriteStatus};
use tick::ClockControl;

struct Harness {
    control: ClockControl,
    pool: LocalPool,
    scheduler: DelayScheduler,
}

impl Harness {
    fn new() -> Self {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        Self { control, pool, scheduler }
    }

    fn elapse(&mut self, duration: Duration) {
        self.pool.run_until_stalled();
        self.control.advance(duration);
        self.pool.run_until_stalled();
    }
}

#[derive(Clone, Default)]
struct Events(Rc<RefCell<Vec<String>>>);

impl Events {
    fn push(&self, event: impl Into<String>) {
        self.0.borrow_mut().push(event.into());
    }

    fn signal(&self, name: &'static str) -> impl Fn() + 'static {
        let events = self.clone();
        move || events.push(name)
    }

    fn take(&self) -> Vec<String> {
        self.0.take()
    }
}

fn recorded(resource: &Rc<FakeResource>, events: &Events) -> DuplexAdapterBuilder<FakeResource> {
    DuplexAdapter::builder(Rc::clone(resource), {
        let events = events.clone();
        move |chunk| {
            events.push(format!("data({})", String::from_utf8_lossy(&chunk)));
            Ok(Flow::Continue)
        }
    })
    .on_backpressure(events.signal("backpressure"))
    .on_drained(events.signal("drained"))
    .on_abort(events.signal("abort"))
    .on_error({
        let events = events.clone();
        move |error| events.push(format!("error({:?})", error.kind()))
    })
    .on_end({
        let events = events.clone();
        move |bytes| events.push(format!("end({bytes})"))
    })
}

#[test]
fn ends_after_both_sides_complete() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    let _ = duplex.write("ping");
    let _ = resource.emit_data("pong");

    // The read side completes first; the write side has not ended yet.
    let _ = resource.emit_completed();
    assert_eq!(events.take(), vec!["data(pong)"]);
    assert!(!duplex.is_reading());
    assert!(duplex.is_writing());
    assert!(duplex.is_active());

    duplex.end();
    let _ = resource.emit_completed();

    assert_eq!(events.take(), vec!["end(4)"]);
    assert!(!duplex.is_active());
    assert_eq!(duplex.bytes_written(), 4);
}

#[test]
fn one_completion_can_finish_both_sides() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    let _ = duplex.write("abc");
    duplex.end();
    let _ = resource.emit_completed();

    assert_eq!(events.take(), vec!["end(3)"]);
}

#[test]
fn empty_end_waits_for_the_resource() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    duplex.end();
    assert!(!resource.is_destroyed());
    assert!(resource.is_write_ended());

    let _ = resource.emit_data("still reading");
    let _ = resource.emit_completed();

    assert_eq!(events.take(), vec!["data(still reading)", "end(0)"]);
}

#[test]
fn first_failure_is_reported_once() {
    let mut harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    let _ = duplex.write("abc");
    let _ = resource.emit_failed("broken pipe");
    let _ = resource.run_pending();
    harness.elapse(Duration::from_millis(100));

    assert_eq!(events.take(), vec!["error(Failed)"]);
    assert!(resource.is_destroyed());
    assert!(!duplex.is_active());
    assert!(!duplex.is_reading());
    assert!(!duplex.is_writing());
    assert!(resource.subscribers().subscribed_channels().is_empty());
}

#[test]
fn read_callback_error_stops_the_write_side() {
    let mut harness = Harness::new();
    let resource = Rc::new(FakeResource::builder().fail_on_destroy("reset").build());
    let errors = Rc::new(RefCell::new(Vec::new()));

    let duplex = DuplexAdapter::builder(Rc::clone(&resource), |_| Err("unexpected frame".into()))
        .on_error({
            let errors = Rc::clone(&errors);
            move |error| errors.borrow_mut().push(error.kind())
        })
        .start(&harness.scheduler);

    let _ = duplex.write("abc");
    let _ = resource.emit_data("junk");

    assert!(!duplex.is_reading());
    assert!(!duplex.is_writing());
    assert!(resource.is_destroyed());

    let _ = resource.run_pending();
    harness.elapse(Duration::from_millis(100));

    assert_eq!(*errors.borrow(), vec![stream_lifecycle::ErrorKind::Callback]);
    assert_eq!(resource.unhandled_failures(), 0);
    assert!(resource.subscribers().subscribed_channels().is_empty());
}

#[test]
fn closed_before_completion_is_reported_once() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    let _ = duplex.write("abc");
    let _ = resource.emit_closed_abnormally();

    assert_eq!(events.take(), vec!["error(ClosedBeforeCompletion)"]);
    assert!(!duplex.is_active());
}

#[test]
fn cancellation_stops_both_sides() {
    let mut harness = Harness::new();
    let resource = Rc::new(FakeResource::builder().fail_on_destroy("aborted").build());
    let events = Events::default();
    let token = CancellationToken::new();
    let duplex = recorded(&resource, &events).cancellation(&token).start(&harness.scheduler);

    let _ = duplex.write("abc");
    token.cancel();

    assert_eq!(events.take(), vec!["abort"]);
    assert!(!duplex.is_reading());
    assert!(!duplex.is_writing());
    assert!(resource.is_destroyed());
    assert_eq!(token.listener_count(), 0);

    let _ = resource.run_pending();
    harness.elapse(Duration::from_millis(100));

    assert!(events.take().is_empty());
    assert_eq!(resource.unhandled_failures(), 0);
    assert!(resource.subscribers().subscribed_channels().is_empty());
}

#[test]
fn cancellation_after_outcome_does_nothing() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let token = CancellationToken::new();
    let duplex = recorded(&resource, &events).cancellation(&token).start(&harness.scheduler);

    let _ = duplex.write("abc");
    duplex.end();
    let _ = resource.emit_completed();
    token.cancel();

    assert_eq!(events.take(), vec!["end(3)"]);
    assert!(!resource.is_destroyed());
}

#[test]
fn dropping_the_duplex_before_end_stops_both_sides() {
    let mut harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let weak = Rc::downgrade(&resource);
    let events = Events::default();
    let token = CancellationToken::new();
    let duplex = recorded(&resource, &events).cancellation(&token).start(&harness.scheduler);

    let _ = duplex.write("abc");
    drop(duplex);

    assert!(resource.is_destroyed());
    assert_eq!(token.listener_count(), 0);

    let _ = resource.run_pending();
    assert!(events.take().is_empty());

    drop(resource);
    harness.elapse(Duration::from_millis(100));
    assert!(weak.upgrade().is_none());
}

#[test]
fn dropping_the_duplex_after_end_keeps_the_session() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    let _ = duplex.write("abc");
    duplex.end();
    drop(duplex);

    let _ = resource.emit_data("tail");
    let _ = resource.emit_completed();

    assert_eq!(events.take(), vec!["data(tail)", "end(3)"]);
    assert!(!resource.is_destroyed());
}

#[test]
fn write_side_flow_control_is_surfaced() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::builder().high_water_mark(2).build());
    let events = Events::default();
    let duplex = recorded(&resource, &events).start(&harness.scheduler);

    assert_eq!(duplex.write("abc"), WriteStatus::OverCapacity);
    let _ = resource.drain();

    assert_eq!(events.take(), vec!["backpressure", "drained"]);
}

#[test]
fn read_side_pause_is_surfaced() {
    let harness = Harness::new();
    let resource = Rc::new(FakeResource::duplex());
    let pauses = Rc::new(RefCell::new(0));

    let _duplex = DuplexAdapter::builder(Rc::clone(&resource), |_| Ok(Flow::Pause))
        .on_pause({
            let pauses = Rc::clone(&pauses);
            move || *pauses.borrow_mut() += 1
        })
        .start(&harness.scheduler);

    let _ = resource.emit_data("a");
    let _ = resource.emit_data("b");

    assert_eq!(*pauses.borrow(), 1);
    assert!(resource.is_paused());
}
