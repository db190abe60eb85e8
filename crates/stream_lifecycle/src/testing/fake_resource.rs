// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::{BoxError, Capabilities, Delivery, Failure, Notification, Resource, Subscribers, WriteStatus};

/// The default number of buffered bytes at which [`FakeResource::write`] reports
/// [`WriteStatus::OverCapacity`].
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// A scriptable in-memory [`Resource`].
///
/// Tests drive it by raising notifications explicitly (`emit_*`, [`drain`][Self::drain]) and
/// inspect what the adapter did to it afterwards: the chunks written, whether it was ended,
/// paused or destroyed.
///
/// Destroying the resource does not raise anything right away. Like a real I/O resource, it
/// queues an abnormal closure (and, if configured, a failure) that is raised by
/// [`run_pending`][Self::run_pending], which stands in for the I/O runtime getting to it later.
///
/// This is for test and example purposes only.
#[derive(Debug)]
pub struct FakeResource {
    capabilities: Capabilities,
    high_water_mark: usize,
    complete_on_end: bool,
    fail_on_destroy: Option<String>,

    subscribers: Subscribers,
    state: RefCell<State>,
    unhandled_failures: Cell<usize>,
}

#[derive(Debug, Default)]
struct State {
    written: Vec<Bytes>,
    buffered: usize,
    paused: bool,
    paused_data: VecDeque<Bytes>,
    pause_count: usize,
    write_ended: bool,
    destroyed: bool,
    destroy_count: usize,
    pending: VecDeque<Notification>,
}

impl FakeResource {
    /// Starts building a new `FakeResource`.
    #[must_use]
    pub fn builder() -> FakeResourceBuilder {
        FakeResourceBuilder {
            capabilities: Capabilities::DUPLEX,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            complete_on_end: false,
            fail_on_destroy: None,
        }
    }

    /// Creates a readable resource with the default configuration.
    #[must_use]
    pub fn readable() -> Self {
        Self::builder().capabilities(Capabilities::READ_ONLY).build()
    }

    /// Creates a writable resource with the default configuration.
    #[must_use]
    pub fn writable() -> Self {
        Self::builder().capabilities(Capabilities::WRITE_ONLY).build()
    }

    /// Creates a readable and writable resource with the default configuration.
    #[must_use]
    pub fn duplex() -> Self {
        Self::builder().build()
    }

    /// Raises a data notification, or holds the chunk back while the resource is paused.
    ///
    /// Held back chunks are raised in order once the resource is resumed.
    pub fn emit_data(&self, chunk: impl Into<Bytes>) -> Delivery {
        let chunk = chunk.into();
        {
            let mut state = self.state.borrow_mut();
            if state.paused {
                state.paused_data.push_back(chunk);
                return Delivery::Delivered(0);
            }
        }

        self.emit(&Notification::Data(chunk))
    }

    /// Raises a completion notification.
    pub fn emit_completed(&self) -> Delivery {
        self.emit(&Notification::Completed)
    }

    /// Raises an abnormal closure notification.
    pub fn emit_closed_abnormally(&self) -> Delivery {
        self.emit(&Notification::ClosedAbnormally)
    }

    /// Raises a failure notification.
    pub fn emit_failed(&self, error: impl Into<BoxError>) -> Delivery {
        self.emit(&Notification::Failed(Failure::new(error)))
    }

    /// Forgets all buffered bytes and raises a drain notification.
    pub fn drain(&self) -> Delivery {
        self.state.borrow_mut().buffered = 0;
        self.emit(&Notification::Drained)
    }

    /// Raises every notification queued by [`destroy`][Resource::destroy], in order.
    ///
    /// Returns how many notifications were raised.
    pub fn run_pending(&self) -> usize {
        let mut raised = 0;
        loop {
            let Some(notification) = self.state.borrow_mut().pending.pop_front() else {
                return raised;
            };
            let _delivery = self.emit(&notification);
            raised += 1;
        }
    }

    /// Raises a notification and counts it if it was an unhandled failure.
    pub fn emit(&self, notification: &Notification) -> Delivery {
        let delivery = self.subscribers.emit(notification);
        if delivery.is_unhandled() {
            self.unhandled_failures.set(self.unhandled_failures.get() + 1);
        }
        delivery
    }

    /// The chunks written so far, in order.
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.state.borrow().written.clone()
    }

    /// Everything written so far, concatenated.
    #[must_use]
    pub fn contents(&self) -> Bytes {
        let state = self.state.borrow();
        let mut contents = BytesMut::new();
        for chunk in &state.written {
            contents.extend_from_slice(chunk);
        }
        contents.freeze()
    }

    /// How many times [`pause`][Resource::pause] was called while the resource was running.
    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.state.borrow().pause_count
    }

    /// How many times [`destroy`][Resource::destroy] was called.
    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.state.borrow().destroy_count
    }

    /// The number of failures raised while nobody listened for them.
    #[must_use]
    pub fn unhandled_failures(&self) -> usize {
        self.unhandled_failures.get()
    }
}

impl Default for FakeResource {
    fn default() -> Self {
        Self::duplex()
    }
}

impl Resource for FakeResource {
    #[cfg_attr(test, mutants::skip)] // Trivial accessor.
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[cfg_attr(test, mutants::skip)] // Trivial accessor.
    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    fn write(&self, chunk: Bytes) -> WriteStatus {
        let mut state = self.state.borrow_mut();
        state.buffered += chunk.len();
        state.written.push(chunk);

        if state.buffered >= self.high_water_mark {
            WriteStatus::OverCapacity
        } else {
            WriteStatus::Accepted
        }
    }

    fn end(&self) {
        self.state.borrow_mut().write_ended = true;

        if self.complete_on_end {
            let _delivery = self.emit_completed();
        }
    }

    fn destroy(&self) {
        let mut state = self.state.borrow_mut();
        state.destroy_count += 1;
        if state.destroyed {
            return;
        }

        state.destroyed = true;
        state.paused_data.clear();
        state.pending.push_back(Notification::ClosedAbnormally);
        if let Some(message) = &self.fail_on_destroy {
            state
                .pending
                .push_back(Notification::Failed(Failure::new(message.clone())));
        }
    }

    fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    fn is_write_ended(&self) -> bool {
        self.state.borrow().write_ended
    }

    fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    fn pause(&self) {
        let mut state = self.state.borrow_mut();
        if !state.paused {
            state.paused = true;
            state.pause_count += 1;
        }
    }

    fn resume(&self) {
        self.state.borrow_mut().paused = false;

        // A handler may pause again, which holds back the rest.
        loop {
            let chunk = {
                let mut state = self.state.borrow_mut();
                if state.paused {
                    break;
                }
                state.paused_data.pop_front()
            };

            match chunk {
                Some(chunk) => {
                    let _delivery = self.emit(&Notification::Data(chunk));
                }
                None => break,
            }
        }
    }
}

/// Creates an instance of [`FakeResource`].
///
/// Access through [`FakeResource::builder()`][FakeResource::builder].
#[derive(Debug)]
pub struct FakeResourceBuilder {
    capabilities: Capabilities,
    high_water_mark: usize,
    complete_on_end: bool,
    fail_on_destroy: Option<String>,
}

impl FakeResourceBuilder {
    /// Whether the resource is readable, writable or both.
    ///
    /// Optional. Defaults to [`Capabilities::DUPLEX`].
    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The number of buffered bytes at which writes report [`WriteStatus::OverCapacity`].
    ///
    /// Buffered bytes accumulate with every write and are forgotten by
    /// [`FakeResource::drain`].
    ///
    /// Optional. Defaults to [`DEFAULT_HIGH_WATER_MARK`].
    #[must_use]
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Raise the completion notification from inside [`Resource::end`].
    ///
    /// Optional. Defaults to `false`, in which case the test raises it.
    #[must_use]
    pub fn complete_on_end(mut self, complete_on_end: bool) -> Self {
        self.complete_on_end = complete_on_end;
        self
    }

    /// Queue a failure with this message, after the abnormal closure, when destroyed.
    ///
    /// Optional. Defaults to no failure.
    #[must_use]
    pub fn fail_on_destroy(mut self, message: impl Into<String>) -> Self {
        self.fail_on_destroy = Some(message.into());
        self
    }

    /// Builds the `FakeResource` with the provided configuration.
    #[must_use]
    pub fn build(self) -> FakeResource {
        FakeResource {
            capabilities: self.capabilities,
            high_water_mark: self.high_water_mark,
            complete_on_end: self.complete_on_end,
            fail_on_destroy: self.fail_on_destroy,
            subscribers: Subscribers::new(),
            state: RefCell::new(State::default()),
            unhandled_failures: Cell::new(0),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::Channel;

    fn collect_data(resource: &FakeResource) -> Rc<RefCell<Vec<Bytes>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _id = resource.subscribers().subscribe(Channel::Data, {
            let seen = Rc::clone(&seen);
            move |notification| {
                if let Notification::Data(chunk) = notification {
                    seen.borrow_mut().push(chunk.clone());
                }
            }
        });
        seen
    }

    #[test]
    fn write_reports_capacity() {
        let resource = FakeResource::builder().high_water_mark(4).build();

        assert_eq!(resource.write(Bytes::from_static(b"ab")), WriteStatus::Accepted);
        assert_eq!(resource.write(Bytes::from_static(b"cd")), WriteStatus::OverCapacity);
        let _delivery = resource.drain();
        assert_eq!(resource.write(Bytes::from_static(b"e")), WriteStatus::Accepted);

        assert_eq!(resource.contents(), Bytes::from_static(b"abcde"));
        assert_eq!(resource.written().len(), 3);
    }

    #[test]
    fn paused_data_is_held_back_until_resumed() {
        let resource = FakeResource::readable();
        let seen = collect_data(&resource);

        resource.pause();
        let _delivery = resource.emit_data("one");
        let _delivery = resource.emit_data("two");
        assert!(seen.borrow().is_empty());

        resource.resume();
        assert_eq!(*seen.borrow(), vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(resource.pause_count(), 1);
    }

    #[test]
    fn destroy_queues_closure_and_failure() {
        let resource = FakeResource::builder().fail_on_destroy("reset").build();

        resource.destroy();
        resource.destroy();
        assert!(resource.is_destroyed());
        assert!(!resource.is_writable());
        assert_eq!(resource.destroy_count(), 2);

        assert_eq!(resource.run_pending(), 2);
        assert_eq!(resource.unhandled_failures(), 1);
        assert_eq!(resource.run_pending(), 0);
    }

    #[test]
    fn end_can_complete_synchronously() {
        let resource = FakeResource::builder().complete_on_end(true).build();
        let completed = Rc::new(Cell::new(false));
        let _id = resource.subscribers().subscribe(Channel::Completed, {
            let completed = Rc::clone(&completed);
            move |_| completed.set(true)
        });

        resource.end();

        assert!(resource.is_write_ended());
        assert!(completed.get());
    }

    #[test]
    fn unhandled_failures_are_counted() {
        let resource = FakeResource::default();

        assert!(resource.emit_failed("boom").is_unhandled());
        assert_eq!(resource.unhandled_failures(), 1);
    }
}
