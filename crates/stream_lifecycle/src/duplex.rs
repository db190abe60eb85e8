// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{Level, event};

use crate::callbacks::{OnAbort, OnData, OnError, OnSignal, OnceSlot};
use crate::session::{next_session_id, report};
use crate::{
    BoxError, CancelSubscription, CancellationToken, DelayScheduler, Flow, Options, ReadAdapter, ReadHandle, Resource, StreamError,
    WriteAdapter, WriteInput, WriteStatus, Writer,
};

/// Drives a readable and writable [`Resource`] through a read session and a write session at
/// once.
///
/// The two sessions share the scheduler and the [`Options`], and the cancellation token stops
/// both. The duplex reports one outcome for both:
///
/// - `on_end` runs with the number of bytes written once both sides completed.
/// - `on_error` runs once for the first error of either side. The resource is destroyed and the
///   other side stops without reporting anything.
/// - `on_abort` runs once when the session is cancelled. Both sides stop.
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "test-util")]
/// # fn main() {
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use futures::executor::LocalPool;
/// use stream_lifecycle::testing::FakeResource;
/// use stream_lifecycle::{DelayScheduler, DuplexAdapter, Flow};
/// use tick::ClockControl;
///
/// let pool = LocalPool::new();
/// let scheduler = DelayScheduler::new(ClockControl::new().to_clock(), pool.spawner());
/// let resource = Rc::new(FakeResource::duplex());
/// let total = Rc::new(Cell::new(None));
///
/// let duplex = DuplexAdapter::builder(Rc::clone(&resource), |_chunk| Ok(Flow::Continue))
///     .on_end({
///         let total = Rc::clone(&total);
///         move |bytes| total.set(Some(bytes))
///     })
///     .start(&scheduler);
///
/// let _ = duplex.write("ping");
/// duplex.end();
/// let _ = resource.emit_data("pong");
/// let _ = resource.emit_completed();
///
/// assert_eq!(total.get(), Some(4));
/// # }
/// # #[cfg(not(feature = "test-util"))]
/// # fn main() {}
/// ```
#[derive(Debug)]
#[non_exhaustive]
pub struct DuplexAdapter;

impl DuplexAdapter {
    /// Starts configuring a duplex session over `resource`.
    ///
    /// `on_data` receives every chunk read from the resource, as with [`ReadAdapter::builder`].
    #[must_use]
    pub fn builder<R: Resource + ?Sized + 'static>(
        resource: Rc<R>,
        on_data: impl Fn(Bytes) -> Result<Flow, BoxError> + 'static,
    ) -> DuplexAdapterBuilder<R> {
        DuplexAdapterBuilder {
            resource,
            cancellation: None,
            options: Options::default(),
            on_data: OnData::new(on_data),
            on_pause: None,
            on_backpressure: None,
            on_drained: None,
            on_error: None,
            on_end: None,
            on_abort: None,
        }
    }
}

/// Configures and starts a duplex session.
///
/// Access through [`DuplexAdapter::builder`].
pub struct DuplexAdapterBuilder<R: ?Sized> {
    resource: Rc<R>,
    cancellation: Option<CancellationToken>,
    options: Options,
    on_data: OnData,
    on_pause: Option<OnSignal>,
    on_backpressure: Option<OnSignal>,
    on_drained: Option<OnSignal>,
    on_error: Option<Box<dyn FnOnce(StreamError)>>,
    on_end: Option<Box<dyn FnOnce(u64)>>,
    on_abort: Option<Box<dyn FnOnce()>>,
}

impl<R: Resource + ?Sized + 'static> DuplexAdapterBuilder<R> {
    /// Cancels both sides when `token` is triggered.
    #[must_use]
    pub fn cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancellation = Some(token.clone());
        self
    }

    /// Replaces the default [`Options`] of both sides.
    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Invoked whenever the read side pauses the resource on behalf of `on_data`.
    #[must_use]
    pub fn on_pause(mut self, f: impl Fn() + 'static) -> Self {
        self.on_pause = Some(OnSignal::new(f));
        self
    }

    /// Invoked when a write leaves the resource over capacity, once per over-capacity episode.
    ///
    /// A producer typically stops writing here and starts again from `on_drained`.
    #[must_use]
    pub fn on_backpressure(mut self, f: impl Fn() + 'static) -> Self {
        self.on_backpressure = Some(OnSignal::new(f));
        self
    }

    /// Invoked on every drain while the write side is active.
    #[must_use]
    pub fn on_drained(mut self, f: impl Fn() + 'static) -> Self {
        self.on_drained = Some(OnSignal::new(f));
        self
    }

    /// Invoked at most once with the first error of either side.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(StreamError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Invoked at most once with the number of bytes written, after both sides completed.
    #[must_use]
    pub fn on_end(mut self, f: impl FnOnce(u64) + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    /// Invoked at most once if the session is cancelled.
    #[must_use]
    pub fn on_abort(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }

    /// Starts both sides.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not both readable and writable, or if the cancellation token
    /// has already been triggered.
    #[must_use]
    pub fn start(self, scheduler: &DelayScheduler) -> Duplex<R> {
        let capabilities = self.resource.capabilities();
        assert!(
            capabilities.readable && capabilities.writable && !self.resource.is_write_ended() && !self.resource.is_destroyed(),
            "a duplex session needs a readable and writable resource"
        );
        assert!(
            !self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled),
            "cannot start a duplex session with a cancellation token that is already triggered"
        );

        let outcome = Rc::new(Outcome {
            id: next_session_id(),
            active: Cell::new(true),
            read_done: Cell::new(false),
            bytes_written: Cell::new(None),
            stoppers: RefCell::new(Vec::new()),
            cancellation: self.cancellation,
            cancel_binding: Cell::new(None),
            on_error: OnceSlot::new(self.on_error),
            on_end: OnceSlot::new(self.on_end),
            on_abort: OnceSlot::new(self.on_abort),
        });

        if let Some(token) = &outcome.cancellation {
            let subscription = token.subscribe_once({
                let outcome = Rc::clone(&outcome);
                move || outcome.cancelled()
            });
            outcome.cancel_binding.set(Some(subscription));
        }

        event!(Level::DEBUG, message = "duplex session started", session = outcome.id);

        let mut writer = WriteAdapter::builder(Rc::clone(&self.resource))
            .options(self.options)
            .destroy_when_empty(false)
            .on_end({
                let outcome = Rc::clone(&outcome);
                move |bytes| outcome.write_completed(bytes)
            })
            .on_error({
                let outcome = Rc::clone(&outcome);
                move |error| outcome.failed(error)
            });
        if let Some(on_backpressure) = self.on_backpressure {
            writer = writer.on_backpressure(move || on_backpressure.call());
        }
        if let Some(on_drained) = self.on_drained {
            writer = writer.on_drained(move || on_drained.call());
        }
        let writer = writer.start(scheduler);

        let on_data = self.on_data;
        let mut reader = ReadAdapter::builder(Rc::clone(&self.resource), move |chunk| on_data.call(chunk), {
            let outcome = Rc::clone(&outcome);
            move || {
                outcome.read_completed();
                Ok(())
            }
        })
        .options(self.options)
        .on_error({
            let outcome = Rc::clone(&outcome);
            move |error| outcome.failed(error)
        });
        if let Some(on_pause) = self.on_pause {
            reader = reader.on_pause(move || on_pause.call());
        }
        let reader = reader.start(scheduler);

        // Settling the outcome stops whichever side is still running.
        outcome.stoppers.borrow_mut().extend([writer.stopper(), reader.stopper()]);

        Duplex { outcome, reader, writer }
    }
}

impl<R: ?Sized> Debug for DuplexAdapterBuilder<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexAdapterBuilder")
            .field("cancellation", &self.cancellation)
            .field("options", &self.options)
            .field("on_pause", &self.on_pause.is_some())
            .field("on_backpressure", &self.on_backpressure.is_some())
            .field("on_drained", &self.on_drained.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .finish_non_exhaustive()
    }
}

/// Feeds and observes a duplex session.
///
/// Created by [`DuplexAdapterBuilder::start`]. The write methods follow the rules of
/// [`Writer`], including its panics.
///
/// Dropping the duplex before the end of the written stream was requested stops both sides
/// silently and destroys the resource. After that, the session runs to its outcome without the
/// handle.
pub struct Duplex<R: Resource + ?Sized + 'static> {
    outcome: Rc<Outcome>,
    reader: ReadHandle<R>,
    writer: Writer<R>,
}

impl<R: Resource + ?Sized + 'static> Duplex<R> {
    /// Writes a chunk and returns whether the resource still has capacity.
    ///
    /// # Panics
    ///
    /// Panics if the write side no longer accepts input.
    pub fn write(&self, chunk: impl Into<Bytes>) -> WriteStatus {
        self.writer.write(chunk)
    }

    /// Requests the end of the written stream.
    ///
    /// # Panics
    ///
    /// Panics if the write side no longer accepts input.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn end(&self) {
        self.writer.end();
    }

    /// Requests the end of the written stream; `f` receives the number of bytes written once the
    /// write side completes.
    ///
    /// # Panics
    ///
    /// Panics if the write side no longer accepts input.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn end_with(&self, f: impl FnOnce(u64) + 'static) {
        self.writer.end_with(f);
    }

    /// Feeds one [`WriteInput`] to the write side.
    ///
    /// # Panics
    ///
    /// Panics if the write side no longer accepts input.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn submit(&self, input: impl Into<WriteInput>) -> Option<WriteStatus> {
        self.writer.submit(input)
    }

    /// The number of bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Returns `true` until the duplex session reported its outcome.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.outcome.active.get()
    }

    /// Returns `true` while the read side is running.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reader.is_active()
    }

    /// Returns `true` while the write side is running.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writer.is_active()
    }

    /// The resource of this session.
    #[must_use]
    pub fn resource(&self) -> &Rc<R> {
        self.writer.resource()
    }
}

impl<R: Resource + ?Sized + 'static> Drop for Duplex<R> {
    fn drop(&mut self) {
        if self.writer.is_active() && !self.writer.is_ending() {
            self.outcome.abandon();
        }
    }
}

impl<R: Resource + ?Sized + 'static> Debug for Duplex<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("outcome", &self.outcome)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

/// The combined outcome of both sides.
struct Outcome {
    id: u64,
    active: Cell<bool>,
    read_done: Cell<bool>,
    bytes_written: Cell<Option<u64>>,
    stoppers: RefCell<Vec<Box<dyn FnOnce()>>>,
    cancellation: Option<CancellationToken>,
    cancel_binding: Cell<Option<CancelSubscription>>,
    on_error: OnError,
    on_end: OnceSlot<dyn FnOnce(u64)>,
    on_abort: OnAbort,
}

impl Outcome {
    /// Returns `true` for the call that settled the outcome.
    fn settle(&self) -> bool {
        if !self.active.replace(false) {
            return false;
        }

        if let (Some(token), Some(subscription)) = (&self.cancellation, self.cancel_binding.take()) {
            token.unsubscribe(subscription);
        }

        true
    }

    fn stop_sides(&self) {
        let stoppers = self.stoppers.take();
        for stop in stoppers {
            stop();
        }
    }

    fn read_completed(&self) {
        self.read_done.set(true);
        event!(Level::DEBUG, message = "duplex read side completed", session = self.id);
        self.try_complete();
    }

    fn write_completed(&self, bytes_written: u64) {
        self.bytes_written.set(Some(bytes_written));
        event!(Level::DEBUG, message = "duplex write side completed", session = self.id, bytes_written);
        self.try_complete();
    }

    fn try_complete(&self) {
        let Some(bytes_written) = self.bytes_written.get() else {
            return;
        };
        if !self.read_done.get() || !self.settle() {
            return;
        }

        event!(Level::DEBUG, message = "duplex session completed", session = self.id, bytes_written);
        if let Some(on_end) = self.on_end.take() {
            on_end(bytes_written);
        }
    }

    fn failed(&self, error: StreamError) {
        if !self.settle() {
            event!(Level::DEBUG, message = "duplex absorbed error after outcome", session = self.id, %error);
            return;
        }

        event!(Level::DEBUG, message = "duplex session failed", session = self.id, kind = %error.kind());
        self.stop_sides();
        report(&self.on_error, error, self.id, "duplex");
    }

    fn cancelled(&self) {
        self.cancel_binding.set(None);
        if !self.settle() {
            return;
        }

        event!(Level::DEBUG, message = "duplex session cancelled", session = self.id);
        self.stop_sides();
        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }

    fn abandon(&self) {
        if !self.settle() {
            return;
        }

        event!(Level::DEBUG, message = "duplex dropped before the end of the stream", session = self.id);
        self.stop_sides();
    }
}

impl Debug for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outcome")
            .field("id", &self.id)
            .field("active", &self.active.get())
            .field("read_done", &self.read_done.get())
            .field("bytes_written", &self.bytes_written.get())
            .finish_non_exhaustive()
    }
}
