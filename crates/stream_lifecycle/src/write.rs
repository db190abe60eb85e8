// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{Level, event};

use crate::callbacks::{OnError, OnSignal, OnceSlot};
use crate::session::Session;
use crate::{CancellationToken, Channel, DelayScheduler, Failure, Notification, Options, Resource, StreamError, WriteStatus};

type Completion = Box<dyn FnOnce(u64)>;

/// Drives a writable [`Resource`] through one write session.
///
/// Start a session with [`WriteAdapter::builder`]. The returned [`Writer`] accepts chunks and
/// the end of the stream; the outcome of the session is reported through exactly one of the
/// `on_end` and `on_error` callbacks, or through neither if the session is cancelled.
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
/// use stream_lifecycle::{DelayScheduler, WriteAdapter};
/// use tick::ClockControl;
///
/// let pool = LocalPool::new();
/// let scheduler = DelayScheduler::new(ClockControl::new().to_clock(), pool.spawner());
/// let resource = Rc::new(FakeResource::writable());
/// let total = Rc::new(Cell::new(0));
///
/// let writer = WriteAdapter::builder(Rc::clone(&resource))
///     .on_end({
///         let total = Rc::clone(&total);
///         move |bytes| total.set(bytes)
///     })
///     .start(&scheduler);
///
/// let _ = writer.write("hello ");
/// let _ = writer.write("world");
/// writer.end();
/// let _ = resource.emit_completed();
///
/// assert_eq!(total.get(), 11);
/// assert_eq!(&resource.contents()[..], b"hello world");
/// # }
/// # #[cfg(not(feature = "test-util"))]
/// # fn main() {}
/// ```
#[derive(Debug)]
#[non_exhaustive]
pub struct WriteAdapter;

impl WriteAdapter {
    /// Starts configuring a write session over `resource`.
    #[must_use]
    pub fn builder<R: Resource + ?Sized + 'static>(resource: Rc<R>) -> WriteAdapterBuilder<R> {
        WriteAdapterBuilder {
            resource,
            cancellation: None,
            options: Options::default(),
            on_backpressure: None,
            on_drained: None,
            on_error: None,
            on_end: None,
            destroy_when_empty: true,
        }
    }
}

/// Configures and starts a write session.
///
/// Access through [`WriteAdapter::builder`]. Every callback is optional.
pub struct WriteAdapterBuilder<R: ?Sized> {
    resource: Rc<R>,
    cancellation: Option<CancellationToken>,
    options: Options,
    on_backpressure: Option<OnSignal>,
    on_drained: Option<OnSignal>,
    on_error: Option<Box<dyn FnOnce(StreamError)>>,
    on_end: Option<Completion>,
    destroy_when_empty: bool,
}

impl<R: Resource + ?Sized + 'static> WriteAdapterBuilder<R> {
    /// Cancels the session when `token` is triggered.
    ///
    /// A cancelled session destroys the resource and reports neither `on_end` nor `on_error`.
    #[must_use]
    pub fn cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancellation = Some(token.clone());
        self
    }

    /// Replaces the default [`Options`].
    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Invoked when a write leaves the resource over capacity.
    ///
    /// Invoked once per over-capacity episode. The episode ends on the next drain.
    #[must_use]
    pub fn on_backpressure(mut self, f: impl Fn() + 'static) -> Self {
        self.on_backpressure = Some(OnSignal::new(f));
        self
    }

    /// Invoked on every drain while the session is active.
    #[must_use]
    pub fn on_drained(mut self, f: impl Fn() + 'static) -> Self {
        self.on_drained = Some(OnSignal::new(f));
        self
    }

    /// Invoked at most once if the session ends with an error.
    ///
    /// Without an error callback, failures are logged at `ERROR` level and abnormal closures
    /// at `WARN` level.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(StreamError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Invoked at most once with the number of bytes written when the session ends successfully.
    #[must_use]
    pub fn on_end(mut self, f: impl FnOnce(u64) + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    /// Whether ending a session that wrote nothing destroys the resource right away instead of
    /// waiting for it to complete. A duplex keeps the resource for its read side.
    #[must_use]
    pub(crate) fn destroy_when_empty(mut self, destroy_when_empty: bool) -> Self {
        self.destroy_when_empty = destroy_when_empty;
        self
    }

    /// Starts the session and returns the [`Writer`] that feeds it.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not writable or if the cancellation token has already been
    /// triggered.
    #[must_use]
    pub fn start(self, scheduler: &DelayScheduler) -> Writer<R> {
        let session = Rc::new(Session::new("write", self.resource, self.cancellation, scheduler, self.options));
        assert!(session.is_writable(), "a write session needs a writable resource");

        let inner = Rc::new(WriteInner {
            session,
            bytes_written: Cell::new(0),
            ending: Cell::new(false),
            over_capacity: Cell::new(false),
            drains: Cell::new(0),
            on_backpressure: self.on_backpressure,
            on_drained: self.on_drained,
            on_error: OnceSlot::new(self.on_error),
            on_end: OnceSlot::new(self.on_end),
            completion: OnceSlot::new(None),
            destroy_when_empty: self.destroy_when_empty,
        });

        inner.bind();

        Writer {
            feed: Rc::new(Feed { inner }),
        }
    }
}

impl<R: ?Sized> Debug for WriteAdapterBuilder<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAdapterBuilder")
            .field("cancellation", &self.cancellation)
            .field("options", &self.options)
            .field("on_backpressure", &self.on_backpressure.is_some())
            .field("on_drained", &self.on_drained.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish_non_exhaustive()
    }
}

/// One input to [`Writer::submit`].
pub enum WriteInput {
    /// A chunk of bytes to write.
    Chunk(Bytes),

    /// No more data follows.
    End,

    /// No more data follows; the callback receives the number of bytes written once the
    /// resource completes, after `on_end`.
    EndWith(Completion),
}

impl Debug for WriteInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk(chunk) => f.debug_tuple("Chunk").field(&chunk.len()).finish(),
            Self::End => f.write_str("End"),
            Self::EndWith(_) => f.write_str("EndWith"),
        }
    }
}

impl From<Bytes> for WriteInput {
    fn from(chunk: Bytes) -> Self {
        Self::Chunk(chunk)
    }
}

impl From<Vec<u8>> for WriteInput {
    fn from(chunk: Vec<u8>) -> Self {
        Self::Chunk(chunk.into())
    }
}

impl From<String> for WriteInput {
    fn from(chunk: String) -> Self {
        Self::Chunk(chunk.into())
    }
}

impl From<&'static str> for WriteInput {
    fn from(chunk: &'static str) -> Self {
        Self::Chunk(Bytes::from_static(chunk.as_bytes()))
    }
}

impl From<&'static [u8]> for WriteInput {
    fn from(chunk: &'static [u8]) -> Self {
        Self::Chunk(Bytes::from_static(chunk))
    }
}

/// Feeds a write session.
///
/// Created by [`WriteAdapterBuilder::start`]. Clones feed the same session. The writer may be
/// used from inside the session's own callbacks, for example to write the next chunk from
/// `on_drained`.
///
/// Every method that feeds the session panics when the session no longer accepts input: after
/// it terminated, after the end of the stream was requested, or once the resource stopped being
/// writable. These are caller bugs, not I/O errors.
///
/// Dropping the last clone before the end of the stream was requested cancels the session: the
/// resource is destroyed and neither `on_end` nor `on_error` is invoked. Once the end was
/// requested, the session runs to completion without the writer.
pub struct Writer<R: Resource + ?Sized + 'static> {
    feed: Rc<Feed<R>>,
}

impl<R: Resource + ?Sized + 'static> Writer<R> {
    /// Writes a chunk and returns whether the resource still has capacity.
    ///
    /// # Panics
    ///
    /// Panics if the session no longer accepts input.
    pub fn write(&self, chunk: impl Into<Bytes>) -> WriteStatus {
        self.feed.inner.write_chunk(chunk.into())
    }

    /// Requests the end of the stream.
    ///
    /// # Panics
    ///
    /// Panics if the session no longer accepts input.
    pub fn end(&self) {
        self.feed.inner.end(None);
    }

    /// Requests the end of the stream and registers `f` to receive the number of bytes written
    /// once the resource completes. `f` runs after `on_end`.
    ///
    /// # Panics
    ///
    /// Panics if the session no longer accepts input.
    pub fn end_with(&self, f: impl FnOnce(u64) + 'static) {
        self.feed.inner.end(Some(Box::new(f)));
    }

    /// Feeds one [`WriteInput`] to the session.
    ///
    /// Returns the write status for chunks and `None` for the end of the stream.
    ///
    /// # Panics
    ///
    /// Panics if the session no longer accepts input.
    pub fn submit(&self, input: impl Into<WriteInput>) -> Option<WriteStatus> {
        match input.into() {
            WriteInput::Chunk(chunk) => Some(self.feed.inner.write_chunk(chunk)),
            WriteInput::End => {
                self.feed.inner.end(None);
                None
            }
            WriteInput::EndWith(completion) => {
                self.feed.inner.end(Some(completion));
                None
            }
        }
    }

    /// The number of bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.feed.inner.bytes_written.get()
    }

    /// Returns `true` until the session terminates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.feed.inner.session.is_active()
    }

    /// Returns `true` between the end request and the completion of the resource.
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.feed.inner.ending.get()
    }

    /// The resource this session writes to.
    #[must_use]
    pub fn resource(&self) -> &Rc<R> {
        self.feed.inner.session.resource()
    }

    /// Stops the session as if its cancellation token had been triggered. Holds no strong
    /// reference to the session.
    pub(crate) fn stopper(&self) -> Box<dyn FnOnce()> {
        let inner = Rc::downgrade(&self.feed.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.on_cancelled();
            }
        })
    }
}

impl<R: Resource + ?Sized + 'static> Clone for Writer<R> {
    fn clone(&self) -> Self {
        Self {
            feed: Rc::clone(&self.feed),
        }
    }
}

impl<R: Resource + ?Sized + 'static> Debug for Writer<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("session", &self.feed.inner.session)
            .field("bytes_written", &self.feed.inner.bytes_written.get())
            .field("ending", &self.feed.inner.ending.get())
            .finish()
    }
}

/// Shared by all clones of a [`Writer`]. The notification handlers hold the session state but
/// not this, so its drop marks the moment the last writer went away.
struct Feed<R: Resource + ?Sized + 'static> {
    inner: Rc<WriteInner<R>>,
}

impl<R: Resource + ?Sized + 'static> Drop for Feed<R> {
    fn drop(&mut self) {
        self.inner.on_abandoned();
    }
}

struct WriteInner<R: Resource + ?Sized> {
    session: Rc<Session<R>>,
    bytes_written: Cell<u64>,
    ending: Cell<bool>,
    over_capacity: Cell<bool>,
    drains: Cell<u64>,
    on_backpressure: Option<OnSignal>,
    on_drained: Option<OnSignal>,
    on_error: OnError,
    on_end: OnceSlot<dyn FnOnce(u64)>,
    completion: OnceSlot<dyn FnOnce(u64)>,
    destroy_when_empty: bool,
}

impl<R: Resource + ?Sized + 'static> WriteInner<R> {
    fn bind(self: &Rc<Self>) {
        let session = &self.session;

        session.bind_once(Channel::Failed, {
            let this = Rc::clone(self);
            move |notification| {
                if let Notification::Failed(failure) = notification {
                    this.on_failed(failure);
                }
            }
        });

        session.bind_once(Channel::ClosedAbnormally, {
            let this = Rc::clone(self);
            move |_| this.on_closed_abnormally()
        });

        session.bind(Channel::Drain, {
            let this = Rc::clone(self);
            move |_| this.on_drain()
        });

        session.bind_cancel({
            let this = Rc::clone(self);
            move || this.on_cancelled()
        });
    }

    fn assert_accepts_input(&self) {
        assert!(self.session.is_active(), "cannot write to a session that has terminated");
        assert!(!self.ending.get(), "cannot write after the end of the stream was requested");
        assert!(self.session.is_writable(), "cannot write to a resource that is no longer writable");
    }

    fn write_chunk(&self, chunk: Bytes) -> WriteStatus {
        self.assert_accepts_input();

        let len = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
        self.bytes_written.set(self.bytes_written.get().saturating_add(len));

        event!(Level::TRACE, message = "writing chunk", session = self.session.id(), len);

        let drains = self.drains.get();
        let status = self.session.resource().write(chunk);

        // A drain raised from inside `write` already answered the over-capacity status.
        let drained = self.drains.get() != drains;

        if !status.has_capacity() && !drained && self.session.is_active() && !self.over_capacity.replace(true) {
            event!(Level::DEBUG, message = "resource over capacity", session = self.session.id());
            if let Some(on_backpressure) = &self.on_backpressure {
                on_backpressure.call();
            }
        }

        status
    }

    fn end(self: &Rc<Self>, completion: Option<Completion>) {
        self.assert_accepts_input();
        let session = &self.session;

        if self.destroy_when_empty && self.bytes_written.get() == 0 {
            // Nothing to flush, so there is nothing to wait for either.
            session.unbind_all(&[Channel::Drain, Channel::ClosedAbnormally]);
            session.unbind_cancel();
            session.release_failure_after_grace();
            session.finish();
            session.log_transition("ended without data");
            session.destroy();
            self.deliver_end(0, completion);
            return;
        }

        session.unbind(Channel::Drain);
        self.completion.replace(completion);
        self.ending.set(true);

        session.bind_once(Channel::Completed, {
            let this = Rc::clone(self);
            move |_| this.on_completed()
        });

        event!(
            Level::DEBUG,
            message = "ending stream",
            session = session.id(),
            bytes_written = self.bytes_written.get(),
        );
        session.resource().end();
    }

    fn deliver_end(&self, bytes_written: u64, completion: Option<Completion>) {
        if let Some(on_end) = self.on_end.take() {
            on_end(bytes_written);
        }
        if let Some(completion) = completion {
            completion(bytes_written);
        }
    }

    fn on_drain(&self) {
        if !self.session.is_active() {
            return;
        }

        self.over_capacity.set(false);
        self.drains.set(self.drains.get().wrapping_add(1));
        event!(Level::TRACE, message = "resource drained", session = self.session.id());

        if let Some(on_drained) = &self.on_drained {
            on_drained.call();
        }
    }

    fn on_completed(&self) {
        let session = &self.session;
        session.fired(Channel::Completed);
        session.unbind_all(&[Channel::Drain, Channel::ClosedAbnormally]);
        session.unbind_cancel();
        session.release_failure_after_grace();

        let completion = self.completion.take();
        if !session.finish() {
            return;
        }

        self.ending.set(false);
        session.log_transition("completed");
        self.deliver_end(self.bytes_written.get(), completion);
    }

    fn on_closed_abnormally(&self) {
        let session = &self.session;
        session.fired(Channel::ClosedAbnormally);
        session.unbind_all(&[Channel::Drain, Channel::Completed]);
        session.unbind_cancel();
        session.release_failure_after_grace();
        drop(self.completion.take());

        if !session.finish() {
            return;
        }

        self.ending.set(false);
        session.log_transition("closed abnormally");
        session.report(&self.on_error, StreamError::closed_before_completion());
    }

    fn on_failed(&self, failure: &Failure) {
        let session = &self.session;
        session.failure_fired();
        session.unbind_all(&[Channel::Drain, Channel::Completed, Channel::ClosedAbnormally]);
        session.unbind_cancel();
        drop(self.completion.take());

        let was_active = session.finish();
        session.destroy();

        if !was_active {
            event!(
                Level::DEBUG,
                message = "absorbed failure after termination",
                session = session.id(),
                %failure,
            );
            return;
        }

        self.ending.set(false);
        session.log_transition("failed");
        session.report(&self.on_error, StreamError::failed(failure.clone()));
    }

    fn on_abandoned(&self) {
        let session = &self.session;
        if !session.is_active() || self.ending.get() {
            return;
        }

        session.unbind_all(&[Channel::Drain, Channel::Completed, Channel::ClosedAbnormally]);
        session.unbind_cancel();
        session.release_failure_after_grace();
        session.finish();
        session.log_transition("writer dropped");
        session.destroy();
    }

    fn on_cancelled(&self) {
        let session = &self.session;
        session.cancel_fired();
        session.unbind_all(&[Channel::Drain, Channel::Completed, Channel::ClosedAbnormally]);
        session.release_failure_after_grace();
        drop(self.completion.take());

        if !session.finish() {
            return;
        }

        self.ending.set(false);
        session.log_transition("cancelled");
        session.destroy();
    }
}
