// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{Level, event};

use crate::callbacks::{OnAbort, OnData, OnError, OnSignal, OnceSlot};
use crate::session::Session;
use crate::{BoxError, CancellationToken, Channel, DelayScheduler, Failure, Flow, Notification, Options, Resource, StreamError};

type OnEnd = Box<dyn FnOnce() -> Result<(), BoxError>>;

/// Drives a readable [`Resource`] through one read session.
///
/// The session is push-driven: once started, every data notification of the resource is handed
/// to `on_data` until the resource completes, closes, fails or the session is cancelled.
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "test-util")]
/// # fn main() {
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// use futures::executor::LocalPool;
/// use stream_lifecycle::testing::FakeResource;
/// use stream_lifecycle::{DelayScheduler, Flow, ReadAdapter};
/// use tick::ClockControl;
///
/// let pool = LocalPool::new();
/// let scheduler = DelayScheduler::new(ClockControl::new().to_clock(), pool.spawner());
/// let resource = Rc::new(FakeResource::readable());
/// let received = Rc::new(RefCell::new(Vec::new()));
///
/// let handle = ReadAdapter::builder(
///     Rc::clone(&resource),
///     {
///         let received = Rc::clone(&received);
///         move |chunk| {
///             received.borrow_mut().extend_from_slice(&chunk);
///             Ok(Flow::Continue)
///         }
///     },
///     || Ok(()),
/// )
/// .start(&scheduler);
///
/// let _ = resource.emit_data("hello");
/// let _ = resource.emit_completed();
///
/// assert_eq!(&received.borrow()[..], b"hello");
/// assert!(!handle.is_active());
/// # }
/// # #[cfg(not(feature = "test-util"))]
/// # fn main() {}
/// ```
#[derive(Debug)]
#[non_exhaustive]
pub struct ReadAdapter;

impl ReadAdapter {
    /// Starts configuring a read session over `resource`.
    ///
    /// `on_data` receives every chunk and decides whether the resource keeps flowing. `on_end`
    /// runs once when the resource completes. An error returned by either callback ends the
    /// session with [`ErrorKind::Callback`][crate::ErrorKind::Callback] and destroys the resource.
    #[must_use]
    pub fn builder<R: Resource + ?Sized + 'static>(
        resource: Rc<R>,
        on_data: impl Fn(Bytes) -> Result<Flow, BoxError> + 'static,
        on_end: impl FnOnce() -> Result<(), BoxError> + 'static,
    ) -> ReadAdapterBuilder<R> {
        ReadAdapterBuilder {
            resource,
            cancellation: None,
            options: Options::default(),
            on_data: OnData::new(on_data),
            on_end: Box::new(on_end),
            on_error: None,
            on_pause: None,
            on_abort: None,
        }
    }
}

/// Configures and starts a read session.
///
/// Access through [`ReadAdapter::builder`].
pub struct ReadAdapterBuilder<R: ?Sized> {
    resource: Rc<R>,
    cancellation: Option<CancellationToken>,
    options: Options,
    on_data: OnData,
    on_end: OnEnd,
    on_error: Option<Box<dyn FnOnce(StreamError)>>,
    on_pause: Option<OnSignal>,
    on_abort: Option<Box<dyn FnOnce()>>,
}

impl<R: Resource + ?Sized + 'static> ReadAdapterBuilder<R> {
    /// Cancels the session when `token` is triggered.
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

    /// Invoked at most once if the session ends with an error.
    ///
    /// Without an error callback, failures are logged at `ERROR` level and abnormal closures
    /// at `WARN` level.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(StreamError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Invoked whenever the adapter pauses the resource on behalf of `on_data`.
    #[must_use]
    pub fn on_pause(mut self, f: impl Fn() + 'static) -> Self {
        self.on_pause = Some(OnSignal::new(f));
        self
    }

    /// Invoked at most once if the session is cancelled.
    #[must_use]
    pub fn on_abort(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }

    /// Starts consuming the resource.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not readable or if the cancellation token has already been
    /// triggered.
    #[must_use]
    pub fn start(self, scheduler: &DelayScheduler) -> ReadHandle<R> {
        let session = Rc::new(Session::new("read", self.resource, self.cancellation, scheduler, self.options));
        assert!(session.capabilities().readable, "a read session needs a readable resource");

        let inner = Rc::new(ReadInner {
            session,
            on_data: self.on_data,
            on_end: OnceSlot::new(Some(self.on_end)),
            on_error: OnceSlot::new(self.on_error),
            on_pause: self.on_pause,
            on_abort: OnceSlot::new(self.on_abort),
        });

        inner.bind();

        ReadHandle { inner }
    }
}

impl<R: ?Sized> Debug for ReadAdapterBuilder<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAdapterBuilder")
            .field("cancellation", &self.cancellation)
            .field("options", &self.options)
            .field("on_error", &self.on_error.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .finish_non_exhaustive()
    }
}

/// Observes a running read session.
///
/// The session runs whether or not the handle is kept.
pub struct ReadHandle<R: Resource + ?Sized> {
    inner: Rc<ReadInner<R>>,
}

impl<R: Resource + ?Sized + 'static> ReadHandle<R> {
    /// Returns `true` until the session terminates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.session.is_active()
    }

    /// The resource this session reads from.
    #[must_use]
    pub fn resource(&self) -> &Rc<R> {
        self.inner.session.resource()
    }

    /// Stops the session as if its cancellation token had been triggered. Holds no strong
    /// reference to the session.
    pub(crate) fn stopper(&self) -> Box<dyn FnOnce()> {
        let inner = Rc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.on_cancelled();
            }
        })
    }
}

impl<R: Resource + ?Sized> Clone for ReadHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<R: Resource + ?Sized> Debug for ReadHandle<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle").field("session", &self.inner.session).finish()
    }
}

struct ReadInner<R: Resource + ?Sized> {
    session: Rc<Session<R>>,
    on_data: OnData,
    on_end: OnceSlot<dyn FnOnce() -> Result<(), BoxError>>,
    on_error: OnError,
    on_pause: Option<OnSignal>,
    on_abort: OnAbort,
}

impl<R: Resource + ?Sized + 'static> ReadInner<R> {
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

        session.bind_once(Channel::Completed, {
            let this = Rc::clone(self);
            move |_| this.on_completed()
        });

        session.bind(Channel::Data, {
            let this = Rc::clone(self);
            move |notification| {
                if let Notification::Data(chunk) = notification {
                    this.on_data(chunk.clone());
                }
            }
        });

        session.bind_cancel({
            let this = Rc::clone(self);
            move || this.on_cancelled()
        });
    }

    fn on_data(&self, chunk: Bytes) {
        if !self.session.is_active() {
            return;
        }

        event!(Level::TRACE, message = "delivering chunk", session = self.session.id(), len = chunk.len());

        match self.on_data.call(chunk) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Pause) => self.pause(),
            Err(error) => self.on_callback_failed(error),
        }
    }

    fn pause(&self) {
        let resource = self.session.resource();
        if !self.session.is_active() || resource.is_paused() {
            return;
        }

        resource.pause();
        event!(Level::DEBUG, message = "resource paused", session = self.session.id());

        if let Some(on_pause) = &self.on_pause {
            on_pause.call();
        }
    }

    fn on_callback_failed(&self, error: BoxError) {
        let session = &self.session;
        session.unbind_all(&[Channel::Data, Channel::Completed, Channel::ClosedAbnormally]);
        session.unbind_cancel();
        session.release_failure_after_grace();

        if !session.finish() {
            event!(
                Level::DEBUG,
                message = "absorbed callback error after termination",
                session = session.id(),
                %error,
            );
            return;
        }

        session.log_transition("callback failed");
        session.destroy();
        session.report(&self.on_error, StreamError::callback(error));
    }

    fn on_completed(&self) {
        let session = &self.session;
        session.fired(Channel::Completed);
        session.unbind_all(&[Channel::Data, Channel::ClosedAbnormally]);
        session.unbind_cancel();
        session.release_failure_after_grace();

        if !session.finish() {
            return;
        }

        session.log_transition("completed");

        let Some(on_end) = self.on_end.take() else {
            return;
        };

        if let Err(error) = on_end() {
            session.destroy();
            session.report(&self.on_error, StreamError::callback(error));
        }
    }

    fn on_closed_abnormally(&self) {
        let session = &self.session;
        session.fired(Channel::ClosedAbnormally);
        session.unbind_all(&[Channel::Data, Channel::Completed]);
        session.unbind_cancel();
        session.release_failure_after_grace();

        if !session.finish() {
            return;
        }

        session.log_transition("closed abnormally");
        session.report(&self.on_error, StreamError::closed_before_completion());
    }

    fn on_failed(&self, failure: &Failure) {
        let session = &self.session;
        session.failure_fired();
        session.unbind_all(&[Channel::Data, Channel::Completed, Channel::ClosedAbnormally]);
        session.unbind_cancel();

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

        session.log_transition("failed");
        session.report(&self.on_error, StreamError::failed(failure.clone()));
    }

    fn on_cancelled(&self) {
        let session = &self.session;
        session.cancel_fired();
        session.unbind_all(&[Channel::Data, Channel::Completed, Channel::ClosedAbnormally]);
        session.release_failure_after_grace();

        if !session.finish() {
            return;
        }

        session.log_transition("cancelled");
        session.destroy();

        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use futures::executor::LocalPool;
    use tick::ClockControl;

    use super::*;
    use crate::testing::FakeResource;

    fn scheduler() -> (DelayScheduler, LocalPool) {
        let pool = LocalPool::new();
        (DelayScheduler::new(ClockControl::new().to_clock(), pool.spawner()), pool)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_not_impl_any!(ReadHandle<FakeResource>: Send, Sync);
        static_assertions::assert_impl_all!(ReadHandle<FakeResource>: Clone, Debug);
    }

    #[test]
    fn start_subscribes_every_read_channel() {
        let (scheduler, _pool) = scheduler();
        let resource = Rc::new(FakeResource::readable());

        let _handle = ReadAdapter::builder(Rc::clone(&resource), |_| Ok(Flow::Continue), || Ok(())).start(&scheduler);

        assert_eq!(
            resource.subscribers().subscribed_channels(),
            vec![Channel::Data, Channel::Completed, Channel::ClosedAbnormally, Channel::Failed]
        );
    }

    #[test]
    fn pause_is_not_repeated_while_paused() {
        let (scheduler, _pool) = scheduler();
        let resource = Rc::new(FakeResource::readable());
        let pauses = Rc::new(std::cell::Cell::new(0));

        let _handle = ReadAdapter::builder(Rc::clone(&resource), |_| Ok(Flow::Pause), || Ok(()))
            .on_pause({
                let pauses = Rc::clone(&pauses);
                move || pauses.set(pauses.get() + 1)
            })
            .start(&scheduler);

        let _delivery = resource.emit(&Notification::Data(Bytes::from_static(b"a")));
        let _delivery = resource.emit(&Notification::Data(Bytes::from_static(b"b")));

        assert_eq!(pauses.get(), 1);
        assert_eq!(resource.pause_count(), 1);
    }

    #[test]
    #[should_panic(expected = "readable resource")]
    fn write_only_resource_is_rejected() {
        let (scheduler, _pool) = scheduler();

        let _handle = ReadAdapter::builder(Rc::new(FakeResource::writable()), |_| Ok(Flow::Continue), || Ok(())).start(&scheduler);
    }
}
