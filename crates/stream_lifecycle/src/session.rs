// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event};

use crate::callbacks::OnError;
use crate::{
    CancelSubscription, CancellationToken, Capabilities, Channel, DelayScheduler, DelayedTask, Notification, Options, Resource, StreamError,
    SubscriptionId,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle bookkeeping shared by every adapter.
///
/// A session owns the subscriptions an adapter holds on its resource and on its cancellation
/// token, remembers whether the terminal outcome has been delivered, and releases the failure
/// subscription after the grace window.
pub(crate) struct Session<R: Resource + ?Sized> {
    id: u64,
    adapter: &'static str,
    resource: Rc<R>,
    capabilities: Capabilities,
    active: Cell<bool>,
    bindings: [Cell<Option<SubscriptionId>>; 5],
    cancellation: Option<CancellationToken>,
    cancel_binding: Cell<Option<CancelSubscription>>,
    deferred_failure: RefCell<Option<DelayedTask>>,
    scheduler: DelayScheduler,
    options: Options,
}

impl<R: Resource + ?Sized + 'static> Session<R> {
    /// # Panics
    ///
    /// Panics if the cancellation token has already been triggered.
    pub(crate) fn new(
        adapter: &'static str,
        resource: Rc<R>,
        cancellation: Option<CancellationToken>,
        scheduler: &DelayScheduler,
        options: Options,
    ) -> Self {
        assert!(
            !cancellation.as_ref().is_some_and(CancellationToken::is_cancelled),
            "cannot start a {adapter} session with a cancellation token that is already triggered"
        );

        let capabilities = resource.capabilities();
        let id = next_session_id();

        event!(Level::DEBUG, message = "session started", session = id, adapter, ?capabilities);

        Self {
            id,
            adapter,
            resource,
            capabilities,
            active: Cell::new(true),
            bindings: Default::default(),
            cancellation,
            cancel_binding: Cell::new(None),
            deferred_failure: RefCell::new(None),
            scheduler: scheduler.clone(),
            options,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn resource(&self) -> &Rc<R> {
        &self.resource
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether the resource accepts chunk writes, judged by the capabilities resolved when the
    /// session started and the resource's current state.
    pub(crate) fn is_writable(&self) -> bool {
        self.capabilities.writable && !self.resource.is_write_ended() && !self.resource.is_destroyed()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Marks the session terminal. Returns `true` for the call that made the transition.
    pub(crate) fn finish(&self) -> bool {
        self.active.replace(false)
    }

    pub(crate) fn bind(&self, channel: Channel, handler: impl Fn(&Notification) + 'static) {
        debug_assert!(self.bindings[channel.index()].get().is_none());
        let id = self.resource.subscribers().subscribe(channel, handler);
        self.bindings[channel.index()].set(Some(id));
    }

    pub(crate) fn bind_once(&self, channel: Channel, handler: impl Fn(&Notification) + 'static) {
        debug_assert!(self.bindings[channel.index()].get().is_none());
        let id = self.resource.subscribers().subscribe_once(channel, handler);
        self.bindings[channel.index()].set(Some(id));
    }

    /// Subscribes to the cancellation token, if there is one.
    pub(crate) fn bind_cancel(&self, listener: impl FnOnce() + 'static) {
        if let Some(token) = &self.cancellation {
            self.cancel_binding.set(Some(token.subscribe_once(listener)));
        }
    }

    pub(crate) fn is_bound(&self, channel: Channel) -> bool {
        self.bindings[channel.index()].get().is_some()
    }

    /// Records that a one-shot subscription fired and is gone from the resource.
    pub(crate) fn fired(&self, channel: Channel) {
        self.bindings[channel.index()].set(None);
    }

    /// Records that the cancellation listener fired.
    pub(crate) fn cancel_fired(&self) {
        self.cancel_binding.set(None);
    }

    pub(crate) fn unbind(&self, channel: Channel) {
        if let Some(id) = self.bindings[channel.index()].take() {
            self.resource.subscribers().unsubscribe(id);
        }
    }

    /// Immediately releases every listed channel.
    pub(crate) fn unbind_all(&self, channels: &[Channel]) {
        for channel in channels {
            self.unbind(*channel);
        }
    }

    pub(crate) fn unbind_cancel(&self) {
        if let (Some(token), Some(subscription)) = (&self.cancellation, self.cancel_binding.take()) {
            token.unsubscribe(subscription);
        }
    }

    /// Releases the failure subscription once the grace window has elapsed.
    ///
    /// A failure raised before then reaches the adapter, which discards it because the session
    /// is no longer active.
    pub(crate) fn release_failure_after_grace(self: &Rc<Self>) {
        if !self.is_bound(Channel::Failed) || self.deferred_failure.borrow().is_some() {
            return;
        }

        let grace_window = self.options.grace_window_duration();
        if grace_window.is_zero() {
            self.unbind(Channel::Failed);
            return;
        }

        let scheduled = self.scheduler.schedule(grace_window, {
            let session = Rc::clone(self);
            move || {
                event!(
                    Level::DEBUG,
                    message = "grace window elapsed",
                    session = session.id,
                    adapter = session.adapter,
                );
                session.unbind(Channel::Failed);
            }
        });

        match scheduled {
            Ok(task) => {
                *self.deferred_failure.borrow_mut() = Some(task);
            }
            Err(error) => {
                event!(
                    Level::WARN,
                    message = "cannot schedule grace window, releasing failure subscription now",
                    session = self.id,
                    adapter = self.adapter,
                    %error,
                );
                self.unbind(Channel::Failed);
            }
        }
    }

    /// Records that the failure subscription fired and stops any pending grace window task.
    pub(crate) fn failure_fired(&self) {
        self.fired(Channel::Failed);
        if let Some(task) = self.deferred_failure.borrow_mut().take() {
            task.cancel();
        }
    }

    pub(crate) fn is_failure_release_pending(&self) -> bool {
        self.deferred_failure.borrow().as_ref().is_some_and(DelayedTask::is_pending)
    }

    /// Destroys the resource unless something already did.
    pub(crate) fn destroy(&self) {
        if !self.resource.is_destroyed() {
            event!(Level::DEBUG, message = "destroying resource", session = self.id, adapter = self.adapter);
            self.resource.destroy();
        }
    }

    /// Hands `error` to the error callback, or logs it when there is none.
    pub(crate) fn report(&self, on_error: &OnError, error: StreamError) {
        report(on_error, error, self.id, self.adapter);
    }

    pub(crate) fn log_transition(&self, transition: &'static str) {
        event!(
            Level::DEBUG,
            message = "session terminated",
            session = self.id,
            adapter = self.adapter,
            transition,
        );
    }
}

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Hands `error` to the error callback, or logs it when there is none.
pub(crate) fn report(on_error: &OnError, error: StreamError, session: u64, adapter: &'static str) {
    if let Some(on_error) = on_error.take() {
        on_error(error);
    } else if error.is_closed_before_completion() {
        event!(
            Level::WARN,
            message = "stream closed before completion with no error handler",
            session,
            adapter,
        );
    } else {
        event!(
            Level::ERROR,
            message = "stream error with no error handler",
            session,
            adapter,
            %error,
        );
    }
}

impl<R: Resource + ?Sized> Debug for Session<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .field("active", &self.active.get())
            .field("bindings", &self.bindings)
            .field("cancellation", &self.cancellation)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use futures::executor::LocalPool;
    use tick::ClockControl;

    use super::*;
    use crate::testing::FakeResource;

    fn session(options: Options) -> (Rc<Session<FakeResource>>, ClockControl, LocalPool) {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let resource = Rc::new(FakeResource::duplex());
        let session = Rc::new(Session::new("test", resource, None, &scheduler, options));
        (session, control, pool)
    }

    #[test]
    fn finish_transitions_once() {
        let (session, _control, _pool) = session(Options::default());

        assert!(session.is_active());
        assert!(session.finish());
        assert!(!session.finish());
        assert!(!session.is_active());
    }

    #[test]
    fn unbind_removes_only_own_subscription() {
        let (session, _control, _pool) = session(Options::default());
        let subscribers = session.resource().subscribers();
        let _foreign = subscribers.subscribe(Channel::Data, |_| {});

        session.bind(Channel::Data, |_| {});
        assert_eq!(subscribers.listener_count(Channel::Data), 2);

        session.unbind(Channel::Data);
        session.unbind(Channel::Data);
        assert_eq!(subscribers.listener_count(Channel::Data), 1);
        assert!(!session.is_bound(Channel::Data));
    }

    #[test]
    fn failure_released_after_grace_window() {
        let (session, control, mut pool) = session(Options::default());
        session.bind_once(Channel::Failed, |_| {});

        session.release_failure_after_grace();
        session.release_failure_after_grace();
        pool.run_until_stalled();
        assert!(session.is_bound(Channel::Failed));
        assert!(session.is_failure_release_pending());

        control.advance(Duration::from_millis(100));
        pool.run_until_stalled();
        assert!(!session.is_bound(Channel::Failed));
        assert!(!session.resource().subscribers().is_subscribed(Channel::Failed));
    }

    #[test]
    fn zero_grace_window_releases_immediately() {
        let (session, _control, _pool) = session(Options::default().grace_window(Duration::ZERO));
        session.bind_once(Channel::Failed, |_| {});

        session.release_failure_after_grace();

        assert!(!session.is_bound(Channel::Failed));
    }

    #[test]
    fn failure_during_grace_window_cancels_release() {
        let (session, control, mut pool) = session(Options::default());
        session.bind_once(Channel::Failed, |_| {});
        session.release_failure_after_grace();

        session.failure_fired();
        assert!(!session.is_failure_release_pending());

        control.advance(Duration::from_millis(100));
        pool.run_until_stalled();
        assert!(!session.is_bound(Channel::Failed));
    }

    #[test]
    fn refused_grace_window_releases_immediately() {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        drop(pool);

        let resource = Rc::new(FakeResource::duplex());
        let session = Rc::new(Session::new("test", resource, None, &scheduler, Options::default()));
        session.bind_once(Channel::Failed, |_| {});

        session.release_failure_after_grace();

        assert!(!session.is_bound(Channel::Failed));
    }

    #[test]
    fn unbind_cancel_releases_token_listener() {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let token = CancellationToken::new();
        let resource = Rc::new(FakeResource::duplex());
        let session = Session::new("test", resource, Some(token.clone()), &scheduler, Options::default());

        session.bind_cancel(|| {});
        assert_eq!(token.listener_count(), 1);

        session.unbind_cancel();
        assert_eq!(token.listener_count(), 0);
    }

    #[test]
    #[should_panic]
    fn triggered_token_is_rejected() {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let token = CancellationToken::new();
        token.cancel();

        let _session = Session::new("test", Rc::new(FakeResource::duplex()), Some(token), &scheduler, Options::default());
    }

    #[test]
    fn destroy_is_idempotent() {
        let (session, _control, _pool) = session(Options::default());

        session.destroy();
        session.destroy();

        assert!(session.resource().is_destroyed());
        assert_eq!(session.resource().destroy_count(), 1);
    }
}
