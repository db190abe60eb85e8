// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

type Listener = Box<dyn FnOnce()>;

/// A one-shot cancellation signal owned by the caller.
///
/// Clones share the same signal, so one token can fan out cancellation to many adapter
/// sessions. Each session holds its own subscription and releases it when it terminates.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use stream_lifecycle::CancellationToken;
///
/// let token = CancellationToken::new();
/// let fired = Rc::new(Cell::new(false));
///
/// let _subscription = token.subscribe_once({
///     let fired = Rc::clone(&fired);
///     move || fired.set(true)
/// });
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// assert!(fired.get());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Cell<bool>,
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(u64, Listener)>>,
}

/// A registration created by [`CancellationToken::subscribe_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelSubscription(u64);

impl CancellationToken {
    /// Creates a token that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once [`cancel`][Self::cancel] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Triggers the token.
    ///
    /// Every registered listener runs once, in registration order. Triggering an already
    /// triggered token does nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }

        let listeners = self.inner.listeners.take();
        for (_, listener) in listeners {
            listener();
        }
    }

    /// Registers a listener that runs when the token is triggered.
    ///
    /// A listener registered on an already triggered token never runs; check
    /// [`is_cancelled`][Self::is_cancelled] first.
    pub fn subscribe_once(&self, listener: impl FnOnce() + 'static) -> CancelSubscription {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id.wrapping_add(1));

        if !self.is_cancelled() {
            self.inner.listeners.borrow_mut().push((id, Box::new(listener)));
        }

        CancelSubscription(id)
    }

    /// Removes a listener. Returns `false` if it already ran or was removed.
    pub fn unsubscribe(&self, subscription: CancelSubscription) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.0);
        listeners.len() != before
    }

    /// Returns the number of listeners waiting for the token to be triggered.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
