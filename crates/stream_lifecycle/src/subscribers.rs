// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use tracing::{Level, event};

use crate::{Channel, Notification};

/// A callback registered on a [`Subscribers`] table.
pub type Handler = Rc<dyn Fn(&Notification)>;

/// Identifies one registration in a [`Subscribers`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The outcome of [`Subscribers::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Delivery {
    /// The notification was handed to this many listeners (possibly zero for channels other
    /// than [`Channel::Failed`]).
    Delivered(usize),

    /// A failure was raised while nobody listened on [`Channel::Failed`].
    ///
    /// Resources should treat this the way an unhandled error is treated in their environment.
    /// The table itself logs the failure at `ERROR` level.
    Unhandled,
}

impl Delivery {
    /// Returns `true` if the notification was a failure nobody listened for.
    #[must_use]
    pub fn is_unhandled(self) -> bool {
        matches!(self, Self::Unhandled)
    }
}

/// The notification table of a resource.
///
/// Resources embed one of these and expose it through
/// [`Resource::subscribers`][crate::Resource::subscribers]. Adapters subscribe and unsubscribe
/// precisely, by [`SubscriptionId`], so a finished session leaves no listeners behind.
///
/// Handlers are invoked without any borrow of the table held, which means a handler may
/// subscribe, unsubscribe or cause further notifications to be emitted. The set of handlers
/// for one [`emit`][Self::emit] call is fixed when the call starts.
#[derive(Default)]
pub struct Subscribers {
    state: RefCell<State>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    entries: Vec<Entry>,
}

struct Entry {
    id: SubscriptionId,
    channel: Channel,
    once: bool,
    handler: Handler,
}

impl Subscribers {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler that is invoked for every notification on `channel`.
    pub fn subscribe(&self, channel: Channel, handler: impl Fn(&Notification) + 'static) -> SubscriptionId {
        self.insert(channel, false, Rc::new(handler))
    }

    /// Registers a handler that is invoked for the next notification on `channel` only.
    ///
    /// The registration is removed before the handler runs.
    pub fn subscribe_once(&self, channel: Channel, handler: impl Fn(&Notification) + 'static) -> SubscriptionId {
        self.insert(channel, true, Rc::new(handler))
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.borrow_mut();
        let removed = state
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .map(|index| state.entries.remove(index));
        drop(state);

        // The handler is dropped here, after the borrow: dropping it may release the last
        // reference to state that touches this table.
        removed.is_some()
    }

    /// Returns `true` if at least one handler listens on `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.listener_count(channel) > 0
    }

    /// Returns the number of handlers listening on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: Channel) -> usize {
        self.state.borrow().entries.iter().filter(|entry| entry.channel == channel).count()
    }

    /// Returns the channels that currently have at least one listener, in [`Channel::ALL`] order.
    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<Channel> {
        Channel::ALL.into_iter().filter(|channel| self.is_subscribed(*channel)).collect()
    }

    /// Delivers a notification to every handler listening on its channel, in registration order.
    pub fn emit(&self, notification: &Notification) -> Delivery {
        let channel = notification.channel();
        let handlers = self.take_handlers(channel);

        if handlers.is_empty() && channel == Channel::Failed {
            event!(
                Level::ERROR,
                message = "unhandled failure notification",
                failure = ?notification,
            );
            return Delivery::Unhandled;
        }

        for handler in &handlers {
            handler(notification);
        }

        Delivery::Delivered(handlers.len())
    }

    fn insert(&self, channel: Channel, once: bool, handler: Handler) -> SubscriptionId {
        let mut state = self.state.borrow_mut();
        let id = SubscriptionId(state.next_id);
        state.next_id = state.next_id.wrapping_add(1);
        state.entries.push(Entry {
            id,
            channel,
            once,
            handler,
        });
        id
    }

    // Snapshot of the handlers for one emission. One-shot registrations are removed here.
    fn take_handlers(&self, channel: Channel) -> Vec<Handler> {
        let mut state = self.state.borrow_mut();
        let handlers = state
            .entries
            .iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| Rc::clone(&entry.handler))
            .collect();
        state.entries.retain(|entry| !(entry.once && entry.channel == channel));
        handlers
    }
}

impl Debug for Subscribers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        for channel in Channel::ALL {
            list.entry(&channel, &self.listener_count(channel));
        }
        list.finish()
    }
}
