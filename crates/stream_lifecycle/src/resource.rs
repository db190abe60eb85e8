// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;

use crate::Subscribers;

/// What a resource can do, resolved once when an adapter session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    /// The resource produces [`Data`][crate::Notification::Data] notifications.
    pub readable: bool,

    /// The resource accepts chunk writes.
    pub writable: bool,
}

impl Capabilities {
    /// A resource that only produces data.
    pub const READ_ONLY: Self = Self {
        readable: true,
        writable: false,
    };

    /// A resource that only accepts data.
    pub const WRITE_ONLY: Self = Self {
        readable: false,
        writable: true,
    };

    /// A resource that both produces and accepts data.
    pub const DUPLEX: Self = Self {
        readable: true,
        writable: true,
    };
}

/// What a resource reports after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum WriteStatus {
    /// The chunk was accepted and the resource has room for more.
    Accepted,

    /// The chunk was accepted but the internal buffer of the resource is over capacity.
    ///
    /// The producer should stop until the resource raises [`Drained`][crate::Notification::Drained].
    OverCapacity,
}

impl WriteStatus {
    /// Returns `true` if the producer may keep writing.
    #[must_use]
    pub fn has_capacity(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// A byte-oriented I/O object wrapped by the adapters of this crate.
///
/// The resource raises notifications through its [`Subscribers`] table: data arrivals,
/// drains, completion, abnormal closure and failures. It may raise them at any time, including
/// from inside one of its own methods; adapters are prepared for that.
///
/// All methods take `&self` because the resource is shared (as `Rc<R>`) between the caller
/// and the handlers it notifies. Implementations use interior mutability and must not hold
/// internal borrows while emitting notifications.
///
/// # Destroying
///
/// [`destroy`][Self::destroy] terminates the resource forcibly. A destroyed resource may still
/// raise notifications afterwards, for example a late failure caused by the teardown itself.
pub trait Resource {
    /// The capability record of this resource.
    fn capabilities(&self) -> Capabilities;

    /// The notification table of this resource.
    fn subscribers(&self) -> &Subscribers;

    /// Accepts a chunk for writing.
    fn write(&self, chunk: Bytes) -> WriteStatus;

    /// Requests the resource to end its output once everything written so far is flushed.
    ///
    /// The resource raises [`Completed`][crate::Notification::Completed] when done.
    fn end(&self);

    /// Terminates the resource forcibly.
    fn destroy(&self);

    /// Returns `true` once the resource has been destroyed.
    fn is_destroyed(&self) -> bool;

    /// Returns `true` once the resource has been asked to end its output.
    fn is_write_ended(&self) -> bool;

    /// Returns `true` if the resource accepts chunk writes right now.
    fn is_writable(&self) -> bool {
        self.capabilities().writable && !self.is_write_ended() && !self.is_destroyed()
    }

    /// Returns `true` if the production of data notifications is paused.
    fn is_paused(&self) -> bool;

    /// Stops the production of data notifications until [`resume`][Self::resume] is called.
    fn pause(&self);

    /// Resumes the production of data notifications.
    fn resume(&self);
}
