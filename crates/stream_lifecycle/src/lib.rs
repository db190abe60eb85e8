// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Lifecycle adapters for callback-driven byte streams.
//!
//! An I/O resource that announces its progress through notifications (data arrived, writable
//! again, finished, closed abruptly, failed) is awkward to consume correctly: the notifications
//! race each other, a resource that was just destroyed may still report a failure, and every
//! listener has to be removed again once the work is done. The adapters in this crate wrap such a
//! [`Resource`] and turn it into a deterministic callback protocol:
//!
//! - [`WriteAdapter`] feeds a writable resource through a [`Writer`] and reports the number of
//!   bytes written once the resource completes.
//! - [`ReadAdapter`] hands every chunk of a readable resource to a data callback, pausing the
//!   resource when the callback asks for it.
//! - [`DuplexAdapter`] runs both over one resource and reports a single outcome.
//!
//! Every adapter session ends exactly once: with `on_end`, with `on_error`, or silently when its
//! [`CancellationToken`] is triggered. Once a session has ended, it stops listening to the
//! resource, except for failures, which it keeps absorbing for a short grace window (see
//! [`Options`]) so that failures caused by tearing the resource down are not reported as
//! unhandled.
//!
//! # Threading
//!
//! Everything here is single-threaded. Resources are shared as `Rc<R>`, callbacks run on the
//! thread that raised the notification, and the grace window runs on a local executor through a
//! [`DelayScheduler`].
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "test-util")]
//! # fn main() {
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use futures::executor::LocalPool;
//! use stream_lifecycle::testing::FakeResource;
//! use stream_lifecycle::{CancellationToken, DelayScheduler, ErrorKind, Resource, WriteAdapter};
//! use tick::ClockControl;
//!
//! let control = ClockControl::new();
//! let mut pool = LocalPool::new();
//! let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
//!
//! let resource = Rc::new(FakeResource::writable());
//! let token = CancellationToken::new();
//!
//! let writer = WriteAdapter::builder(Rc::clone(&resource))
//!     .cancellation(&token)
//!     .on_end(|_| unreachable!("the resource never completes"))
//!     .on_error(|error| assert_eq!(error.kind(), ErrorKind::ClosedBeforeCompletion))
//!     .start(&scheduler);
//!
//! let _ = writer.write("partial");
//! let _ = resource.emit_closed_abnormally();
//! assert!(!writer.is_active());
//!
//! // A failure raised by the closed resource within the grace window is absorbed.
//! let _ = resource.emit_failed("connection reset");
//! assert_eq!(resource.unhandled_failures(), 0);
//!
//! control.advance(Duration::from_millis(100));
//! pool.run_until_stalled();
//! assert!(resource.subscribers().subscribed_channels().is_empty());
//! # }
//! # #[cfg(not(feature = "test-util"))]
//! # fn main() {}
//! ```
//!
//! # Features
//!
//! - `test-util`: enables the [`testing`] module with a scriptable in-memory resource.
//! - `serde`: implements `Serialize` and `Deserialize` for [`Options`].

mod callbacks;
mod cancellation;
mod duplex;
mod error;
mod notification;
mod options;
mod read;
mod resource;
mod scheduler;
mod session;
mod subscribers;
mod write;

pub use callbacks::Flow;
pub use cancellation::{CancelSubscription, CancellationToken};
pub use duplex::{Duplex, DuplexAdapter, DuplexAdapterBuilder};
pub use error::{BoxError, ErrorKind, StreamError};
pub use notification::{Channel, Failure, Notification};
pub use options::{DEFAULT_GRACE_WINDOW, Options};
pub use read::{ReadAdapter, ReadAdapterBuilder, ReadHandle};
pub use resource::{Capabilities, Resource, WriteStatus};
pub use scheduler::{DelayScheduler, DelayedTask, ScheduleError};
pub use subscribers::{Delivery, Handler, Subscribers, SubscriptionId};
pub use write::{WriteAdapter, WriteAdapterBuilder, WriteInput, Writer};

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;
