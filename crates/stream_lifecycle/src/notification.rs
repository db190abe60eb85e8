// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::BoxError;

/// The notification channels a [`Resource`][crate::Resource] raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A chunk of data arrived.
    Data,

    /// The resource has room for more writes again.
    Drain,

    /// The resource finished normally.
    Completed,

    /// The resource closed, with or without having completed first.
    ClosedAbnormally,

    /// The resource failed.
    Failed,
}

impl Channel {
    /// All channels, in a stable order.
    pub const ALL: [Self; 5] = [Self::Data, Self::Drain, Self::Completed, Self::ClosedAbnormally, Self::Failed];

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Data => 0,
            Self::Drain => 1,
            Self::Completed => 2,
            Self::ClosedAbnormally => 3,
            Self::Failed => 4,
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Drain => "drain",
            Self::Completed => "completed",
            Self::ClosedAbnormally => "closed",
            Self::Failed => "failed",
        };

        f.write_str(name)
    }
}

/// A notification raised by a [`Resource`][crate::Resource].
#[derive(Debug, Clone)]
pub enum Notification {
    /// A chunk of data arrived.
    Data(Bytes),

    /// The resource has room for more writes again.
    Drained,

    /// The resource finished normally.
    Completed,

    /// The resource closed. When raised before [`Completed`][Self::Completed], the resource went
    /// away mid-stream.
    ClosedAbnormally,

    /// The resource failed.
    Failed(Failure),
}

impl Notification {
    /// The channel this notification is raised on.
    #[must_use]
    pub fn channel(&self) -> Channel {
        match self {
            Self::Data(_) => Channel::Data,
            Self::Drained => Channel::Drain,
            Self::Completed => Channel::Completed,
            Self::ClosedAbnormally => Channel::ClosedAbnormally,
            Self::Failed(_) => Channel::Failed,
        }
    }
}

/// The error carried by a [`Notification::Failed`].
///
/// Cloning is cheap; all clones share the same underlying error.
#[derive(Clone)]
pub struct Failure(Arc<dyn Error + Send + Sync + 'static>);

impl Failure {
    /// Wraps a resource error.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(Arc::from(error.into()))
    }
}

impl Debug for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn channel_of_notification() {
        assert_eq!(Notification::Data(Bytes::from_static(b"x")).channel(), Channel::Data);
        assert_eq!(Notification::Drained.channel(), Channel::Drain);
        assert_eq!(Notification::Completed.channel(), Channel::Completed);
        assert_eq!(Notification::ClosedAbnormally.channel(), Channel::ClosedAbnormally);
        assert_eq!(Notification::Failed(Failure::new("boom")).channel(), Channel::Failed);
    }

    #[test]
    fn channel_indexes_are_distinct() {
        let mut seen = [false; 5];

        for channel in Channel::ALL {
            assert!(!seen[channel.index()]);
            seen[channel.index()] = true;
        }
    }

    #[test]
    fn failure_displays_inner_error() {
        let failure = Failure::new("connection reset");
        let clone = failure.clone();

        assert_eq!(failure.to_string(), "connection reset");
        assert_eq!(clone.to_string(), "connection reset");
    }
}
