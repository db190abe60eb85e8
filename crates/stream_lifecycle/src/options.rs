// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// The default length of the grace window.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(100);

/// Tunables shared by all adapters.
///
/// # Grace window
///
/// Destroying a resource can make it raise a failure notification some time later. After a
/// session terminates for any reason other than a failure, the adapter keeps listening for
/// failures for the duration of the grace window and discards whatever arrives. Without that
/// listener, the late failure would reach nobody and be reported as unhandled.
///
/// The right value depends on how long the I/O runtime takes to tear a resource down. It is
/// a tunable, not a protocol guarantee.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use stream_lifecycle::Options;
///
/// let options = Options::default().grace_window(Duration::from_millis(250));
/// assert_eq!(options.grace_window_duration(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Options {
    #[cfg_attr(feature = "serde", serde(rename = "grace_window_ms", with = "millis"))]
    grace_window: Duration,
}

impl Options {
    /// Sets how long the failure channel stays subscribed after a session terminates.
    ///
    /// **Default**: [`DEFAULT_GRACE_WINDOW`] (100 ms).
    #[must_use]
    pub fn grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// How long the failure channel stays subscribed after a session terminates.
    #[must_use]
    pub fn grace_window_duration(&self) -> Duration {
        self.grace_window
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
        }
    }
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
