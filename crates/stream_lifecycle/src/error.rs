// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};

/// A boxed error raised by caller-supplied callbacks or by resources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Describes why an adapter session ended with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The resource closed before it signaled completion.
    ///
    /// This indicates that the resource went away mid-stream, for example because it was
    /// destroyed by code outside the adapter.
    ClosedBeforeCompletion,

    /// The resource raised a failure notification. The resource error is attached as the cause.
    Failed,

    /// A caller-supplied callback returned an error. The callback error is attached as the cause.
    Callback,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClosedBeforeCompletion => f.write_str("stream closed before completion"),
            Self::Failed => f.write_str("stream failed"),
            Self::Callback => f.write_str("stream callback failed"),
        }
    }
}

/// An error delivered to the `on_error` callback of an adapter.
///
/// Every error carries an [`ErrorKind`] that tells closed-before-completion apart from genuine
/// resource failures and from faults raised by caller-supplied callbacks. The underlying error,
/// if any, is available through [`std::error::Error::source`].
///
/// Cancellation is never reported as an error.
#[ohno::error]
#[display("{kind}")]
pub struct StreamError {
    kind: ErrorKind,
}

impl StreamError {
    pub(crate) fn closed_before_completion() -> Self {
        Self::new(ErrorKind::ClosedBeforeCompletion)
    }

    pub(crate) fn failed(cause: impl Into<BoxError>) -> Self {
        Self::caused_by(ErrorKind::Failed, cause)
    }

    pub(crate) fn callback(cause: impl Into<BoxError>) -> Self {
        Self::caused_by(ErrorKind::Callback, cause)
    }

    /// Returns the kind of failure this error represents.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns `true` if the resource closed before signaling completion.
    #[must_use]
    pub fn is_closed_before_completion(&self) -> bool {
        self.kind == ErrorKind::ClosedBeforeCompletion
    }
}
