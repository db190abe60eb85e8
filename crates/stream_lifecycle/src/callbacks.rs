// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::fmt::{Debug, Formatter};

use bytes::Bytes;

use crate::{BoxError, StreamError};

/// What the data callback of a read adapter asks for after consuming a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Keep delivering data.
    Continue,

    /// Pause the resource.
    ///
    /// The adapter never resumes a paused resource. Whoever asked for the pause, typically
    /// because a downstream sink is itself over capacity, resumes the resource once it drains.
    Pause,
}

/// Defines a shareable, re-entrant callback wrapper around `Rc<dyn Fn(..)>`.
///
/// Invoking the wrapper holds no borrow, so a callback may call back into the adapter that
/// invoked it.
macro_rules! define_callback {
    ($name:ident(Fn($($param:ident: $ty:ty),*) $(-> $ret:ty)?)) => {
        #[derive(Clone)]
        pub(crate) struct $name(std::rc::Rc<dyn Fn($($ty),*) $(-> $ret)?>);

        impl $name {
            pub(crate) fn new(f: impl Fn($($ty),*) $(-> $ret)? + 'static) -> Self {
                Self(std::rc::Rc::new(f))
            }

            pub(crate) fn call(&self, $($param: $ty),*) $(-> $ret)? {
                (self.0)($($param),*)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish()
            }
        }
    };
}

define_callback!(OnData(Fn(chunk: Bytes) -> Result<Flow, BoxError>));
define_callback!(OnSignal(Fn()));

/// A callback that can be invoked at most once.
///
/// Taking the callback out of the slot before invoking it is what makes terminal callbacks
/// exactly-once even when they re-enter the adapter.
pub(crate) struct OnceSlot<F: ?Sized>(Cell<Option<Box<F>>>);

impl<F: ?Sized> OnceSlot<F> {
    pub(crate) fn new(f: Option<Box<F>>) -> Self {
        Self(Cell::new(f))
    }

    pub(crate) fn take(&self) -> Option<Box<F>> {
        self.0.take()
    }

    pub(crate) fn replace(&self, f: Option<Box<F>>) {
        self.0.set(f);
    }

    pub(crate) fn is_set(&self) -> bool {
        let f = self.0.take();
        let is_set = f.is_some();
        self.0.set(f);
        is_set
    }
}

impl<F: ?Sized> Debug for OnceSlot<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OnceSlot").field(&self.is_set()).finish()
    }
}

pub(crate) type OnError = OnceSlot<dyn FnOnce(StreamError)>;
pub(crate) type OnAbort = OnceSlot<dyn FnOnce()>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn callback_forwards_arguments() {
        let on_data = OnData::new(|chunk| Ok(if chunk.len() > 2 { Flow::Pause } else { Flow::Continue }));

        assert_eq!(on_data.call(Bytes::from_static(b"ab")).unwrap(), Flow::Continue);
        assert_eq!(on_data.call(Bytes::from_static(b"abc")).unwrap(), Flow::Pause);
        assert_eq!(format!("{on_data:?}"), "OnData");
    }

    #[test]
    fn once_slot_yields_callback_once() {
        let count = Rc::new(Cell::new(0));
        let slot: OnAbort = OnceSlot::new(Some(Box::new({
            let count = Rc::clone(&count);
            move || count.set(count.get() + 1)
        })));

        assert!(slot.is_set());
        if let Some(f) = slot.take() {
            f();
        }
        assert!(!slot.is_set());
        assert!(slot.take().is_none());
        assert_eq!(count.get(), 1);
    }
}
