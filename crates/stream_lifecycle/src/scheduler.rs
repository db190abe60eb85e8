// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellable delayed tasks on a single-threaded executor.

use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{AbortHandle, LocalBoxFuture, abortable};
use futures::task::{LocalSpawn, LocalSpawnExt};
use tick::Clock;

use crate::CancellationToken;

type SpawnFn = dyn Fn(LocalBoxFuture<'static, ()>);

/// An error returned when a delayed task could not be handed to the executor.
#[ohno::error]
#[display("failed to schedule delayed task")]
pub struct ScheduleError;

/// Schedules cancellable delayed tasks.
///
/// The scheduler measures time with a [`Clock`] and runs tasks on a single-threaded executor,
/// supplied either as any [`LocalSpawn`] implementation or as a custom spawn function. Adapters
/// use it to keep listening for failures for a short grace window after they terminate.
///
/// # Examples
///
/// Using the `futures` local executor:
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use std::time::Duration;
///
/// use futures::executor::LocalPool;
/// use stream_lifecycle::DelayScheduler;
/// use tick::ClockControl;
///
/// let control = ClockControl::new();
/// let mut pool = LocalPool::new();
/// let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
///
/// let fired = Rc::new(Cell::new(false));
/// let _task = scheduler.schedule(Duration::from_millis(100), {
///     let fired = Rc::clone(&fired);
///     move || fired.set(true)
/// })?;
///
/// pool.run_until_stalled();
/// assert!(!fired.get());
///
/// control.advance(Duration::from_millis(100));
/// pool.run_until_stalled();
/// assert!(fired.get());
/// # Ok::<(), stream_lifecycle::ScheduleError>(())
/// ```
///
/// With Tokio, a custom spawn function hands the task to the current `LocalSet`:
///
/// ```ignore
/// let scheduler = DelayScheduler::new_custom(Clock::new_tokio(), |task| {
///     tokio::task::spawn_local(task);
/// });
/// ```
#[derive(Clone)]
pub struct DelayScheduler {
    clock: Clock,
    spawner: SpawnerKind,
}

#[derive(Clone)]
enum SpawnerKind {
    Local(Rc<dyn LocalSpawn>),
    Custom(Rc<SpawnFn>),
}

impl DelayScheduler {
    /// Creates a scheduler that spawns its tasks on a [`LocalSpawn`] executor.
    #[must_use]
    pub fn new(clock: Clock, spawner: impl LocalSpawn + 'static) -> Self {
        Self {
            clock,
            spawner: SpawnerKind::Local(Rc::new(spawner)),
        }
    }

    /// Creates a scheduler that hands its tasks to a custom spawn function.
    ///
    /// The function must eventually poll the task to completion on the current thread.
    #[must_use]
    pub fn new_custom(clock: Clock, spawn: impl Fn(LocalBoxFuture<'static, ()>) + 'static) -> Self {
        Self {
            clock,
            spawner: SpawnerKind::Custom(Rc::new(spawn)),
        }
    }

    /// The clock the delays are measured with.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Runs `task` once `delay` has elapsed, unless the returned handle is cancelled first.
    ///
    /// Dropping the returned [`DelayedTask`] does not cancel the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor refuses the task, typically because it has shut down.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + 'static) -> Result<DelayedTask, ScheduleError> {
        let fired = Rc::new(Cell::new(false));
        let clock = self.clock.clone();
        // The delay counts from now, not from whenever the executor first polls the task.
        let deadline = clock.instant().checked_add(delay);

        let (future, handle) = abortable({
            let fired = Rc::clone(&fired);
            async move {
                let remaining = deadline.map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(clock.instant()));
                clock.delay(remaining).await;
                fired.set(true);
                task();
            }
        });

        let future = future.map(drop);

        match &self.spawner {
            SpawnerKind::Local(spawner) => spawner.spawn_local(future).map_err(ScheduleError::caused_by)?,
            SpawnerKind::Custom(spawn) => spawn(future.boxed_local()),
        }

        Ok(DelayedTask { handle, fired })
    }

    /// Triggers `token` once `after` has elapsed.
    ///
    /// This is how a deadline is composed from a cancellation token and the scheduler's clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor refuses the task.
    pub fn cancel_after(&self, token: &CancellationToken, after: Duration) -> Result<DelayedTask, ScheduleError> {
        let token = token.clone();
        self.schedule(after, move || token.cancel())
    }
}

impl Debug for DelayScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let spawner = match self.spawner {
            SpawnerKind::Local(_) => "local",
            SpawnerKind::Custom(_) => "custom",
        };

        f.debug_struct("DelayScheduler")
            .field("clock", &self.clock)
            .field("spawner", &spawner)
            .finish()
    }
}

/// A handle to a task created by [`DelayScheduler::schedule`].
#[derive(Debug)]
pub struct DelayedTask {
    handle: AbortHandle,
    fired: Rc<Cell<bool>>,
}

impl DelayedTask {
    /// Prevents the task from running if it has not run yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns `true` while the task has neither run nor been cancelled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.fired.get() && !self.handle.is_aborted()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use futures::executor::LocalPool;
    use tick::ClockControl;

    use super::*;

    fn flag() -> (Rc<Cell<bool>>, impl FnOnce() + 'static) {
        let flag = Rc::new(Cell::new(false));
        let setter = {
            let flag = Rc::clone(&flag);
            move || flag.set(true)
        };
        (flag, setter)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_not_impl_any!(DelayScheduler: Send, Sync);
        static_assertions::assert_impl_all!(DelayScheduler: Clone, Debug);
    }

    #[test]
    fn task_runs_after_delay() {
        let control = ClockControl::new();
        let mut pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let (fired, setter) = flag();

        let task = scheduler.schedule(Duration::from_millis(100), setter).unwrap();
        pool.run_until_stalled();
        assert!(task.is_pending());

        control.advance(Duration::from_millis(99));
        pool.run_until_stalled();
        assert!(!fired.get());

        control.advance(Duration::from_millis(1));
        pool.run_until_stalled();
        assert!(fired.get());
        assert!(!task.is_pending());
    }

    #[test]
    fn cancelled_task_never_runs() {
        let control = ClockControl::new();
        let mut pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let (fired, setter) = flag();

        let task = scheduler.schedule(Duration::from_millis(100), setter).unwrap();
        pool.run_until_stalled();
        task.cancel();
        assert!(!task.is_pending());

        control.advance(Duration::from_secs(1));
        pool.run_until_stalled();
        assert!(!fired.get());
    }

    #[test]
    fn dropped_handle_does_not_cancel() {
        let control = ClockControl::new();
        let mut pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let (fired, setter) = flag();

        drop(scheduler.schedule(Duration::from_millis(10), setter).unwrap());

        control.advance(Duration::from_millis(10));
        pool.run_until_stalled();
        assert!(fired.get());
    }

    #[test]
    fn custom_spawner_receives_task() {
        let control = ClockControl::new();
        let pool = Rc::new(std::cell::RefCell::new(LocalPool::new()));
        let spawner = pool.borrow().spawner();
        let scheduler = DelayScheduler::new_custom(control.to_clock(), move |task| {
            spawner.spawn_local(task).unwrap();
        });
        let (fired, setter) = flag();

        let _task = scheduler.schedule(Duration::from_millis(5), setter).unwrap();
        control.advance(Duration::from_millis(5));
        pool.borrow_mut().run_until_stalled();

        assert!(fired.get());
    }

    #[test]
    fn cancel_after_triggers_token() {
        let control = ClockControl::new();
        let mut pool = LocalPool::new();
        let scheduler = DelayScheduler::new(control.to_clock(), pool.spawner());
        let token = CancellationToken::new();

        let _task = scheduler.cancel_after(&token, Duration::from_secs(2)).unwrap();
        pool.run_until_stalled();
        assert!(!token.is_cancelled());

        control.advance(Duration::from_secs(2));
        pool.run_until_stalled();
        assert!(token.is_cancelled());
    }

    #[test]
    fn refused_task_is_an_error() {
        let control = ClockControl::new();
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        drop(pool);

        let scheduler = DelayScheduler::new(control.to_clock(), spawner);

        scheduler.schedule(Duration::from_millis(1), || {}).unwrap_err();
    }
}
