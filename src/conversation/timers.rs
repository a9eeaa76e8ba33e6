//! # Timers
//!
//! Delayed and periodic callbacks with explicit cancel handles.
//!
//! Every conversation owns its timers through [`TimerSlot`]s. A slot holds at most one
//! live timer: installing a new one cancels the previous one under the slot lock, which
//! is what makes "refresh" an atomic cancel-and-reschedule.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a scheduled callback. Dropping the handle does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once the callback ran to completion or the timer was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run `callback` once after `delay`.
pub fn schedule_once<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        callback.await;
    });
    TimerHandle {
        task: task.abort_handle(),
    }
}

/// Run `tick` every `period`, first after one full period.
///
/// A tick is awaited before the next one is scheduled, so slow ticks never overlap.
pub fn schedule_every<F, Fut>(period: Duration, mut tick: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    });
    TimerHandle {
        task: task.abort_handle(),
    }
}

/// Owner of at most one live timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    current: Mutex<Option<TimerHandle>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle`, cancelling whatever the slot held before.
    pub fn replace(&self, handle: TimerHandle) {
        let mut current = self.current.lock();
        if let Some(previous) = current.replace(handle) {
            previous.cancel();
        }
    }

    /// Cancel the held timer. Returns true if one was still pending.
    pub fn cancel(&self) -> bool {
        match self.current.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.cancel();
                pending
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
