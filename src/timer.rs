// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::service::core::Inner;

pub(crate) type TimerCallback = Box<dyn FnMut(bool) + Send>;

/// One scheduled wait. The queue holds these by `Arc`; identity (pointer
/// equality) is what deduplicates and cancels.
pub(crate) struct TimerEntry {
    deadline: Mutex<Instant>,
    period: Mutex<Duration>,
    repeating: AtomicBool,
    cancelled: AtomicBool,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deadline: Mutex::new(Instant::now()),
            period: Mutex::new(Duration::ZERO),
            repeating: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(None),
        })
    }

    pub fn expires_from_now(&self, duration: Duration) {
        *self.deadline.lock() = Instant::now() + duration;
        *self.period.lock() = duration;
    }

    fn rearm(&self) {
        let period = *self.period.lock();
        *self.deadline.lock() = Instant::now() + period;
    }

    pub fn set_repeating(&self, repeating: bool) {
        self.repeating.store(repeating, Ordering::Relaxed);
    }

    pub fn set_callback(&self, callback: TimerCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn expired(&self) -> bool {
        *self.deadline.lock() <= Instant::now()
    }

    pub fn wait_duration(&self) -> Duration {
        self.deadline.lock().saturating_duration_since(Instant::now())
    }
}

/// Timers sorted by remaining wait, longest first, so the earliest
/// deadline sits at the tail for O(1) peek and pop.
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Mutex<Vec<Arc<TimerEntry>>>,
}

impl TimerQueue {
    /// Inserts `timer` unless already queued. Returns whether it became
    /// the earliest deadline, in which case the caller must interrupt the
    /// readiness wait so the new deadline bounds it.
    pub fn schedule(&self, timer: &Arc<TimerEntry>) -> bool {
        timer.cancelled.store(false, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        if entries.iter().any(|t| Arc::ptr_eq(t, timer)) {
            return false;
        }
        entries.push(timer.clone());
        entries.sort_by(|l, r| r.wait_duration().cmp(&l.wait_duration()));
        entries.last().map(|t| Arc::ptr_eq(t, timer)).unwrap_or(false)
    }

    /// Removes `timer` if queued and invokes its callback with
    /// `cancelled=true` on the caller's thread. Unknown timers are a
    /// silent no-op, but are still marked so a concurrent fire skips them.
    pub fn cancel(&self, timer: &Arc<TimerEntry>) {
        timer.mark_cancelled();

        let removed = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|t| Arc::ptr_eq(t, timer)) {
                Some(pos) => {
                    entries.remove(pos);
                    true
                },
                None => false,
            }
        };

        // Outside the queue lock: the callback may re-enter scheduling.
        if removed
            && let Some(mut callback) = timer.callback.lock().take()
        {
            callback(true);
        }
    }

    /// Pops and fires every expired timer. Only the event loop calls
    /// this. Repeating timers advance by their period and are re-queued
    /// unless their own callback cancelled them.
    pub fn fire_expired(&self) {
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock();
            while entries.last().map(|t| t.expired()).unwrap_or(false) {
                if let Some(timer) = entries.pop() {
                    expired.push(timer);
                }
            }
        }
        if expired.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        for timer in expired {
            if timer.cancelled.load(Ordering::Relaxed) {
                continue;
            }
            let Some(mut callback) = timer.callback.lock().take() else {
                continue;
            };
            callback(false);
            if timer.repeating.load(Ordering::Relaxed)
                && !timer.cancelled.load(Ordering::Relaxed)
            {
                timer.rearm();
                timer.callback.lock().replace(callback);
                requeue.push(timer);
            }
        }

        if !requeue.is_empty() {
            let mut entries = self.entries.lock();
            entries.append(&mut requeue);
            entries.sort_by(|l, r| r.wait_duration().cmp(&l.wait_duration()));
        }
    }

    /// Minimum of `cap` and the earliest remaining wait.
    pub fn next_wait(&self, cap: Duration) -> Duration {
        let entries = self.entries.lock();
        match entries.last() {
            Some(earliest) => cap.min(earliest.wait_duration()),
            None => cap,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A one-shot or repeating wait bound to a service.
///
/// The service only keeps the entry queued while a wait is armed;
/// dropping the timer cancels any pending wait, so a callback never
/// outlives the handle that armed it.
pub struct DeadlineTimer {
    service: Weak<Inner>,
    entry: Arc<TimerEntry>,
}

impl DeadlineTimer {
    pub fn new(service: &crate::service::IoService) -> Self {
        Self {
            service: Arc::downgrade(service.inner()),
            entry: TimerEntry::new(),
        }
    }

    pub fn expires_from_now(&self, duration: Duration) {
        self.entry.expires_from_now(duration);
    }

    pub fn set_repeating(&self, repeating: bool) {
        self.entry.set_repeating(repeating);
    }

    pub fn expired(&self) -> bool {
        self.entry.expired()
    }

    /// Arms the wait: `callback` fires with `cancelled=false` when the
    /// deadline elapses, or `cancelled=true` from [`cancel`](Self::cancel).
    pub fn async_wait(&self, callback: impl FnMut(bool) + Send + 'static) {
        self.entry.set_callback(Box::new(callback));
        if let Some(inner) = self.service.upgrade() {
            inner.schedule_timer(&self.entry);
        }
    }

    pub fn cancel(&self) {
        if self.entry.expired() {
            return;
        }
        if let Some(inner) = self.service.upgrade() {
            inner.cancel_timer(&self.entry);
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
