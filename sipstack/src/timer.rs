//! One-shot resettable timers with snapshot support.
//!
//! Transactions never serialize a live timer; a [`TimerSnapshot`] keeps the
//! remaining duration so a restored transaction can re-arm and keep
//! counting.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

type TimerFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The named RFC 3261 §17 timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TimerKind {
    A,
    B,
    D,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
}

/// A one-shot timer handle.
///
/// The callback runs at most once per arming; `reset` re-arms with the same
/// callback. A fired or stopped timer holds no deadline and snapshots to
/// `None`.
#[derive(Clone)]
pub struct TsxTimer(Arc<TimerInner>);

struct TimerInner {
    callback: TimerFn,
    deadline: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
    fired: AtomicBool,
}

impl TsxTimer {
    /// Schedules `f` to run once after `duration`.
    pub fn schedule<F, Fut>(duration: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = TsxTimer(Arc::new(TimerInner {
            callback: Arc::new(move || Box::pin(f()) as BoxFuture<'static, ()>),
            deadline: Mutex::new(None),
            task: Mutex::new(None),
            fired: AtomicBool::new(false),
        }));
        timer.arm(duration);

        timer
    }

    fn arm(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        *self.0.deadline.lock().expect("Lock failed") = Some(deadline);

        let inner = self.0.clone();
        let task = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            inner.fired.store(true, Ordering::SeqCst);
            *inner.deadline.lock().expect("Lock failed") = None;
            (inner.callback)().await;
        });

        let old = self.0.task.lock().expect("Lock failed").replace(task);
        if let Some(old) = old {
            old.abort();
        }
    }

    /// Restarts the timer with a new duration.
    ///
    /// Returns whether the prior arming had already fired.
    pub fn reset(&self, duration: Duration) -> bool {
        let had_fired = self.0.fired.swap(false, Ordering::SeqCst);
        self.arm(duration);

        had_fired
    }

    /// Cancels the timer. A stale callback that already started is not
    /// interrupted; handlers are expected to re-check state.
    pub fn stop(&self) {
        if let Some(task) = self.0.task.lock().expect("Lock failed").take() {
            task.abort();
        }
        *self.0.deadline.lock().expect("Lock failed") = None;
    }

    /// Returns whether the current arming has fired.
    pub fn has_fired(&self) -> bool {
        self.0.fired.load(Ordering::SeqCst)
    }

    /// Captures the remaining duration, or `None` once fired or stopped.
    pub fn snapshot(&self) -> Option<TimerSnapshot> {
        let deadline = (*self.0.deadline.lock().expect("Lock failed"))?;
        let remaining = deadline.saturating_duration_since(Instant::now());

        Some(TimerSnapshot {
            deadline: SystemTime::now() + remaining,
            remaining,
        })
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().expect("Lock failed").take() {
            task.abort();
        }
    }
}

/// The persisted form of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    /// Absolute wall-clock deadline.
    pub deadline: SystemTime,
    /// Duration left at capture time.
    pub remaining: Duration,
}

/// The set of timers owned by one transaction, keyed by [`TimerKind`].
#[derive(Default)]
pub struct TimerBag {
    timers: Mutex<HashMap<TimerKind, TsxTimer>>,
}

impl TimerBag {
    /// Arms `kind` to run `f` after `duration`, replacing any prior arming.
    pub fn arm<F, Fut>(&self, kind: TimerKind, duration: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = TsxTimer::schedule(duration, f);
        let old = self.timers.lock().expect("Lock failed").insert(kind, timer);
        if let Some(old) = old {
            old.stop();
        }
    }

    /// Restarts `kind` with a new duration, keeping its callback.
    ///
    /// Returns `None` when the timer was never armed.
    pub fn reset(&self, kind: TimerKind, duration: Duration) -> Option<bool> {
        let timer = self.timers.lock().expect("Lock failed").get(&kind).cloned();

        timer.map(|timer| timer.reset(duration))
    }

    /// Stops `kind` if armed.
    pub fn stop(&self, kind: TimerKind) {
        if let Some(timer) = self.timers.lock().expect("Lock failed").remove(&kind) {
            timer.stop();
        }
    }

    /// Stops every timer in the bag.
    pub fn stop_all(&self) {
        for (_, timer) in self.timers.lock().expect("Lock failed").drain() {
            timer.stop();
        }
    }

    /// Captures all armed timers.
    pub fn snapshot(&self) -> BTreeMap<TimerKind, TimerSnapshot> {
        self.timers
            .lock()
            .expect("Lock failed")
            .iter()
            .filter_map(|(kind, timer)| timer.snapshot().map(|snap| (*kind, snap)))
            .collect()
    }
}
