//! Single-shot context timers.
//!
//! Each live context owns at most one timer. Arming spawns a task that races
//! the deadline against a [`CancellationToken`]; whichever finishes first
//! wins. A fired timer is only a message: the event loop confirms it with
//! [`TimeoutScheduler::take_fired`] before acting, so a timer that raced a
//! normal flush (or belongs to an earlier context under the same key) is
//! ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::context::ContextKey;

/// Message sent when a context's deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub key: ContextKey,
    pub epoch: u64,
}

#[derive(Debug)]
struct ArmedTimer {
    epoch: u64,
    deadline: Instant,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct TimeoutScheduler {
    delay: Duration,
    timers: HashMap<ContextKey, ArmedTimer>,
    fired_tx: mpsc::Sender<TimerFired>,
}

impl TimeoutScheduler {
    #[must_use]
    pub fn new(delay: Duration, fired_tx: mpsc::Sender<TimerFired>) -> Self {
        Self {
            delay,
            timers: HashMap::new(),
            fired_tx,
        }
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer for `key`, replacing any earlier one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&mut self, key: ContextKey, epoch: u64) -> Instant {
        self.cancel(&key);
        let deadline = Instant::now() + self.delay;
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let tx = self.fired_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = sleep_until(deadline) => {
                    let _ = tx.send(TimerFired { key, epoch }).await;
                }
            }
        });
        self.timers.insert(
            key,
            ArmedTimer {
                epoch,
                deadline,
                cancel,
            },
        );
        deadline
    }

    /// Cancel the timer for `key`. Returns false if none was armed.
    pub fn cancel(&mut self, key: &ContextKey) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Accept a fired timer if it still matches the armed one.
    pub fn take_fired(&mut self, fired: &TimerFired) -> bool {
        match self.timers.get(&fired.key) {
            Some(timer) if timer.epoch == fired.epoch => {
                self.timers.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn deadline(&self, key: &ContextKey) -> Option<Instant> {
        self.timers.get(key).map(|timer| timer.deadline)
    }

    #[must_use]
    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel.cancel();
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AttributionSrcToken, NavigationId};

    fn scheduler(delay_ms: u64) -> (TimeoutScheduler, mpsc::Receiver<TimerFired>) {
        let (tx, rx) = mpsc::channel(16);
        (TimeoutScheduler::new(Duration::from_millis(delay_ms), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (mut timers, mut rx) = scheduler(5_000);
        let key = ContextKey::Token(AttributionSrcToken::new());
        timers.arm(key, 1);

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, TimerFired { key, epoch: 1 });
        assert!(timers.take_fired(&fired));
        assert!(!timers.take_fired(&fired), "fires once");
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = scheduler(100);
        let key = ContextKey::Navigation(NavigationId::new(1));
        timers.arm(key, 1);
        assert!(timers.cancel(&key));
        assert!(!timers.cancel(&key));

        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_discards_stale_epoch() {
        let (mut timers, mut rx) = scheduler(100);
        let key = ContextKey::Navigation(NavigationId::new(2));
        timers.arm(key, 1);
        timers.arm(key, 2);
        assert_eq!(timers.armed(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.epoch, 2);
        assert!(!timers.take_fired(&TimerFired { key, epoch: 1 }));
        assert!(timers.take_fired(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_reported() {
        let (mut timers, _rx) = scheduler(250);
        let key = ContextKey::Navigation(NavigationId::new(3));
        let deadline = timers.arm(key, 7);
        assert_eq!(timers.deadline(&key), Some(deadline));
        timers.cancel_all();
        assert_eq!(timers.deadline(&key), None);
    }
}
