//! Handshake retry timer

use core::time::Duration;

use alloc::sync::Arc;
use spin::Mutex;

/// Deferred-callback timer provided by the platform
///
/// `schedule` arms (or re-arms) a one-shot deadline; when it expires the
/// platform calls [`ChannelSession::on_notify_timer`](crate::ChannelSession::on_notify_timer).
pub trait NotifyTimer: Send + Sync {
    fn schedule(&self, after: Duration);

    /// Disarm a pending deadline, if any
    fn cancel(&self) {}
}

impl<T: NotifyTimer + ?Sized> NotifyTimer for &T {
    fn schedule(&self, after: Duration) {
        (**self).schedule(after)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

impl<T: NotifyTimer + ?Sized> NotifyTimer for Arc<T> {
    fn schedule(&self, after: Duration) {
        (**self).schedule(after)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

/// What the timer callback decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Handshake still pending; the timer was re-armed for this delay
    Reschedule(Duration),
    /// Nothing left to do
    Stop,
}

#[derive(Debug, Default)]
struct Clock {
    now: Duration,
    deadline: Option<Duration>,
}

/// Timer driven by an explicit virtual clock
///
/// For hosts and tests that step time themselves.
#[derive(Debug, Default)]
pub struct ManualTimer {
    clock: Mutex<Clock>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Armed deadline, in virtual time
    pub fn deadline(&self) -> Option<Duration> {
        self.clock.lock().deadline
    }

    /// Move time forward by `by`
    ///
    /// # Returns
    /// `true` if the armed deadline expired; the deadline is consumed and the
    /// caller runs the timer callback.
    pub fn advance(&self, by: Duration) -> bool {
        let mut clock = self.clock.lock();
        clock.now += by;
        match clock.deadline {
            Some(deadline) if deadline <= clock.now => {
                clock.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl NotifyTimer for ManualTimer {
    fn schedule(&self, after: Duration) {
        let mut clock = self.clock.lock();
        clock.deadline = Some(clock.now + after);
    }

    fn cancel(&self) {
        self.clock.lock().deadline = None;
    }
}
