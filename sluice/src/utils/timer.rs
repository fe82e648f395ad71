use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use tokio::time::{Instant, Sleep};

/// A timer tracking the earliest of a changing set of deadlines.
///
/// It can be in one of two states: armed or unarmed.
/// Waiting for an armed timer resolves when the timer's deadline is reached.
/// Waiting for an unarmed timer resolves after the timer is armed and its new
/// deadline is reached. A timer resolves once per arming.
pub(crate) struct DeadlineTimer {
    state: DeadlineTimerState,
}

enum DeadlineTimerState {
    /// The timer is not set, but somebody may be waiting for it.
    Unarmed(Option<Waker>),

    /// The timer is set.
    Armed(Pin<Box<Sleep>>),
}

impl Default for DeadlineTimer {
    fn default() -> Self {
        Self {
            state: DeadlineTimerState::Unarmed(None),
        }
    }
}

impl DeadlineTimer {
    /// Creates a new, unarmed timer.
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Arms the timer to fire at the specified moment, replacing any previous deadline.
    ///
    /// If the moment has already passed, the timer becomes ready at once.
    pub(crate) fn arm(&mut self, deadline: Instant) {
        match &mut self.state {
            DeadlineTimerState::Unarmed(maybe_waker) => {
                if let Some(waker) = maybe_waker.take() {
                    // The waker cannot be moved onto the new Sleep,
                    // so wake it and let it be registered again on the next poll.
                    waker.wake();
                }
                self.state =
                    DeadlineTimerState::Armed(Box::pin(tokio::time::sleep_until(deadline)));
            }
            DeadlineTimerState::Armed(sleep) => sleep.as_mut().reset(deadline),
        }
    }

    /// Arms the timer unless it is already armed for an earlier moment.
    pub(crate) fn arm_if_earlier(&mut self, deadline: Instant) {
        match self.deadline() {
            Some(current) if current <= deadline => {}
            _ => self.arm(deadline),
        }
    }

    /// Disarms the timer. Whoever waits for it keeps waiting for the next arming.
    pub(crate) fn disarm(&mut self) {
        if let DeadlineTimerState::Armed(_) = self.state {
            self.state = DeadlineTimerState::Unarmed(None);
        }
    }

    /// Gets the current deadline of the timer, or returns `None` if it is unarmed.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match &self.state {
            DeadlineTimerState::Unarmed(_) => None,
            DeadlineTimerState::Armed(sleep) => Some(sleep.deadline()),
        }
    }
}

impl Future for DeadlineTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            DeadlineTimerState::Unarmed(maybe_waker) => {
                *maybe_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            DeadlineTimerState::Armed(sleep) => match sleep.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(_) => {
                    self.state = DeadlineTimerState::Unarmed(None);
                    Poll::Ready(())
                }
            },
        }
    }
}
