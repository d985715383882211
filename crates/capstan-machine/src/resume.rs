use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// How a parked operation was woken.
#[derive(Clone, Debug, PartialEq)]
pub enum Woken<T> {
    /// The bridge delivered the matching resolution job.
    Resolved(T),
    /// The operation was cancelled before the bridge resolved it.
    Cancelled,
    /// The run was removed from the cache; the value never arrives.
    Evicted,
}

enum SlotState<T> {
    Pending { waker: Option<Waker> },
    Ready(Woken<T>),
    Taken,
}

/// Producer half of a resume pair, held in a pending table.
///
/// Single assignment: the first `resolve` wins and wakes the waiter, later
/// calls are ignored. This is what makes cancel-then-resolve deliver exactly
/// one wake.
pub struct ResumeSlot<T> {
    inner: Rc<RefCell<SlotState<T>>>,
}

/// Consumer half, awaited by workflow code.
pub struct ResumeToken<T> {
    inner: Rc<RefCell<SlotState<T>>>,
}

impl<T> std::fmt::Debug for ResumeToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeToken").finish_non_exhaustive()
    }
}

/// A fresh, unresolved slot/token pair.
pub fn resume_pair<T>() -> (ResumeSlot<T>, ResumeToken<T>) {
    let inner = Rc::new(RefCell::new(SlotState::Pending { waker: None }));
    (
        ResumeSlot {
            inner: inner.clone(),
        },
        ResumeToken { inner },
    )
}

impl<T> ResumeSlot<T> {
    pub fn resolve(&self, value: Woken<T>) {
        let mut state = self.inner.borrow_mut();
        if let SlotState::Pending { waker } = &mut *state {
            let waker = waker.take();
            *state = SlotState::Ready(value);
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.borrow(), SlotState::Pending { .. })
    }
}

impl<T> ResumeToken<T> {
    /// True once a value has been stored, whether or not it was consumed.
    pub fn is_resolved(&self) -> bool {
        !matches!(&*self.inner.borrow(), SlotState::Pending { .. })
    }
}

impl<T> Future for ResumeToken<T> {
    type Output = Woken<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.borrow_mut();
        match &mut *state {
            SlotState::Pending { waker } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            SlotState::Ready(_) => {
                let SlotState::Ready(value) = std::mem::replace(&mut *state, SlotState::Taken)
                else {
                    unreachable!("state checked above");
                };
                Poll::Ready(value)
            }
            // A token is consumed by at most one await.
            SlotState::Taken => Poll::Pending,
        }
    }
}
