//! Waker bookkeeping and the settable async signals backing `ready`/`closed`.

use super::error::StreamError;
use crate::platform::SharedPtr;
use parking_lot::Mutex;
use std::future::Future;
use std::task::{Context, Poll, Waker};

/// A lightweight, thread-safe set storing multiple wakers.
/// It ensures wakers are stored without duplicates (based on `will_wake`).
#[derive(Clone, Default)]
pub(crate) struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub fn new() -> Self {
        WakerSet(SharedPtr::new(Mutex::new(Vec::new())))
    }

    /// Adds a waker to the set.
    /// If a waker that would wake the same task is already present, it does not add a duplicate.
    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake all registered wakers and clear the set.
    pub fn wake_all(&self) {
        let mut wakers = self.0.lock();
        for waker in wakers.drain(..) {
            waker.wake();
        }
    }
}

#[derive(Clone, Debug)]
enum SignalState {
    Pending,
    Resolved,
    Rejected(StreamError),
}

struct SignalCell {
    state: SignalState,
    /// Once latched, no later transition may touch the signal. Used when a
    /// writer is released: the rejection must survive later stream activity.
    latched: bool,
    wakers: Vec<Waker>,
}

/// A settable, re-creatable async signal: pending until resolved or rejected,
/// with the pending phase re-enterable while backpressure toggles.
///
/// Futures obtained from [`DeferredSignal::wait`] observe the signal's current
/// settlement each time they are polled.
#[derive(Clone)]
pub(crate) struct DeferredSignal {
    cell: SharedPtr<Mutex<SignalCell>>,
}

impl DeferredSignal {
    pub fn new_pending() -> Self {
        DeferredSignal {
            cell: SharedPtr::new(Mutex::new(SignalCell {
                state: SignalState::Pending,
                latched: false,
                wakers: Vec::new(),
            })),
        }
    }

    fn wake(cell: &mut SignalCell) {
        for waker in cell.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Settle the signal successfully. No-op once settled or latched.
    pub fn resolve(&self) {
        let mut cell = self.cell.lock();
        if cell.latched || !matches!(cell.state, SignalState::Pending) {
            return;
        }
        cell.state = SignalState::Resolved;
        Self::wake(&mut cell);
    }

    /// Settle the signal with an error. Replaces a resolved signal; an earlier
    /// rejection wins over a later one. No-op once latched.
    pub fn reject(&self, err: StreamError) {
        let mut cell = self.cell.lock();
        if cell.latched || matches!(cell.state, SignalState::Rejected(_)) {
            return;
        }
        cell.state = SignalState::Rejected(err);
        Self::wake(&mut cell);
    }

    /// Replace the signal with a fresh pending one (backpressure re-applied).
    /// No-op once latched.
    pub fn reset_pending(&self) {
        let mut cell = self.cell.lock();
        if cell.latched {
            return;
        }
        cell.state = SignalState::Pending;
    }

    /// Force the signal to a terminal rejection that no later transition can
    /// overwrite.
    pub fn latch_rejected(&self, err: StreamError) {
        let mut cell = self.cell.lock();
        if cell.latched {
            return;
        }
        cell.state = SignalState::Rejected(err);
        cell.latched = true;
        Self::wake(&mut cell);
    }

    /// A future that settles with the signal.
    pub fn wait(&self) -> impl Future<Output = Result<(), StreamError>> {
        let cell = SharedPtr::clone(&self.cell);
        futures::future::poll_fn(move |cx: &mut Context<'_>| {
            let mut cell = cell.lock();
            match &cell.state {
                SignalState::Resolved => Poll::Ready(Ok(())),
                SignalState::Rejected(err) => Poll::Ready(Err(err.clone())),
                SignalState::Pending => {
                    let waker = cx.waker();
                    if !cell.wakers.iter().any(|w| w.will_wake(waker)) {
                        cell.wakers.push(waker.clone());
                    }
                    Poll::Pending
                }
            }
        })
    }
}
