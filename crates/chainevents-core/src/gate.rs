//! Delivery gate: guards the state of one registration so it can be closed
//! synchronously while a callback may be running on another thread.
//!
//! After [`Gate::close`] returns, no closure passed to [`Gate::enter`] runs
//! again.
//!
//! Closing from inside any gate's callback never waits. For the gate's own
//! callback this is the only option. For another gate, waiting could
//! deadlock against a thread closing in the opposite direction (a block
//! callback removing one commit listener while a disconnect callback removes
//! another). In that case the other gate refuses new entries at once, but a
//! callback already running on another thread may still be finishing when
//! `close` returns.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

thread_local! {
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Entered(usize);

impl Entered {
    fn push(id: usize) -> Self {
        ENTERED.with(|stack| stack.borrow_mut().push(id));
        Self(id)
    }

    /// Whether this thread is inside any gate's callback.
    fn active() -> bool {
        ENTERED.with(|stack| !stack.borrow().is_empty())
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        ENTERED.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.0) {
                stack.remove(pos);
            }
        });
    }
}

pub(crate) struct Gate<T> {
    open: AtomicBool,
    state: Mutex<T>,
}

impl<T> Gate<T> {
    pub(crate) fn new(state: T) -> Self {
        Self {
            open: AtomicBool::new(true),
            state: Mutex::new(state),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the state if the gate is still open.
    pub(crate) fn enter<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if !self.is_open() {
            return None;
        }
        let mut state = self.lock();
        // Closed while we waited for the lock.
        if !self.is_open() {
            return None;
        }
        let _entered = Entered::push(self.id());
        Some(f(&mut state))
    }

    /// Close the gate, waiting for an in-flight `enter` on another thread
    /// unless called from inside a gate callback.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if Entered::active() {
            return;
        }
        drop(self.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn closed_gate_skips_callbacks() {
        let gate = Gate::new(0u32);
        assert_eq!(gate.enter(|n| {
            *n += 1;
            *n
        }), Some(1));

        gate.close();
        assert!(!gate.is_open());
        assert_eq!(gate.enter(|n| *n), None);
    }

    #[test]
    fn close_from_inside_callback_does_not_deadlock() {
        let gate = Arc::new(Gate::new(()));
        let inner = gate.clone();
        gate.enter(|_| inner.close());
        assert!(!gate.is_open());
    }

    #[test]
    fn close_waits_for_in_flight_callback() {
        let gate = Arc::new(Gate::new(Vec::<&'static str>::new()));
        let (started_tx, started_rx) = mpsc::channel();

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.enter(|log| {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    log.push("callback");
                });
            })
        };

        started_rx.recv().unwrap();
        gate.close();
        // The callback must have finished before close returned.
        assert_eq!(*gate.lock(), vec!["callback"]);
        worker.join().unwrap();
    }

    #[test]
    fn crossed_closes_from_two_callbacks_do_not_deadlock() {
        let a = Arc::new(Gate::new(()));
        let b = Arc::new(Gate::new(()));
        let both_inside = Arc::new(Barrier::new(2));

        let spawn = |mine: Arc<Gate<()>>, other: Arc<Gate<()>>, barrier: Arc<Barrier>| {
            thread::spawn(move || {
                mine.enter(|_| {
                    barrier.wait();
                    other.close();
                });
            })
        };
        let first = spawn(a.clone(), b.clone(), both_inside.clone());
        let second = spawn(b.clone(), a.clone(), both_inside);

        first.join().unwrap();
        second.join().unwrap();
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert_eq!(a.enter(|_| ()), None);
    }
}
