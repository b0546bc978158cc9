//! Cooperative interrupt and timeout budget for blocking socket calls.
//!
//! Every blocking operation in this crate is sliced into waits of at most
//! [`INTERRUPT_RESOLUTION`], between which the calling thread's interrupt
//! flag and remaining timeout budget are consulted. The flag lives in a
//! thread-local; [`interrupt_handle`] hands out a cloneable handle that any
//! other thread may use to raise it.

use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Granularity at which blocked threads observe interrupts and deadlines.
pub const INTERRUPT_RESOLUTION: Duration = Duration::from_millis(250);

/// Thread-safe handle to one thread's interrupt flag.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Requests that the owning thread unwind from its current blocking
    /// call. Sticky until the owner observes it via [`interrupted`].
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct TaskContext {
    interrupt: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

thread_local! {
    static CURRENT: RefCell<TaskContext> = RefCell::new(TaskContext {
        interrupt: Arc::new(AtomicBool::new(false)),
        deadline: None,
    });
}

/// Handle to the calling thread's interrupt flag.
pub fn interrupt_handle() -> InterruptHandle {
    CURRENT.with(|ctx| InterruptHandle { flag: ctx.borrow().interrupt.clone() })
}

/// Check-and-clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|ctx| ctx.borrow().interrupt.swap(false, Ordering::AcqRel))
}

/// Remaining cooperative timeout budget, or `None` when no budget is
/// installed. Returns `Duration::ZERO` once the budget is exhausted.
pub fn remaining_budget() -> Option<Duration> {
    CURRENT.with(|ctx| {
        ctx.borrow().deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    })
}

/// Runs `f` with a total-timeout budget installed on the calling thread.
/// Nested budgets compose by taking the earlier deadline.
pub fn with_timeout<T>(budget: Duration, f: impl FnOnce() -> T) -> T {
    let deadline = Instant::now() + budget;
    let prev = CURRENT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let prev = ctx.deadline;
        ctx.deadline = Some(prev.map_or(deadline, |p| p.min(deadline)));
        prev
    });

    struct Restore(Option<Instant>);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|ctx| ctx.borrow_mut().deadline = self.0);
        }
    }
    let _restore = Restore(prev);

    f()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn interrupt_is_check_and_clear() {
        assert!(!interrupted());
        let handle = interrupt_handle();
        handle.interrupt();
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn interrupt_crosses_threads() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = thread::spawn(move || {
            tx.send(interrupt_handle()).unwrap();
            while !interrupted() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        rx.recv().unwrap().interrupt();
        worker.join().unwrap();
    }

    #[test]
    fn budgets_nest_to_the_minimum() {
        assert_eq!(remaining_budget(), None);
        with_timeout(Duration::from_secs(60), || {
            let outer = remaining_budget().unwrap();
            assert!(outer <= Duration::from_secs(60));
            with_timeout(Duration::from_secs(3600), || {
                // inner cannot extend the outer budget
                assert!(remaining_budget().unwrap() <= Duration::from_secs(60));
            });
        });
        assert_eq!(remaining_budget(), None);
    }
}
