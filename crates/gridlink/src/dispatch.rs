//! Event dispatcher: one dedicated thread draining a queue of listener
//! invocations in production order.
//!
//! Producers are throttled rather than blocked outright: once the queue
//! exceeds the clogged count, each post sleeps the clogged delay until the
//! dispatcher catches up. The dispatcher thread itself is never throttled,
//! so listeners may safely produce follow-up events.

use std::{
    collections::VecDeque,
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use tracing::{Level, debug, span, warn};

use crate::{Error, Result};

const DEFAULT_CLOGGED_COUNT: usize = 1024;
const DEFAULT_CLOGGED_DELAY: Duration = Duration::from_millis(32);

/// One queued listener invocation.
pub struct DispatchEvent {
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl DispatchEvent {
    pub fn new(label: &'static str, run: impl FnOnce() + Send + 'static) -> Self {
        Self { label, run: Box::new(run) }
    }
}

struct Shared {
    queue: Mutex<VecDeque<DispatchEvent>>,
    ready: Condvar,
    idle: Condvar,
    stopping: AtomicBool,
    clogged_count: AtomicUsize,
    clogged_delay_ms: AtomicU64,
}

pub struct EventDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                idle: Condvar::new(),
                stopping: AtomicBool::new(false),
                clogged_count: AtomicUsize::new(DEFAULT_CLOGGED_COUNT),
                clogged_delay_ms: AtomicU64::new(DEFAULT_CLOGGED_DELAY.as_millis() as u64),
            }),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
        }
    }

    /// Queue length above which producers start pausing.
    pub fn set_clogged_count(&self, count: usize) {
        self.shared.clogged_count.store(count, Ordering::Relaxed);
    }

    /// How long a producer pauses each time it finds the queue clogged.
    pub fn set_clogged_delay(&self, delay: Duration) {
        self.shared.clogged_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn start(&self, service_name: &str) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let name = format!("{service_name}:EventDispatcher");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _span = span!(Level::INFO, "", thread = %name).entered();
                run(&shared);
            })
            .map_err(|err| Error::Net(gridlink_net::Error::Io(err)))?;
        *self.worker_thread.lock() = Some(handle.thread().id());
        *worker = Some(handle);
        Ok(())
    }

    /// Enqueues an event; applies the clogged backpressure to any thread
    /// but the dispatcher's own.
    pub fn post(&self, event: DispatchEvent) {
        if self.shared.stopping.load(Ordering::Acquire) {
            debug!(label = event.label, "dropping event posted to a stopped dispatcher");
            return;
        }

        if !self.is_dispatch_thread() {
            let clogged = self.shared.clogged_count.load(Ordering::Relaxed);
            while self.shared.queue.lock().len() >= clogged
                && !self.shared.stopping.load(Ordering::Acquire)
            {
                let delay = self.shared.clogged_delay_ms.load(Ordering::Relaxed);
                thread::sleep(Duration::from_millis(delay.max(1)));
            }
        }

        self.shared.queue.lock().push_back(event);
        self.shared.ready.notify_one();
    }

    /// Blocks until every queued event has been dispatched. A no-op on the
    /// dispatcher thread, which drains by returning.
    pub fn drain(&self) {
        if self.is_dispatch_thread() || self.worker.lock().is_none() {
            return;
        }
        let mut queue = self.shared.queue.lock();
        while !queue.is_empty() {
            self.shared.idle.wait_for(&mut queue, Duration::from_millis(100));
        }
    }

    /// Stops the dispatcher after the queue drains. Idempotent.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.ready.notify_all();

        if self.is_dispatch_thread() {
            // the loop observes the flag once the current event returns
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("event dispatcher thread panicked");
        }
    }

    fn is_dispatch_thread(&self) -> bool {
        *self.worker_thread.lock() == Some(thread::current().id())
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn run(shared: &Shared) {
    loop {
        let event = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(event) = queue.pop_front() {
                    break Some(event);
                }
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                shared.ready.wait(&mut queue);
            }
        };

        let Some(event) = event else {
            shared.idle.notify_all();
            return;
        };

        (event.run)();

        if shared.queue.lock().is_empty() {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn dispatches_in_production_order() {
        let dispatcher = EventDispatcher::new();
        dispatcher.start("test").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = seen.clone();
            dispatcher.post(DispatchEvent::new("order", move || seen.lock().push(i)));
        }
        dispatcher.drain();
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
        dispatcher.stop();
    }

    #[test]
    fn clogged_queue_throttles_producers() {
        let dispatcher = EventDispatcher::new();
        dispatcher.set_clogged_count(4);
        dispatcher.set_clogged_delay(Duration::from_millis(5));

        // not started yet: the queue only grows, so posts beyond the
        // clogged count must have slept at least once
        let started = std::time::Instant::now();
        for _ in 0..4 {
            dispatcher.post(DispatchEvent::new("fill", || {}));
        }
        assert!(started.elapsed() < Duration::from_millis(5));

        let counter = Arc::new(AtomicU32::new(0));
        let throttled = std::time::Instant::now();
        {
            let counter = counter.clone();
            let dispatcher = &dispatcher;
            // draining starts as soon as the worker comes up
            std::thread::scope(|scope| {
                scope.spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    dispatcher.start("test").unwrap();
                });
                dispatcher.post(DispatchEvent::new("throttled", move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }));
            });
        }
        assert!(throttled.elapsed() >= Duration::from_millis(5));

        dispatcher.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        dispatcher.stop();
    }

    #[test]
    fn stop_drains_pending_events() {
        let dispatcher = EventDispatcher::new();
        dispatcher.start("test").unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            dispatcher.post(DispatchEvent::new("pending", move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        dispatcher.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn events_after_stop_are_dropped() {
        let dispatcher = EventDispatcher::new();
        dispatcher.start("test").unwrap();
        dispatcher.stop();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = counter.clone();
            dispatcher.post(DispatchEvent::new("late", move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
