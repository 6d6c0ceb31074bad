use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::{Poll, Waker};
use tracing::{debug, error, info};

use crate::net::channel::{Channel, Ready};
use crate::net::poller::{Poller, WAKER_TOKEN};

/// upper bound on one blocking poll; quit requests are observed at latest
/// after this long even if the wake-up write is lost
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// a deferred unit of work handed to a loop from another thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A per-thread reactor: the only thread-affine execution context in the
/// system.
///
/// Every [`Channel`], [`Poller`] and connection-local operation belonging to
/// this loop runs on the thread that created it. Other threads communicate
/// exclusively through [`run_in_loop`](EventLoop::run_in_loop) /
/// [`queue_in_loop`](EventLoop::queue_in_loop), which enqueue a task and wake
/// the poller through a dedicated wake-up descriptor.
pub struct EventLoop {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    waker: Waker,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_deferred: AtomicBool,
    deferred: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    ///
    /// # Errors
    /// fails when the OS poller or its wake-up descriptor cannot be created
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let event_loop = Arc::new(EventLoop {
            thread_id: thread::current().id(),
            poller: Mutex::new(Poller::new(poll)),
            waker,
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_deferred: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
        });
        debug!(thread = ?event_loop.thread_id, "event loop created");
        Ok(event_loop)
    }

    /// true if the calling thread owns this loop
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// panics unless the calling thread owns this loop
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by {:?} was accessed from thread {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    /// Runs the reactor until [`quit`](EventLoop::quit) is observed at a loop
    /// boundary. Must be entered on the owning thread, exactly once.
    ///
    /// Each tick polls for readiness, dispatches every active channel's
    /// events, then drains the deferred-task queue.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        info!(thread = ?self.thread_id, "event loop start");

        let mut active: Vec<(Arc<Channel>, Ready)> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let received_at = {
                let mut poller = self.poller.lock().unwrap();
                match poller.poll(POLL_TIMEOUT, &mut active) {
                    Ok(received_at) => received_at,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        continue;
                    }
                }
            };

            for (channel, ready) in &active {
                channel.handle_event(*ready, received_at);
            }

            self.run_deferred_tasks();
        }

        info!(thread = ?self.thread_id, "event loop stop");
        self.looping.store(false, Ordering::Release);
    }

    /// Runs `task` on the loop thread: synchronously when the caller already
    /// is the loop thread, otherwise enqueued behind a wake-up.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueues `task` for the next deferred-drain phase, waking the
    /// loop when the caller is off-thread or the loop is currently inside the
    /// deferred phase (so freshly queued tasks are not starved until the next
    /// readiness event).
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut deferred = self.deferred.lock().unwrap();
            deferred.push(Box::new(task));
        }

        if !self.is_in_loop_thread() || self.calling_deferred.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// unblocks the poller by writing to the wake-up descriptor
    pub fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "wakeup write failed");
        }
    }

    /// requests the loop to exit at its next boundary; safe from any thread
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// true while [`run`](EventLoop::run) is executing
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// reconciles a channel's registration; loop-thread only
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    /// removes a channel from the poller; loop-thread only
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    /// true if the poller currently tracks `channel`
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    /// Swaps the queue out under the lock and executes the tasks outside it,
    /// so a task can enqueue further tasks without deadlock and without
    /// reordering relative to tasks already queued in this tick.
    fn run_deferred_tasks(&self) {
        self.calling_deferred.store(true, Ordering::Release);

        let tasks: Vec<Task> = {
            let mut deferred = self.deferred.lock().unwrap();
            std::mem::take(&mut *deferred)
        };
        for task in tasks {
            task();
        }

        self.calling_deferred.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn run_in_loop_on_owner_thread_is_synchronous() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_tasks_execute_on_loop_thread_in_order() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            tx.send(Arc::clone(&event_loop)).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..4 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            let owner = Arc::clone(&event_loop);
            event_loop.queue_in_loop(move || {
                owner.assert_in_loop_thread();
                // submission order within a tick is preserved
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, i);
                if i == 3 {
                    done_tx.send(()).unwrap();
                }
            });
        }
        done_rx.recv().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn quit_from_another_thread_stops_the_loop() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            tx.send(Arc::clone(&event_loop)).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();
        event_loop.quit();
        handle.join().unwrap();
        assert!(!event_loop.is_looping());
    }
}
