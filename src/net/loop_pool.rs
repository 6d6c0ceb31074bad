use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use tracing::{debug, error};

use crate::error::{KvError, Result};
use crate::net::event_loop::EventLoop;

/// One dedicated OS thread running one [`EventLoop`].
///
/// The thread constructs its own loop (loops are thread-affine from birth),
/// publishes it back to the starter over a channel, then enters
/// [`run`](EventLoop::run). Dropping the handle quits the loop and joins the
/// thread.
pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// spawns a named worker thread and waits for its loop to come up
    pub fn start(name: String) -> Result<EventLoopThread> {
        let (tx, rx) = channel::bounded(1);

        let handle = thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let _ = tx.send(Ok(Arc::clone(&event_loop)));
            event_loop.run();
        })?;

        let event_loop = rx
            .recv()
            .map_err(|_| KvError::Startup("event loop thread exited before startup".to_string()))??;

        Ok(EventLoopThread {
            event_loop,
            handle: Some(handle),
        })
    }

    /// the loop running on this thread
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

/// Pool of I/O [`EventLoop`]s on dedicated threads, with round-robin dispatch
/// of new connections.
///
/// With zero threads the pool degenerates to the base (listener) loop, so a
/// single-threaded server is just a pool that was never grown.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    /// creates an empty (not yet started) pool over the given base loop
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// sets the number of worker threads spawned by [`start`](Self::start)
    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Release);
    }

    /// Spawns the worker threads. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let num_threads = self.num_threads.load(Ordering::Acquire);
        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let worker = EventLoopThread::start(format!("{}-io-{}", self.name, i))?;
            loops.push(Arc::clone(worker.event_loop()));
            threads.push(worker);
        }
        debug!(workers = num_threads, "loop pool started");
        Ok(())
    }

    /// Returns the next I/O loop in round-robin order, or the base loop when
    /// the pool has no workers. Called from the base loop thread only.
    pub fn get_next(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel) % loops.len();
        Arc::clone(&loops[index])
    }

    /// all I/O loops, or the base loop alone when the pool has no workers
    pub fn get_all(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base_loop = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(Arc::clone(&base_loop), "test");
        pool.start().unwrap();

        assert!(Arc::ptr_eq(&pool.get_next(), &base_loop));
        assert_eq!(pool.get_all().len(), 1);
    }

    #[test]
    fn round_robin_cycles_through_workers() {
        let base_loop = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(Arc::clone(&base_loop), "test");
        pool.set_thread_num(2);
        pool.start().unwrap();
        // second start is a no-op
        pool.start().unwrap();

        let first = pool.get_next();
        let second = pool.get_next();
        let third = pool.get_next();

        assert!(!Arc::ptr_eq(&first, &base_loop));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(pool.get_all().len(), 2);
    }
}
