use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI8, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::net::event_loop::EventLoop;

/// interest / readiness bit for readability (includes priority data)
pub const EVENT_READ: u8 = 0x01;
/// interest / readiness bit for writability
pub const EVENT_WRITE: u8 = 0x02;
/// readiness bit for hang-up (both directions closed by the peer)
pub const EVENT_HUP: u8 = 0x04;
/// readiness bit for a socket error
pub const EVENT_ERROR: u8 = 0x08;
/// readiness bit for peer half-close of its write side
pub const EVENT_READ_CLOSED: u8 = 0x10;
/// readiness bit for priority data
pub const EVENT_PRI: u8 = 0x20;

/// A set of readiness bits reported by the [`Poller`](crate::net::Poller)
/// for one channel on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(pub(crate) u8);

impl Ready {
    /// the empty set
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// true if any of `bits` is present
    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits != 0
    }
}

/// registration bookkeeping between a Channel and the Poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// never registered
    New = -1,
    /// currently registered with the OS poller
    Added = 1,
    /// was registered, currently deregistered (may be re-added)
    Deleted = 2,
}

type ReadHandler = Arc<dyn Fn(Instant) + Send + Sync>;
type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// Binding of one file descriptor to the callbacks that dispatch its events
/// inside one [`EventLoop`].
///
/// A Channel never owns its descriptor; the descriptor's owner (socket
/// wrapper, connection) closes it, and must call
/// [`remove`](Channel::remove) before that happens. The owner may also
/// [`tie`](Channel::tie) itself to the channel so that events arriving after
/// the owner has been destroyed are suppressed.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU8,
    state: AtomicI8,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_handler: Mutex<Option<ReadHandler>>,
    write_handler: Mutex<Option<EventHandler>>,
    close_handler: Mutex<Option<EventHandler>>,
    error_handler: Mutex<Option<EventHandler>>,
}

impl Channel {
    /// creates an unregistered channel for `fd` owned by `event_loop`
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            event_loop: Arc::downgrade(event_loop),
            fd,
            interest: AtomicU8::new(0),
            state: AtomicI8::new(PollState::New as i8),
            tie: Mutex::new(None),
            read_handler: Mutex::new(None),
            write_handler: Mutex::new(None),
            close_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
        })
    }

    /// the wrapped descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// the current interest mask ([`EVENT_READ`] | [`EVENT_WRITE`] bits)
    pub fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    /// true if the channel currently wants write readiness
    pub fn is_writing(&self) -> bool {
        self.interest() & EVENT_WRITE != 0
    }

    /// true if the channel currently wants read readiness
    pub fn is_reading(&self) -> bool {
        self.interest() & EVENT_READ != 0
    }

    /// true if the interest mask is empty
    pub fn is_none_event(&self) -> bool {
        self.interest() == 0
    }

    pub(crate) fn poll_state(&self) -> PollState {
        match self.state.load(Ordering::Acquire) {
            1 => PollState::Added,
            2 => PollState::Deleted,
            _ => PollState::New,
        }
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.state.store(state as i8, Ordering::Release);
    }

    /// installs the handler invoked on read readiness; it receives the poll
    /// timestamp of the tick that observed the event
    pub fn set_read_handler(&self, handler: impl Fn(Instant) + Send + Sync + 'static) {
        *self.read_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// installs the handler invoked on write readiness
    pub fn set_write_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.write_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// installs the handler invoked on peer hang-up
    pub fn set_close_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.close_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// installs the handler invoked when the error bit is set
    pub fn set_error_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.error_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Ties this channel to its owning object. On every dispatch the weak
    /// reference is upgraded first; if the owner is already gone all
    /// callbacks are suppressed, and the strong guard otherwise keeps the
    /// owner alive for the duration of the dispatch.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    /// adds read interest and reconciles with the poller
    pub fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    /// adds write interest and reconciles with the poller
    pub fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    /// drops write interest and reconciles with the poller
    pub fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    /// drops all interest and reconciles with the poller
    pub fn disable_all(self: &Arc<Self>) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    /// removes this channel from its loop's poller entirely
    pub fn remove(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Dispatches the readiness set reported for this tick.
    ///
    /// Ordering contract: tie upgrade (suppress if dead), then close on
    /// hang-up without readability, then error, then read, then write.
    pub fn handle_event(&self, ready: Ready, received_at: Instant) {
        let tie = self.tie.lock().unwrap().clone();
        if let Some(weak_owner) = tie {
            // hold the owner alive across the callbacks, or drop the event
            if let Some(_guard) = weak_owner.upgrade() {
                self.dispatch(ready, received_at);
            }
        } else {
            self.dispatch(ready, received_at);
        }
    }

    fn dispatch(&self, ready: Ready, received_at: Instant) {
        // handler slots are cloned out before the call so no lock is held
        // across user code
        if ready.contains(EVENT_HUP) && !ready.contains(EVENT_READ) {
            let handler = self.close_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            }
        }

        if ready.contains(EVENT_ERROR) {
            let handler = self.error_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            }
        }

        if ready.contains(EVENT_READ | EVENT_PRI | EVENT_READ_CLOSED) {
            let handler = self.read_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(received_at);
            }
        }

        if ready.contains(EVENT_WRITE) {
            let handler = self.write_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_bit_queries() {
        let ready = Ready(EVENT_READ | EVENT_HUP);
        assert!(ready.contains(EVENT_READ));
        assert!(ready.contains(EVENT_HUP));
        assert!(!ready.contains(EVENT_WRITE));
        assert!(Ready::empty().0 == 0);
    }
}
