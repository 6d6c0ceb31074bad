use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, trace};

use crate::net::channel::{
    Channel, PollState, Ready, EVENT_ERROR, EVENT_HUP, EVENT_PRI, EVENT_READ, EVENT_READ_CLOSED,
    EVENT_WRITE,
};

/// token reserved for the loop's wake-up descriptor
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const INITIAL_EVENT_CAPACITY: usize = 16;

/// Edge-triggered readiness poller for one [`EventLoop`](crate::net::EventLoop).
///
/// Tracks the set of registered [`Channel`]s keyed by descriptor and
/// translates OS readiness into [`Ready`] bit-sets. The epoll backend used by
/// mio reports edges, so consumers must drain until "would block".
pub struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<Token, Weak<Channel>>,
}

impl Poller {
    /// wraps an already-created `mio::Poll` (the loop creates the Poll first
    /// so it can attach its waker to the registry)
    pub(crate) fn new(poll: Poll) -> Poller {
        Poller {
            poll,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            channels: HashMap::new(),
        }
    }

    /// Blocks up to `timeout` and fills `active` with the channels whose
    /// events fired, paired with the readiness observed. Returns the moment
    /// readiness was observed. A signal interruption or a timer expiry comes
    /// back as an empty list.
    pub fn poll(
        &mut self,
        timeout: Duration,
        active: &mut Vec<(Arc<Channel>, Ready)>,
    ) -> io::Result<Instant> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Instant::now());
            }
            Err(e) => return Err(e),
        }
        let received_at = Instant::now();

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let channel = match self.channels.get(&event.token()) {
                // the owner died between readiness and dispatch
                Some(weak) => match weak.upgrade() {
                    Some(channel) => channel,
                    None => continue,
                },
                None => continue,
            };
            active.push((channel, translate(event)));
        }
        trace!(events = count, "poll returned");

        // a full event list means there may be more; grow for the next tick
        if count == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }

        Ok(received_at)
    }

    /// Reconciles a channel's registration with the OS poller.
    ///
    /// A "new" or previously "deleted" channel with a non-empty interest mask
    /// is (re-)registered and becomes "added". An "added" channel is modified
    /// in place, or deregistered when its interest mask has become empty.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let token = Token(channel.fd() as usize);
        let interest = interest_of(channel.interest());

        match channel.poll_state() {
            PollState::New | PollState::Deleted => {
                if channel.poll_state() == PollState::New {
                    self.channels.insert(token, Arc::downgrade(channel));
                }
                if let Some(interest) = interest {
                    let fd = channel.fd();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut SourceFd(&fd), token, interest)
                    {
                        error!(fd, error = %e, "poller register failed");
                        return;
                    }
                    channel.set_poll_state(PollState::Added);
                } else {
                    channel.set_poll_state(PollState::Deleted);
                }
            }
            PollState::Added => match interest {
                Some(interest) => {
                    let fd = channel.fd();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .reregister(&mut SourceFd(&fd), token, interest)
                    {
                        error!(fd, error = %e, "poller reregister failed");
                    }
                }
                None => {
                    let fd = channel.fd();
                    if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        error!(fd, error = %e, "poller deregister failed");
                    }
                    channel.set_poll_state(PollState::Deleted);
                }
            },
        }
    }

    /// removes a channel from the poller and the descriptor map
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let token = Token(channel.fd() as usize);
        self.channels.remove(&token);

        if channel.poll_state() == PollState::Added {
            let fd = channel.fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                error!(fd, error = %e, "poller deregister failed");
            }
        }
        channel.set_poll_state(PollState::New);
    }

    /// true if the descriptor map currently tracks this channel
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels.contains_key(&Token(channel.fd() as usize))
    }
}

/// builds the mio interest set for a channel mask; `None` means no interest
fn interest_of(mask: u8) -> Option<Interest> {
    match (mask & EVENT_READ != 0, mask & EVENT_WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// translates one mio event into the channel-facing readiness bits
fn translate(event: &mio::event::Event) -> Ready {
    let mut bits = 0u8;
    if event.is_readable() {
        bits |= EVENT_READ;
    }
    if event.is_writable() {
        bits |= EVENT_WRITE;
    }
    if event.is_error() {
        bits |= EVENT_ERROR;
    }
    if event.is_read_closed() {
        bits |= EVENT_READ_CLOSED;
    }
    if event.is_read_closed() && event.is_write_closed() {
        bits |= EVENT_HUP;
    }
    if event.is_priority() {
        bits |= EVENT_PRI;
    }
    Ready(bits)
}
