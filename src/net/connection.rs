use std::any::Any;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use crate::net::buffer::Buffer;
use crate::net::channel::Channel;
use crate::net::event_loop::EventLoop;
use crate::net::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};

/// default outbound-buffer threshold for the high-water-mark notification
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// terminal state; the channel has been (or is being) torn down
    Disconnected = 0,
    /// accepted but not yet registered on its I/O loop
    Connecting = 1,
    /// established and readable
    Connected = 2,
    /// local shutdown requested, output still draining
    Disconnecting = 3,
}

/// One accepted TCP connection: socket, channel, buffers and state machine.
///
/// A connection is owned by exactly one I/O [`EventLoop`]; all socket I/O and
/// channel mutation happens on that loop's thread. The object itself is
/// reference counted — the server registry holds one reference, deferred
/// tasks hold transient ones, and the channel holds a weak tie — so callbacks
/// in flight keep it alive past registry removal. Destruction always follows
/// [`connect_destroyed`](TcpConnection::connect_destroyed) on the owning
/// loop.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: TcpStream,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// wraps an accepted socket; the connection starts out `Connecting` until
    /// the server dispatches [`connect_established`](Self::connect_established)
    /// onto the owning loop
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        let channel = Channel::new(&event_loop, fd);
        if let Err(e) = socket2::SockRef::from(&socket).set_keepalive(true) {
            warn!(name = %name, error = %e, "set_keepalive failed");
        }
        debug!(name = %name, fd, "connection created");

        Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        })
    }

    /// the loop that owns this connection
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// the server-assigned unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// address of the local end
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// address of the peer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// current lifecycle state
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    /// true while established
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// true once fully torn down
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// installs the established/closed notification callback
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    /// installs the inbound-data callback
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    /// installs the output-buffer-drained callback
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// installs the outbound-backlog callback and its threshold
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(callback);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    /// installs the internal close hook (wired to the server's removal path)
    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(callback);
    }

    /// toggles `TCP_NODELAY` on the socket
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            warn!(name = %self.name, error = %e, "set_nodelay failed");
        }
    }

    /// Sends `data` to the peer. Safe from any thread: on the owning loop the
    /// write happens immediately, elsewhere an owning copy of the payload is
    /// scheduled onto the loop. No-op unless the connection is `Connected`.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            let owned = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Loop-thread send path.
    ///
    /// Attempts a direct write when nothing is queued and write interest is
    /// off; whatever remains is appended to the output buffer and write
    /// interest is enabled. `EWOULDBLOCK` counts as "wrote nothing";
    /// `EPIPE`/`ECONNRESET` mark a fault and suppress buffering (the close
    /// path will run off the readiness events).
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut fault_error = false;
        let mut output = self.output_buffer.lock().unwrap();

        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match (&self.socket).write(data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone()
                        {
                            let conn = Arc::clone(self);
                            self.event_loop.queue_in_loop(move || callback(&conn));
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "send failed");
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset
                    {
                        fault_error = true;
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault_error && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(callback) = self.high_water_mark_callback.lock().unwrap().clone() {
                    let conn = Arc::clone(self);
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || callback(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes the write side once the output buffer has drained. The
    /// connection moves to `Disconnecting`; the peer's close of its own side
    /// completes the teardown.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                error!(name = %self.name, error = %e, "shutdown write failed");
            }
        }
    }

    /// tears the connection down without waiting for the peer
    pub fn force_close(self: &Arc<Self>) {
        if self.state() == ConnState::Connected || self.state() == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected || self.state() == ConnState::Disconnecting {
            self.handle_close();
        }
    }

    /// Completes establishment on the owning loop: ties the channel, installs
    /// the event handlers, enables reading and notifies the application.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(ConnState::Connected);

        let tie: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        self.channel.tie(Arc::downgrade(&tie));

        let weak = Arc::downgrade(self);
        self.channel.set_read_handler(move |received_at| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(received_at);
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_write_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_close_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_error_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        self.channel.enable_reading();

        let callback = self.connection_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Final teardown step, always on the owning loop: disables all events
    /// and removes the channel. Runs once per connection.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            let callback = self.connection_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(self);
            }
        }
        self.channel.remove();
    }

    /// One scatter read per readiness event: data goes to the message
    /// callback, zero means peer close, an error is logged and reported.
    fn handle_read(self: &Arc<Self>, received_at: Instant) {
        self.event_loop.assert_in_loop_thread();

        let result = {
            let mut input = self.input_buffer.lock().unwrap();
            input.read_from(&self.socket)
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let callback = self.message_callback.lock().unwrap().clone();
                if let Some(callback) = callback {
                    let mut input = self.input_buffer.lock().unwrap();
                    callback(self, &mut input, received_at);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // drained; the normal exit from an edge-triggered read
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
            }
        }
    }

    /// Drains the output buffer with one write per readiness event. Emptying
    /// the buffer disables write interest, fires the write-complete callback
    /// and, when a shutdown is pending, half-closes the socket.
    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match output.write_to(&self.socket) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
                        let conn = Arc::clone(self);
                        self.event_loop.queue_in_loop(move || callback(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "write failed");
            }
        }
    }

    /// Close path shared by peer close, force close and hang-up. The local
    /// strong reference keeps the connection alive across the callbacks even
    /// though the server registry drops its reference inside the close
    /// callback.
    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        trace!(name = %self.name, state = ?self.state(), "closing");

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let guard = Arc::clone(self);
        let callback = self.connection_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&guard);
        }
        let callback = self.close_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&guard);
        }
    }

    /// reports `SO_ERROR`; the connection itself stays on its close path
    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!(name = %self.name, error = %e, "socket error"),
            Ok(None) => error!(name = %self.name, "socket error event without SO_ERROR"),
            Err(e) => error!(name = %self.name, error = %e, "take_error failed"),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection destroyed");
    }
}
