use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpListener;
use tracing::{error, info};

use crate::net::channel::Channel;
use crate::net::event_loop::EventLoop;
use crate::net::NewConnectionCallback;

/// Owns the listening socket and turns read readiness on it into accepted
/// connections.
///
/// The socket is non-blocking and close-on-exec with `SO_REUSEADDR` set
/// (plus `SO_REUSEPORT` when requested). On readiness the acceptor drains
/// `accept` until "would block", handing each new `(stream, peer)` to the
/// installed callback; without a callback the stream is dropped, which
/// closes it.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listener: TcpListener,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    listening: AtomicBool,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// binds the listening socket; fatal startup errors surface here
    pub fn new(
        event_loop: Arc<EventLoop>,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let listener = build_listener(addr, reuse_port)?;
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        let channel = Channel::new(&event_loop, fd);

        Ok(Arc::new(Acceptor {
            event_loop,
            listener,
            channel,
            local_addr,
            listening: AtomicBool::new(false),
            new_connection: Mutex::new(None),
        }))
    }

    /// the bound address (resolves port 0 binds to the real port)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// installs the callback invoked with each accepted connection
    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(callback);
    }

    /// true once [`listen`](Acceptor::listen) has run
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// registers read interest on the listener; loop-thread only
    pub fn listen(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);

        let weak = Arc::downgrade(self);
        self.channel.set_read_handler(move |_received_at| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        self.channel.enable_reading();
        info!(fd = self.listener.as_raw_fd(), addr = %self.local_addr, "acceptor listening");
    }

    /// Accepts until the kernel reports "would block" (edge-triggered
    /// drain). Descriptor exhaustion is logged and tolerated; the listener
    /// stays registered.
    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let callback = self.new_connection.lock().unwrap().clone();
                    match callback {
                        Some(callback) => callback(stream, peer_addr),
                        None => drop(stream),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        error!("file descriptors exhausted");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // the server tears down on the loop thread; elsewhere the process is
        // exiting and the descriptor goes with it
        if self.event_loop.is_in_loop_thread() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}

/// builds the non-blocking listener the way the rest of the stack expects:
/// reuse-addr always, reuse-port on request, close-on-exec, backlog 1024
fn build_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}
