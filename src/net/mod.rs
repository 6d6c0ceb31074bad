//! The reactor network engine: a main/sub event-loop architecture over an
//! edge-triggered readiness poller.
//!
//! One listener [`EventLoop`] accepts; a pool of I/O loops owns the accepted
//! [`TcpConnection`]s. Everything loop-local is thread-affine, and the only
//! sanctioned cross-thread mechanism is the per-loop deferred-task queue.

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod loop_pool;
mod poller;
mod server;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::{
    Channel, Ready, EVENT_ERROR, EVENT_HUP, EVENT_PRI, EVENT_READ, EVENT_READ_CLOSED, EVENT_WRITE,
};
pub use connection::{ConnState, TcpConnection};
pub use event_loop::EventLoop;
pub use loop_pool::{EventLoopThread, EventLoopThreadPool};
pub use poller::Poller;
pub use server::TcpServer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// invoked when a connection is established and again when it disconnects
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// invoked with the connection, its input buffer and the poll timestamp
/// whenever bytes arrive
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;

/// invoked after the output buffer fully drains
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// invoked when the output buffer crosses the high-water mark, with the
/// number of bytes queued
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// internal close hook wired to the server's removal routine
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// invoked by the acceptor with each newly accepted stream and peer address
pub type NewConnectionCallback = Arc<dyn Fn(mio::net::TcpStream, SocketAddr) + Send + Sync>;
