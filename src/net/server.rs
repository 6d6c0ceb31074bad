use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use tracing::{error, info, trace};

use crate::error::Result;
use crate::net::acceptor::Acceptor;
use crate::net::connection::TcpConnection;
use crate::net::event_loop::EventLoop;
use crate::net::loop_pool::EventLoopThreadPool;
use crate::net::{ConnectionCallback, MessageCallback, WriteCompleteCallback};

/// Non-blocking TCP server composing an [`Acceptor`], an I/O loop pool and a
/// connection registry.
///
/// The acceptor runs on the base (listener) loop; each accepted connection is
/// handed to an I/O loop picked round-robin and lives there for its whole
/// lifetime. The registry maps connection names to their reference-counted
/// objects and is mutated only on the listener loop.
pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    /// Binds the listening socket on `addr`; startup errors surface here.
    /// `reuse_port` sets `SO_REUSEPORT` on the listener so several servers
    /// can share a port; pass `true` unless the deployment forbids it.
    pub fn new(
        base_loop: Arc<EventLoop>,
        addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(Arc::clone(&base_loop), addr, reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();
        let pool = Arc::new(EventLoopThreadPool::new(Arc::clone(&base_loop), name));

        Ok(Arc::new(TcpServer {
            base_loop,
            name: name.to_string(),
            ip_port,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
        }))
    }

    /// the listening address (resolves port 0 binds to the real port)
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// number of I/O threads; must be called before [`start`](Self::start)
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    /// installs the application's connect/disconnect callback
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    /// installs the application's inbound-data callback
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    /// installs the application's output-drained callback
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Starts the I/O threads and begins listening. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.start()?;

        let server = Arc::downgrade(self);
        self.acceptor
            .set_new_connection_callback(Arc::new(move |stream, peer_addr| {
                if let Some(server) = server.upgrade() {
                    server.new_connection(stream, peer_addr);
                }
            }));

        let acceptor = Arc::clone(&self.acceptor);
        self.base_loop.run_in_loop(move || acceptor.listen());
        info!(name = %self.name, addr = %self.ip_port, "server started");
        Ok(())
    }

    /// Builds a connection object for an accepted socket and hands it to its
    /// I/O loop. Runs on the listener loop.
    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        let io_loop = self.pool.get_next();
        // sequence numbers are never reused across reconnects
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "getsockname failed, dropping connection");
                return;
            }
        };
        info!(name = %conn_name, peer = %peer_addr, "new connection");

        let conn = TcpConnection::new(io_loop, conn_name.clone(), stream, local_addr, peer_addr);
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));

        if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = self.message_callback.lock().unwrap().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }
        let server = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = server.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let io_conn = Arc::clone(&conn);
        conn.owner_loop()
            .run_in_loop(move || io_conn.connect_established());
    }

    /// Close hook invoked on the connection's I/O loop: hop to the listener
    /// loop to drop the registry entry, then hop back so destruction happens
    /// on the loop that owns the channel.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_loop(conn));
    }

    fn remove_connection_in_loop(&self, conn: Arc<TcpConnection>) {
        self.base_loop.assert_in_loop_thread();
        trace!(name = %conn.name(), "removing connection from registry");

        self.connections.lock().unwrap().remove(conn.name());
        let owner_loop = Arc::clone(conn.owner_loop());
        owner_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // tear down whatever is still registered; each connection is
        // destroyed on its own loop
        let connections: Vec<Arc<TcpConnection>> =
            self.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for conn in connections {
            let owner = Arc::clone(conn.owner_loop());
            owner.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
