use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::Result;
use crate::net::{Buffer, EventLoop, TcpConnection, TcpServer};
use crate::protocol::codec;
use crate::protocol::{Request, Response};
use crate::storage::KvStore;

/// greeting pushed to every client before any of its bytes are consumed
const WELCOME: &str = "+WELCOME ReactorKV Server\r\n";

/// The key-value server: wires the [`TcpServer`]'s callbacks to the codec
/// and the shared [`KvStore`].
///
/// Every I/O loop parses and executes requests for its own connections; the
/// store's internal lock is the only cross-loop serialization point.
pub struct KvServer {
    server: Arc<TcpServer>,
    store: Arc<KvStore>,
    data_file: Mutex<Option<PathBuf>>,
}

impl KvServer {
    /// binds the server on `0.0.0.0:port` and wires up the protocol
    pub fn new(base_loop: Arc<EventLoop>, port: u16, name: &str) -> Result<Arc<KvServer>> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let server = TcpServer::new(base_loop, addr, name, true)?;
        let store = Arc::new(KvStore::new());

        server.set_connection_callback(Arc::new(|conn| on_connection(conn)));
        let handler_store = Arc::clone(&store);
        server.set_message_callback(Arc::new(move |conn, buf, _received_at| {
            on_message(&handler_store, conn, buf);
        }));

        Ok(Arc::new(KvServer {
            server,
            store,
            data_file: Mutex::new(None),
        }))
    }

    /// number of I/O threads; call before [`start`](Self::start)
    pub fn set_thread_num(&self, num_threads: usize) {
        self.server.set_thread_num(num_threads);
    }

    /// starts accepting clients
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!("KvServer starting");
        self.server.start()
    }

    /// the bound listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// the shared store
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Loads a snapshot and remembers the path for later saves.
    ///
    /// # Errors
    /// fails when the file cannot be read; the store is left empty
    pub fn load_data(&self, filepath: &Path) -> Result<()> {
        *self.data_file.lock().unwrap() = Some(filepath.to_path_buf());
        self.store.load(filepath)
    }

    /// Saves a snapshot to `filepath` and remembers the path.
    ///
    /// # Errors
    /// fails when the file cannot be written
    pub fn save_data(&self, filepath: &Path) -> Result<()> {
        *self.data_file.lock().unwrap() = Some(filepath.to_path_buf());
        self.store.save(filepath)
    }

    /// saves to the remembered data-file path, if one was ever set
    pub fn save_to_data_file(&self) -> Result<()> {
        let filepath = self.data_file.lock().unwrap().clone();
        match filepath {
            Some(filepath) => self.store.save(&filepath),
            None => Ok(()),
        }
    }
}

fn on_connection(conn: &Arc<TcpConnection>) {
    if conn.connected() {
        info!(peer = %conn.peer_addr(), "client connected");
        conn.send(WELCOME.as_bytes());
    } else {
        info!(peer = %conn.peer_addr(), "client disconnected");
    }
}

/// Drains every complete request out of the input buffer; a partial line at
/// the tail stays buffered until more bytes arrive. QUIT answers and then
/// half-closes the write side.
fn on_message(store: &Arc<KvStore>, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
    while buf.readable_bytes() > 0 {
        let request = match codec::parse_request(buf) {
            Some(request) => request,
            None => break,
        };

        let response = handle_request(store, &request);
        codec::send_response(conn, &response);

        if let Request::Quit = request {
            conn.shutdown();
            break;
        }
    }
}

/// executes one request against the store
fn handle_request(store: &KvStore, request: &Request) -> Response {
    debug!(?request, "handling command");

    match request {
        Request::Put { key, value } => match store.put(key.clone(), value.clone()) {
            Ok(true) => Response::ok("CREATED"),
            Ok(false) => Response::ok("UPDATED"),
            Err(e) => Response::error(e.to_string()),
        },
        Request::Get { key } => match store.get(key) {
            Some(value) => Response::ok(value),
            None => Response::not_found(),
        },
        Request::Del { key } => {
            if store.del(key) {
                Response::ok("DELETED")
            } else {
                Response::not_found()
            }
        }
        Request::Exists { key } => {
            if store.exists(key) {
                Response::ok("1")
            } else {
                Response::ok("0")
            }
        }
        Request::Size => Response::ok(store.size().to_string()),
        Request::Clear => {
            store.clear();
            Response::ok("CLEARED")
        }
        Request::Ping => Response::pong(),
        Request::Quit => Response::bye(),
        Request::Unknown => Response::error("Unknown command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_handling_covers_the_command_table() {
        let store = KvStore::new();

        let put = |k: &str, v: &str| Request::Put {
            key: k.to_string(),
            value: v.to_string(),
        };
        assert_eq!(handle_request(&store, &put("k", "v1")), Response::ok("CREATED"));
        assert_eq!(handle_request(&store, &put("k", "v2")), Response::ok("UPDATED"));
        assert_eq!(
            handle_request(&store, &Request::Get { key: "k".into() }),
            Response::ok("v2")
        );
        assert_eq!(
            handle_request(&store, &Request::Get { key: "missing".into() }),
            Response::not_found()
        );
        assert_eq!(
            handle_request(&store, &Request::Exists { key: "k".into() }),
            Response::ok("1")
        );
        assert_eq!(handle_request(&store, &Request::Size), Response::ok("1"));
        assert_eq!(
            handle_request(&store, &Request::Del { key: "k".into() }),
            Response::ok("DELETED")
        );
        assert_eq!(
            handle_request(&store, &Request::Del { key: "k".into() }),
            Response::not_found()
        );
        assert_eq!(handle_request(&store, &Request::Clear), Response::ok("CLEARED"));
        assert_eq!(handle_request(&store, &Request::Ping), Response::pong());
        assert_eq!(handle_request(&store, &Request::Quit), Response::bye());
        assert_eq!(
            handle_request(&store, &Request::Unknown),
            Response::error("Unknown command")
        );
    }

    #[test]
    fn empty_put_key_reports_the_validation_error() {
        let store = KvStore::new();
        let response = handle_request(
            &store,
            &Request::Put {
                key: String::new(),
                value: "v".to_string(),
            },
        );
        assert_eq!(response, Response::error("Key cannot be empty"));
    }
}
