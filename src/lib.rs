#![deny(missing_docs)]
//! # reactorkv
//! An in-memory, ordered key-value store fronted by a multi-threaded,
//! event-driven TCP server.
//!
//! The crate has two halves. The [`net`] module is a main/sub reactor: one
//! listener [`EventLoop`](net::EventLoop) accepts connections and a pool of
//! I/O loops owns them, each loop a single thread driving an edge-triggered
//! poller. The [`storage`] module is a probabilistic
//! [`SkipList`](storage::SkipList) index behind one coarse lock, wrapped by
//! [`KvStore`] and snapshotted to a line-oriented file.
//!
//! [`KvServer`] wires the two together over a line-framed text protocol
//! (`PUT`/`GET`/`DEL`/`EXISTS`/`SIZE`/`CLEAR`/`PING`/`QUIT`), and
//! [`KvClient`] is the matching blocking client.

pub mod net;
pub mod protocol;
pub mod storage;

mod client;
mod error;
mod kv_server;

pub use client::KvClient;
pub use error::{KvError, Result};
pub use kv_server::KvServer;
pub use storage::{KvStore, SkipList};
