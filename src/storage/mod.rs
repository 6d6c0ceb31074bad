//! The ordered index and its validation wrapper.

mod kvstore;
mod skiplist;

pub use kvstore::KvStore;
pub use skiplist::{SkipList, DEFAULT_MAX_LEVEL};
