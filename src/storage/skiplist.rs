use std::borrow::Borrow;
use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::fs::File;
use std::hash::{BuildHasher, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use slab::Slab;
use tracing::{debug, error};

use crate::error::Result;

/// default cap on tower heights; levels are `0..DEFAULT_MAX_LEVEL`
pub const DEFAULT_MAX_LEVEL: usize = 16;

/// delimiter between key and value in the snapshot format
const DELIMITER: char = ':';

/// A probabilistic ordered map with O(log N) expected insert, lookup and
/// delete.
///
/// Each entry carries a tower of forward links whose height is drawn from a
/// geometric distribution (p = 0.25), so the higher levels form successively
/// sparser express lanes over the sorted level-0 chain. Nodes live in a
/// [`Slab`] arena and link to each other by index, which keeps the towers
/// free of shared-ownership cycles.
///
/// Concurrency is a deliberate single coarse lock: every operation, reading
/// or writing, takes the one internal mutex. That trades read throughput for
/// a structure that is trivially correct under any mix of threads; the
/// network stack never holds this lock while doing I/O.
pub struct SkipList<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    max_level: usize,
    /// highest level with at least one node
    current_level: usize,
    len: usize,
    /// the sentinel head's forward array, one slot per level
    head: Vec<Option<usize>>,
    nodes: Slab<Node<K, V>>,
}

struct Node<K, V> {
    key: K,
    value: V,
    /// index of the highest level this node participates in
    height: usize,
    /// forward[i] is the next node at level i, for i in 0..=height
    forward: Vec<Option<usize>>,
}

impl<K: Ord, V> SkipList<K, V> {
    /// creates an empty list with the default level cap
    pub fn new() -> SkipList<K, V> {
        SkipList::with_max_level(DEFAULT_MAX_LEVEL)
    }

    /// creates an empty list whose towers are capped at `max_level` levels
    pub fn with_max_level(max_level: usize) -> SkipList<K, V> {
        SkipList {
            inner: Mutex::new(Inner {
                max_level,
                current_level: 0,
                len: 0,
                head: vec![None; max_level],
                nodes: Slab::new(),
            }),
        }
    }

    /// Inserts `value` under `key`, overwriting any existing entry.
    /// Returns `true` when the key was newly created, `false` on an update.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key, value)
    }

    /// looks up `key`, cloning the value out
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        V: Clone,
    {
        let inner = self.inner.lock().unwrap();
        inner.find(key).map(|idx| inner.nodes[idx].value.clone())
    }

    /// removes `key`, returning whether it was present
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(key)
    }

    /// true if `key` is present
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let inner = self.inner.lock().unwrap();
        inner.find(key).is_some()
    }

    /// number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    /// true when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// drops every entry and resets the levels
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.clear();
        for slot in inner.head.iter_mut() {
            *slot = None;
        }
        inner.current_level = 0;
        inner.len = 0;
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        SkipList::new()
    }
}

impl<K: Ord, V> Inner<K, V> {
    /// forward pointer at `level` out of either the head sentinel (`None`)
    /// or the node at `from`
    fn forward(&self, from: Option<usize>, level: usize) -> Option<usize> {
        match from {
            None => self.head[level],
            Some(idx) => self.nodes[idx].forward[level],
        }
    }

    fn set_forward(&mut self, from: Option<usize>, level: usize, to: Option<usize>) {
        match from {
            None => self.head[level] = to,
            Some(idx) => self.nodes[idx].forward[level] = to,
        }
    }

    /// Descends from `current_level` to 0, at each level walking forward
    /// while the next key is still less than `key`, and records the last
    /// such node per level in `update`. Afterwards `update[0]`'s level-0
    /// forward pointer is the candidate match.
    fn descend<Q>(&self, key: &Q, update: &mut Vec<Option<usize>>) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        update.clear();
        update.resize(self.max_level, None);

        let mut current: Option<usize> = None;
        for level in (0..=self.current_level).rev() {
            while let Some(next) = self.forward(current, level) {
                if self.nodes[next].key.borrow() < key {
                    current = Some(next);
                } else {
                    break;
                }
            }
            update[level] = current;
        }
        self.forward(current, 0)
    }

    fn find<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut current: Option<usize> = None;
        for level in (0..=self.current_level).rev() {
            while let Some(next) = self.forward(current, level) {
                if self.nodes[next].key.borrow() < key {
                    current = Some(next);
                } else {
                    break;
                }
            }
        }
        let candidate = self.forward(current, 0)?;
        if self.nodes[candidate].key.borrow() == key {
            Some(candidate)
        } else {
            None
        }
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        let mut update = Vec::new();
        let candidate = self.descend(&key, &mut update);

        if let Some(idx) = candidate {
            if self.nodes[idx].key == key {
                self.nodes[idx].value = value;
                return false;
            }
        }

        let height = random_height(self.max_level);
        if height > self.current_level {
            for slot in update
                .iter_mut()
                .take(height + 1)
                .skip(self.current_level + 1)
            {
                *slot = None;
            }
            self.current_level = height;
        }

        let node_idx = self.nodes.insert(Node {
            key,
            value,
            height,
            forward: vec![None; height + 1],
        });
        for level in 0..=height {
            let next = self.forward(update[level], level);
            self.nodes[node_idx].forward[level] = next;
            self.set_forward(update[level], level, Some(node_idx));
        }

        self.len += 1;
        true
    }

    fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut update = Vec::new();
        let candidate = match self.descend(key, &mut update) {
            Some(idx) if self.nodes[idx].key.borrow() == key => idx,
            _ => return false,
        };

        for level in 0..=self.current_level {
            if self.forward(update[level], level) != Some(candidate) {
                break;
            }
            let next = self.nodes[candidate].forward[level];
            self.set_forward(update[level], level, next);
        }
        self.nodes.remove(candidate);

        while self.current_level > 0 && self.head[self.current_level].is_none() {
            self.current_level -= 1;
        }
        self.len -= 1;
        true
    }
}

impl SkipList<String, String> {
    /// Writes every entry to `filepath`, one `key:value` line per entry in
    /// key order. Keys must not contain the delimiter or a newline; values
    /// must not contain a newline — [`KvStore`](crate::KvStore) enforces
    /// this at the edge.
    pub fn dump_file(&self, filepath: &Path) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let file = File::create(filepath)?;
        let mut writer = BufWriter::new(file);

        let mut current = inner.head[0];
        while let Some(idx) = current {
            let node = &inner.nodes[idx];
            writeln!(writer, "{}{}{}", node.key, DELIMITER, node.value)?;
            current = node.forward[0];
        }
        writer.flush()?;
        debug!(entries = inner.len, path = %filepath.display(), "skip list dumped");
        Ok(())
    }

    /// Loads entries from `filepath` through the normal insert path. The
    /// whole file is read and parsed before the first insert so file I/O
    /// never interleaves with the lock. Empty lines, lines without the
    /// delimiter and lines with an empty key are skipped.
    pub fn load_file(&self, filepath: &Path) -> Result<()> {
        let file = match File::open(filepath) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %filepath.display(), error = %e, "failed to open snapshot");
                return Err(e.into());
            }
        };
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some((key, value)) = parse_entry(&line) {
                entries.push((key, value));
            }
        }
        let count = entries.len();
        for (key, value) in entries {
            self.insert(key, value);
        }
        debug!(entries = count, path = %filepath.display(), "skip list loaded");
        Ok(())
    }
}

/// splits a snapshot line on the first delimiter; `None` drops the line
fn parse_entry(line: &str) -> Option<(String, String)> {
    if line.is_empty() {
        return None;
    }
    let (key, value) = line.split_once(DELIMITER)?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// Draws a tower height from a geometric distribution with p = 0.25, capped
/// at `max_level - 1`. The generator state is thread local so concurrent
/// insertions do not serialize on a shared engine.
fn random_height(max_level: usize) -> usize {
    thread_local! {
        static RNG: Cell<u64> = Cell::new(seed());
    }

    RNG.with(|state| {
        let mut height = 0;
        while height < max_level - 1 {
            // xorshift64*
            let mut x = state.get();
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            state.set(x);
            let draw = x.wrapping_mul(0x2545_f491_4f6c_dd1d);
            if draw & 0b11 != 0 {
                break;
            }
            height += 1;
        }
        height
    })
}

/// per-thread nonzero seed from the standard library's own entropy
fn seed() -> u64 {
    let hash = RandomState::new().build_hasher().finish();
    hash | 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_and_search() {
        let list = SkipList::new();
        assert!(list.insert("key1".to_string(), "value1".to_string()));
        assert!(list.insert("key2".to_string(), "value2".to_string()));
        assert!(list.insert("key3".to_string(), "value3".to_string()));

        assert_eq!(list.len(), 3);
        assert_eq!(list.get("key1"), Some("value1".to_string()));
        assert_eq!(list.get("key2"), Some("value2".to_string()));
        assert_eq!(list.get("key3"), Some("value3".to_string()));
    }

    #[test]
    fn update_existing_key() {
        let list = SkipList::new();
        assert!(list.insert("key1".to_string(), "value1".to_string()));
        assert_eq!(list.len(), 1);

        // a second insert of the same key is an update, not a creation
        assert!(!list.insert("key1".to_string(), "new_value1".to_string()));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("key1"), Some("new_value1".to_string()));
    }

    #[test]
    fn remove() {
        let list = SkipList::new();
        list.insert("key1".to_string(), "value1".to_string());
        list.insert("key2".to_string(), "value2".to_string());
        list.insert("key3".to_string(), "value3".to_string());
        assert_eq!(list.len(), 3);

        assert!(list.remove("key2"));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get("key2"), None);

        assert_eq!(list.get("key1"), Some("value1".to_string()));
        assert_eq!(list.get("key3"), Some("value3".to_string()));
    }

    #[test]
    fn remove_nonexistent() {
        let list = SkipList::new();
        list.insert("key1".to_string(), "value1".to_string());

        assert!(!list.remove("nonexistent"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn contains() {
        let list = SkipList::new();
        list.insert("key1".to_string(), "value1".to_string());

        assert!(list.contains("key1"));
        assert!(!list.contains("key2"));
    }

    #[test]
    fn clear() {
        let list = SkipList::new();
        list.insert("key1".to_string(), "value1".to_string());
        list.insert("key2".to_string(), "value2".to_string());
        list.insert("key3".to_string(), "value3".to_string());
        assert_eq!(list.len(), 3);

        list.clear();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(!list.contains("key1"));
    }

    #[test]
    fn empty_list() {
        let list: SkipList<String, String> = SkipList::new();
        assert_eq!(list.len(), 0);
        assert_eq!(list.get("any"), None);
        assert!(!list.remove("any"));
        assert!(!list.contains("any"));
    }

    #[test]
    fn single_element() {
        let list = SkipList::new();
        list.insert("only".to_string(), "one".to_string());
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("only"), Some("one".to_string()));

        assert!(list.remove("only"));
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn large_data_set() {
        let list = SkipList::new();
        let count = 10_000;

        for i in 0..count {
            list.insert(format!("key{}", i), format!("value{}", i));
        }
        assert_eq!(list.len(), count);

        for i in 0..count {
            assert_eq!(list.get(&format!("key{}", i)), Some(format!("value{}", i)));
        }

        for i in (0..count).step_by(2) {
            assert!(list.remove(&format!("key{}", i)));
        }
        assert_eq!(list.len(), count / 2);
    }

    #[test]
    fn random_insertion_order() {
        let list = SkipList::new();
        // a fixed permutation of 0..1000 via a multiplicative stride
        let numbers: Vec<usize> = (0..1000).map(|i| (i * 389) % 1000).collect();

        for &n in &numbers {
            list.insert(format!("key{}", n), format!("value{}", n));
        }
        assert_eq!(list.len(), 1000);

        for &n in &numbers {
            assert_eq!(list.get(&format!("key{}", n)), Some(format!("value{}", n)));
        }
    }

    #[test]
    fn integer_keys() {
        let list: SkipList<i32, String> = SkipList::new();
        list.insert(3, "three".to_string());
        list.insert(1, "one".to_string());
        list.insert(2, "two".to_string());

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(&1), Some("one".to_string()));
        assert_eq!(list.get(&2), Some("two".to_string()));

        assert!(list.remove(&2));
        assert_eq!(list.get(&2), None);
    }

    #[test]
    fn concurrent_insert() {
        let list = Arc::new(SkipList::new());
        let num_threads = 4;
        let num_per_thread = 1000;

        let mut handles = Vec::new();
        for t in 0..num_threads {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..num_per_thread {
                    list.insert(format!("thread{}_key{}", t, i), format!("value{}", i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), num_threads * num_per_thread);
        for t in 0..num_threads {
            for i in 0..num_per_thread {
                assert_eq!(
                    list.get(&format!("thread{}_key{}", t, i)),
                    Some(format!("value{}", i))
                );
            }
        }
    }

    #[test]
    fn concurrent_read_write() {
        let list = Arc::new(SkipList::new());
        for i in 0..100 {
            list.insert(format!("key{}", i), format!("value{}", i));
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                let mut hits = 0;
                for i in 0..1000 {
                    let key = format!("key{}", i % 100);
                    if let Some(value) = list.get(&key) {
                        // a read must never observe a non-matching value
                        assert_eq!(value, format!("value{}", i % 100));
                        hits += 1;
                    }
                }
                hits
            }));
        }
        let mut writers = Vec::new();
        for t in 0..2 {
            let list = Arc::clone(&list);
            writers.push(thread::spawn(move || {
                for i in 0..500 {
                    list.insert(format!("new_key_{}_{}", t, i), format!("new_value{}", i));
                }
            }));
        }

        let mut total_hits = 0;
        for handle in handles {
            total_hits += handle.join().unwrap();
        }
        for handle in writers {
            handle.join().unwrap();
        }

        assert_eq!(total_hits, 2000);
        assert_eq!(list.len(), 100 + 1000);
    }

    #[test]
    fn dump_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiplist_test.db");

        let list = SkipList::new();
        list.insert("name".to_string(), "Alice".to_string());
        list.insert("age".to_string(), "25".to_string());
        list.insert("city".to_string(), "Beijing".to_string());
        list.dump_file(&path).unwrap();

        let restored: SkipList<String, String> = SkipList::new();
        restored.load_file(&path).unwrap();

        assert_eq!(restored.len(), 3);
        assert_eq!(restored.get("name"), Some("Alice".to_string()));
        assert_eq!(restored.get("age"), Some("25".to_string()));
        assert_eq!(restored.get("city"), Some("Beijing".to_string()));
    }

    #[test]
    fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("malformed.db");
        std::fs::write(&path, "a:1\n\nno-delimiter\n:empty-key\nb:2\n").unwrap();

        let list: SkipList<String, String> = SkipList::new();
        list.load_file(&path).unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("a"), Some("1".to_string()));
        assert_eq!(list.get("b"), Some("2".to_string()));
    }

    #[test]
    fn load_missing_file_fails_and_leaves_list_empty() {
        let list: SkipList<String, String> = SkipList::new();
        assert!(list.load_file(Path::new("/nonexistent/skiplist.db")).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn dump_writes_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ordered.db");

        let list = SkipList::new();
        list.insert("c".to_string(), "3".to_string());
        list.insert("a".to_string(), "1".to_string());
        list.insert("b".to_string(), "2".to_string());
        list.dump_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a:1\nb:2\nc:3\n");
    }
}
