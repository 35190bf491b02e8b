//! A small bucketed associative table.
//!
//! The table is built with a fixed bucket count and a caller-chosen hash
//! function that maps a key to a bucket index. It never rehashes; the bucket
//! count only spreads entries. Bucket storage is reserved fallibly so that
//! exhaustion is reported instead of aborting the process.
//!
//! Keys are hashed and compared in their borrowed form `Q`, so a table keyed
//! by `PathBuf` is looked up with a plain `&Path`.
use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

/// Maps a key onto one of `buckets` buckets.
pub type HashFn<K> = fn(&K, usize) -> usize;

pub struct Table<K, V, Q: ?Sized = K> {
    buckets: Vec<Vec<(K, V)>>,
    hash: HashFn<Q>,
    len: usize,
}

impl<K, V, Q> Table<K, V, Q>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    /// Creates a table with `capacity` buckets keyed through `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero bucket count and
    /// [`Error::Allocation`] when the bucket array cannot be reserved.
    pub fn new(capacity: usize, hash: HashFn<Q>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_argument("a table needs at least one bucket"));
        }
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(capacity)
            .map_err(|e| Error::allocation("table buckets", e))?;
        buckets.resize_with(capacity, Vec::new);
        Ok(Self {
            buckets,
            hash,
            len: 0,
        })
    }

    fn bucket_of(&self, key: &Q) -> usize {
        (self.hash)(key, self.buckets.len()) % self.buckets.len()
    }

    /// Number of buckets the table was created with.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value` under `key`, returning the value it replaced.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let borrowed: &Q = key.borrow();
        let index = self.bucket_of(borrowed);
        let bucket = &mut self.buckets[index];
        if let Some(slot) = bucket.iter_mut().find(|(k, _)| matches(k, borrowed)) {
            return Ok(Some(std::mem::replace(&mut slot.1, value)));
        }
        bucket
            .try_reserve(1)
            .map_err(|e| Error::allocation("table entry", e))?;
        bucket.push((key, value));
        self.len += 1;
        Ok(None)
    }

    pub fn get(&self, key: &Q) -> Option<&V> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| matches(k, key))
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &Q) -> Option<&mut V> {
        let index = self.bucket_of(key);
        self.buckets[index]
            .iter_mut()
            .find(|(k, _)| matches(k, key))
            .map(|(_, v)| v)
    }

    /// Removes every entry, handing each to `release`. The bucket count is
    /// kept. Returns the number of entries released.
    pub fn drain_with(&mut self, mut release: impl FnMut(K, V)) -> usize {
        let mut released = 0;
        for bucket in &mut self.buckets {
            for (key, value) in bucket.drain(..) {
                release(key, value);
                released += 1;
            }
        }
        self.len = 0;
        released
    }
}

fn matches<K: Borrow<Q>, Q: Eq + ?Sized>(stored: &K, key: &Q) -> bool {
    stored.borrow() == key
}

impl<K: fmt::Debug, V: fmt::Debug, Q: ?Sized> fmt::Debug for Table<K, V, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.buckets.iter().flatten().map(|(k, v)| (k, v)))
            .finish()
    }
}
