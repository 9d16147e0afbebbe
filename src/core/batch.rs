//! KN-012: Batched external reads with bounded retry.
//!
//! A backing store may process only part of a batch and hand back the keys it
//! skipped. Those keys are retried a bounded number of times; anything still
//! unprocessed after the last attempt fails the whole read.

use super::error::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;

/// Attempts per batch before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Largest batch handed to a reader at once.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// One response from a batched read.
#[derive(Debug, Clone)]
pub struct BatchPage<K, V> {
    /// Items found, keyed. Keys with no item are simply absent.
    pub items: Vec<(K, V)>,
    /// Keys the store did not get to; retried by the caller
    pub unprocessed: Vec<K>,
}

impl<K, V> Default for BatchPage<K, V> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            unprocessed: Vec::new(),
        }
    }
}

/// A store that reads many keys per request.
pub trait BatchReader {
    type Key: Eq + Hash + Clone + std::fmt::Debug;
    type Item;

    fn read_batch(&mut self, keys: &[Self::Key]) -> Result<BatchPage<Self::Key, Self::Item>>;
}

/// Read one batch, retrying unprocessed keys up to `max_attempts` times.
///
/// Results come back in the order of `keys`; `None` for keys the store has no
/// item for.
pub fn get_batch<R: BatchReader>(
    reader: &mut R,
    keys: &[R::Key],
    max_attempts: usize,
) -> Result<Vec<Option<R::Item>>> {
    let order: HashMap<&R::Key, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let mut results: Vec<Option<R::Item>> = std::iter::repeat_with(|| None).take(keys.len()).collect();

    let mut query: Vec<R::Key> = keys.to_vec();
    for attempt in 1..=max_attempts {
        tracing::debug!(attempt, keys = query.len(), "batch read");
        let page = reader.read_batch(&query)?;
        let found = page.items.len();
        for (key, item) in page.items {
            if let Some(&i) = order.get(&key) {
                results[i] = Some(item);
            }
        }
        tracing::debug!(found, unprocessed = page.unprocessed.len(), "batch page");
        if page.unprocessed.is_empty() {
            return Ok(results);
        }
        query = page.unprocessed;
    }

    tracing::warn!(remaining = query.len(), attempts = max_attempts, "batch read gave up");
    Err(Error::UnprocessedItems {
        remaining: query.len(),
        attempts: max_attempts,
    })
}

/// Read any number of keys in chunks of `chunk_size`.
pub fn get_many<R: BatchReader>(
    reader: &mut R,
    keys: &[R::Key],
    chunk_size: usize,
    max_attempts: usize,
) -> Result<Vec<Option<R::Item>>> {
    let mut results = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(chunk_size.max(1)) {
        results.extend(get_batch(reader, chunk, max_attempts)?);
    }
    Ok(results)
}
