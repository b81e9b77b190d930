//! Per-node cache of recent results.
//!
//! Each node owns a fixed ring of (event id, result) pairs sized to the
//! worker count plus two, so every worker can process a different event
//! while readers still find recently completed results by id. Accumulating
//! nodes alias every entry to one shared result.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::EventId;

use super::result::{ResultData, ResultHandle};
use super::ProcessorError;

/// Bound on how long a reader waits for a result to complete.
const ITEM_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    id: EventId,
    result: ResultHandle,
    complete: bool,
    in_use: bool,
}

struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
    latest: usize,
}

/// The cache ring of one node.
pub struct CachedList {
    inner: Mutex<Inner>,
    completed: Condvar,
    accumulating: bool,
    name: String,
}

impl CachedList {
    /// Creates a cache of `size` clones of `template`. With `accumulating`
    /// every entry shares one result instance.
    #[must_use]
    pub fn new(template: ResultData, size: usize, accumulating: bool) -> CachedList {
        let name = template.name().to_string();
        let entries = if accumulating {
            let shared = template.into_handle();
            (0..size)
                .map(|_| Entry {
                    id: 0,
                    result: shared.clone(),
                    complete: false,
                    in_use: false,
                })
                .collect()
        } else {
            (0..size)
                .map(|_| Entry {
                    id: 0,
                    result: template.clone().into_handle(),
                    complete: false,
                    in_use: false,
                })
                .collect()
        };
        CachedList {
            inner: Mutex::new(Inner {
                entries,
                cursor: 0,
                latest: 0,
            }),
            completed: Condvar::new(),
            accumulating,
            name,
        }
    }

    /// Reserves an entry for event `id` and returns its result.
    ///
    /// Non-accumulating caches zero the result; accumulating caches keep
    /// their running state.
    pub fn reserve(&self, id: EventId) -> ResultHandle {
        let handle = {
            let mut inner = self.inner.lock().expect("cache poisoned");
            let len = inner.entries.len();
            let mut index = inner.cursor;
            let mut scanned = 0;
            while scanned < len && inner.entries[index].in_use {
                index = (index + 1) % len;
                scanned += 1;
            }
            if scanned == len {
                warn!("'{}': all cache entries busy, overwriting", self.name);
            }
            inner.cursor = (index + 1) % len;
            let entry = &mut inner.entries[index];
            entry.id = id;
            entry.complete = false;
            entry.in_use = true;
            entry.result.clone()
        };
        if !self.accumulating {
            let mut result = handle.write().expect("result lock poisoned");
            result.clear();
            result.set_event_id(id);
        }
        handle
    }

    /// Marks the entry of event `id` complete; with `make_latest` it also
    /// becomes the node's latest result.
    pub fn publish(&self, id: EventId, make_latest: bool) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if let Some(index) = inner.entries.iter().position(|e| e.id == id && e.in_use) {
            inner.entries[index].complete = true;
            if make_latest {
                inner.latest = index;
            }
        }
        drop(inner);
        self.completed.notify_all();
    }

    /// The completed result of event `id`; waits a bounded time for it.
    pub fn item(&self, id: EventId) -> Result<ResultHandle, ProcessorError> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        let deadline = std::time::Instant::now() + ITEM_TIMEOUT;
        loop {
            if let Some(entry) = inner.entries.iter().find(|e| e.id == id && e.complete) {
                return Ok(entry.result.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(ProcessorError::ResultTimeout {
                    name: self.name.clone(),
                    id,
                });
            }
            let (guard, _) = self
                .completed
                .wait_timeout(inner, deadline - now)
                .expect("cache poisoned");
            // re-check before giving up, the entry may have completed at
            // the deadline
            inner = guard;
        }
    }

    /// The most recently completed result.
    #[must_use]
    pub fn latest(&self) -> ResultHandle {
        let inner = self.inner.lock().expect("cache poisoned");
        inner.entries[inner.latest].result.clone()
    }

    /// Releases the entry of event `id` for reuse.
    pub fn release(&self, id: EventId) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            entry.in_use = false;
        }
    }

    /// Zeroes every entry (and the running state of accumulating nodes).
    pub fn clear_all(&self) {
        let inner = self.inner.lock().expect("cache poisoned");
        for entry in &inner.entries {
            entry
                .result
                .write()
                .expect("result lock poisoned")
                .clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::result::{Axis, ResultData};

    fn cache(size: usize) -> CachedList {
        CachedList::new(
            ResultData::new_1d("node", Axis::new(4, 0.0, 4.0, "")),
            size,
            false,
        )
    }

    #[test]
    fn reserve_publish_item_cycle() {
        let cache = cache(3);
        let handle = cache.reserve(42);
        handle.write().unwrap().fill_1d(1.5, 2.0);
        cache.publish(42, true);

        let got = cache.item(42).unwrap();
        assert_eq!(got.read().unwrap().bins()[1], 2.0);
        assert_eq!(cache.latest().read().unwrap().event_id(), 42);
        cache.release(42);
    }

    #[test]
    fn reserve_zeroes_previous_content() {
        let cache = cache(1);
        let handle = cache.reserve(1);
        handle.write().unwrap().fill_1d(0.5, 1.0);
        cache.publish(1, true);
        cache.release(1);

        let handle = cache.reserve(2);
        assert_eq!(handle.read().unwrap().bins(), &[0.0; 4]);
        assert_eq!(handle.read().unwrap().event_id(), 2);
    }

    #[test]
    fn accumulating_cache_shares_state() {
        let cache = CachedList::new(ResultData::new_scalar("count"), 3, true);
        for id in 1..=5 {
            let handle = cache.reserve(id);
            {
                let mut result = handle.write().unwrap();
                let v = result.scalar().unwrap_or(0.0);
                result.set_scalar(v + 1.0);
            }
            cache.publish(id, true);
            cache.release(id);
        }
        assert_eq!(cache.latest().read().unwrap().scalar(), Some(5.0));
    }

    #[test]
    fn item_waits_for_completion() {
        let cache = std::sync::Arc::new(cache(2));
        cache.reserve(7);
        let publisher = {
            let cache = std::sync::Arc::clone(&cache);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                cache.publish(7, true);
            })
        };
        // blocks until the publisher marks the entry complete
        assert!(cache.item(7).is_ok());
        publisher.join().unwrap();
    }
}
