//! A size-limited LRU cache used for per-query tile-offset tables.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Values stored in a [`LimitedCache`] report their own weight in bytes.
pub trait CacheWeight {
	fn cache_weight(&self) -> u64;
}

impl CacheWeight for Vec<u64> {
	fn cache_weight(&self) -> u64 {
		(self.len() * std::mem::size_of::<u64>()) as u64
	}
}

/// An LRU cache bounded by the total byte weight of its values.
///
/// When an insertion would push the total weight over the limit, the least
/// recently used entries are evicted first. A single value heavier than the
/// whole limit is still admitted alone; the cache is a performance aid, not a
/// correctness boundary.
pub struct LimitedCache<K, V> {
	inner: Mutex<Inner<K, V>>,
	maximum_weight: u64,
}

struct Inner<K, V> {
	cache: LruCache<K, V>,
	weight: u64,
}

impl<K, V> LimitedCache<K, V>
where
	K: Clone + Eq + Hash,
	V: Clone + CacheWeight,
{
	/// Creates a cache bounded by `maximum_weight` bytes.
	pub fn with_maximum_weight(maximum_weight: u64) -> Self {
		Self {
			inner: Mutex::new(Inner {
				cache: LruCache::unbounded(),
				weight: 0,
			}),
			maximum_weight: maximum_weight.max(1),
		}
	}

	/// Looks up a value, refreshing its recency.
	pub fn get(&self, key: &K) -> Option<V> {
		self.inner.lock().unwrap().cache.get(key).cloned()
	}

	/// Inserts a value, evicting least-recently-used entries as needed.
	pub fn add(&self, key: K, value: V) {
		let mut inner = self.inner.lock().unwrap();
		let added = value.cache_weight();
		if let Some(old) = inner.cache.put(key, value) {
			inner.weight -= old.cache_weight();
		}
		inner.weight += added;
		while inner.weight > self.maximum_weight && inner.cache.len() > 1 {
			if let Some((_, evicted)) = inner.cache.pop_lru() {
				inner.weight -= evicted.cache_weight();
			} else {
				break;
			}
		}
	}

	/// The number of cached entries.
	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().cache.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The total byte weight of the cached values.
	pub fn weight(&self) -> u64 {
		self.inner.lock().unwrap().weight
	}

	/// Creates a cache bounded by an entry count instead of a byte weight.
	pub fn with_maximum_entries(entries: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				cache: LruCache::new(NonZeroUsize::new(entries.max(1)).unwrap()),
				weight: 0,
			}),
			maximum_weight: u64::MAX,
		}
	}
}
