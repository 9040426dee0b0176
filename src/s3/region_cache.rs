use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Upper bound on distinct buckets the agent remembers a region for.
pub const MAX_CACHED_BUCKETS: usize = 128;

/// Bucket name → region map, bounded by least-recently-used eviction and safe
/// for concurrent use.
pub struct RegionCache {
    entries: Mutex<LruCache<String, String>>,
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_BUCKETS).expect("cache bound is non-zero"),
            )),
        }
    }

    pub fn get(&self, bucket: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .cloned()
    }

    pub fn put(&self, bucket: &str, region: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(bucket.to_string(), region.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let cache = RegionCache::new();
        assert!(cache.get("bucket-1").is_none());

        cache.put("bucket-1", "cn-north-1");
        assert_eq!(cache.get("bucket-1"), Some("cn-north-1".to_string()));

        cache.put("bucket-1", "eu-west-1");
        assert_eq!(cache.get("bucket-1"), Some("eu-west-1".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_least_recently_used_bucket_is_evicted() {
        let cache = RegionCache::new();
        for i in 0..MAX_CACHED_BUCKETS {
            cache.put(&format!("bucket-{i}"), "us-east-1");
        }
        assert_eq!(cache.len(), MAX_CACHED_BUCKETS);

        // touch bucket-0 so bucket-1 becomes the least recently used
        assert!(cache.get("bucket-0").is_some());

        cache.put("bucket-overflow", "us-east-1");
        assert_eq!(cache.len(), MAX_CACHED_BUCKETS);
        assert!(cache.get("bucket-1").is_none());
        assert!(cache.get("bucket-0").is_some());
        assert!(cache.get("bucket-overflow").is_some());
    }
}
