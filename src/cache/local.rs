use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local fallback for the Cache capability (§4.2). Concurrent-safe;
/// in practice single-writer per key (the handler serving that instance's
/// heartbeat), readers may observe any consistent snapshot (§5).
pub struct LocalCache {
    map: DashMap<String, Entry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.map.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Instant::now() + ttl },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                drop(self.map.remove(key));
                None
            }
            None => None,
        }
    }

    pub fn delete(&self, key: &str) {
        self.map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_read_as_absent() {
        let cache = LocalCache::new();
        cache.set("k", "v", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn fresh_entries_round_trip() {
        let cache = LocalCache::new();
        cache.set("k", "v", Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }
}
