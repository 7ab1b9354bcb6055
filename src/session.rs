use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "-http-session-";

/// Cache seam backing session storage. Values are opaque to the engine.
pub trait Cache: Send + Sync {
    /// Read a value.
    fn read(&self, key: &str) -> Option<String>;
    /// Write a value with a lifetime.
    fn write(&self, key: &str, value: &str, ttl: Duration);
    /// Remove a value. Returns true when it existed.
    fn remove(&self, key: &str) -> bool;
}

/// In-process cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

impl Cache for MemoryCache {
    fn read(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock");
        // Opportunistically prune expired entries.
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
    }

    fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .expect("cache lock")
            .remove(key)
            .is_some()
    }
}

/// A cookie-keyed key/value store bound to a server-side cache entry.
///
/// Keys are namespaced by the session id; serialized values are opaque
/// to the core.
pub struct Session {
    id: String,
    lifespan: Duration,
    cache: Arc<dyn Cache>,
    counter: Arc<()>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        lifespan: Duration,
        cache: Arc<dyn Cache>,
        counter: Arc<()>,
    ) -> Session {
        Session {
            id,
            lifespan,
            cache,
            counter,
        }
    }

    /// The opaque session id carried by the cookie.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// How many live session handles exist, this one included.
    pub(crate) fn live_count(&self) -> usize {
        Arc::strong_count(&self.counter)
    }

    fn key(&self, name: &str) -> String {
        format!("sess:{}:{}", self.id, name)
    }

    /// Read a session value.
    pub fn get(&self, name: &str) -> Option<String> {
        self.cache.read(&self.key(name))
    }

    /// Write a session value, refreshing its lifetime.
    pub fn set(&self, name: &str, value: &str) {
        self.cache.write(&self.key(name), value, self.lifespan);
    }

    /// Remove a session value.
    pub fn remove(&self, name: &str) -> bool {
        self.cache.remove(&self.key(name))
    }
}

/// Generate an opaque session id.
pub(crate) fn make_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    let mut id = String::with_capacity(32);
    for b in bytes {
        id.push_str(&format!("{:02x}", b));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.write("a", "1", Duration::from_secs(60));
        assert_eq!(cache.read("a").as_deref(), Some("1"));
        cache.write("b", "2", Duration::from_millis(0));
        assert_eq!(cache.read("b"), None);
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
    }

    #[test]
    fn session_namespaces_keys() {
        let cache = Arc::new(MemoryCache::new());
        let a = Session::new("A".into(), Duration::from_secs(60), cache.clone(), Arc::new(()));
        let b = Session::new("B".into(), Duration::from_secs(60), cache.clone(), Arc::new(()));
        a.set("user", "alice");
        b.set("user", "bob");
        assert_eq!(a.get("user").as_deref(), Some("alice"));
        assert_eq!(b.get("user").as_deref(), Some("bob"));
        assert!(a.remove("user"));
        assert_eq!(a.get("user"), None);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(make_session_id(), make_session_id());
        assert_eq!(make_session_id().len(), 32);
    }
}
