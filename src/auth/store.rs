use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use super::digest::{const_time_eq, md5_hex};

/// A stored credential as returned by a [`CredentialStore`].
#[derive(Debug, Clone)]
pub struct StoredPassword {
    /// The password, or `MD5(user:realm:password)` when digest-ready.
    pub secret: String,
    /// True when `secret` is a digest-ready HA1 hash.
    pub digest_ready: bool,
    /// Disabled users never authenticate.
    pub enabled: bool,
}

/// Pluggable credential backend.
///
/// Backends that cannot return the stored secret (for example a host OS
/// authentication stack) may return an empty secret from `lookup` and do
/// all the work in `validate`.
pub trait CredentialStore: Send + Sync {
    /// Look up the stored credential for `(realm, user)`.
    fn lookup(&self, realm: &str, user: &str) -> Option<StoredPassword>;

    /// Validate a cleartext password offered by the peer against the
    /// stored credential. Digest verification happens in the engine and
    /// does not call this.
    fn validate(&self, realm: &str, user: &str, provided: &str, stored: &StoredPassword) -> bool {
        if stored.digest_ready {
            let computed = md5_hex(&format!("{}:{}:{}", user, realm, provided));
            const_time_eq(computed.as_bytes(), stored.secret.as_bytes())
        } else {
            const_time_eq(provided.as_bytes(), stored.secret.as_bytes())
        }
    }
}

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<(String, String), StoredPassword>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Add a user with a cleartext password.
    pub fn add_user(&self, realm: &str, user: &str, password: &str) {
        self.users.lock().expect("store lock").insert(
            (realm.to_string(), user.to_string()),
            StoredPassword {
                secret: password.to_string(),
                digest_ready: false,
                enabled: true,
            },
        );
    }

    /// Add a user keyed by a digest-ready `MD5(user:realm:password)`.
    pub fn add_digest_user(&self, realm: &str, user: &str, password: &str) {
        self.users.lock().expect("store lock").insert(
            (realm.to_string(), user.to_string()),
            StoredPassword {
                secret: md5_hex(&format!("{}:{}:{}", user, realm, password)),
                digest_ready: true,
                enabled: true,
            },
        );
    }

    /// Disable a user without removing it.
    pub fn disable_user(&self, realm: &str, user: &str) {
        if let Some(stored) = self
            .users
            .lock()
            .expect("store lock")
            .get_mut(&(realm.to_string(), user.to_string()))
        {
            stored.enabled = false;
        }
    }
}

impl CredentialStore for MemoryStore {
    fn lookup(&self, realm: &str, user: &str) -> Option<StoredPassword> {
        self.users
            .lock()
            .expect("store lock")
            .get(&(realm.to_string(), user.to_string()))
            .cloned()
    }
}

/// File-backed credential store.
///
/// The file carries one user per line:
///
/// ```text
/// enabled ":" realm ":" user ":" password-or-HA1
/// ```
///
/// Lines starting with `#` and blank lines are ignored. When the file
/// stores digest-ready hashes the password field is
/// `MD5(user:realm:password)`.
pub struct FileStore {
    users: HashMap<(String, String), StoredPassword>,
}

impl FileStore {
    /// Load a user file. `digest_ready` declares whether the password
    /// column holds HA1 hashes.
    pub fn open(path: impl AsRef<Path>, digest_ready: bool) -> std::io::Result<FileStore> {
        let file = std::fs::File::open(path.as_ref())?;
        let mut users = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(4, ':');
            let enabled = fields.next().map(str::trim);
            let realm = fields.next().map(str::trim);
            let user = fields.next().map(str::trim);
            let password = fields.next().map(str::trim);
            let (enabled, realm, user, password) = match (enabled, realm, user, password) {
                (Some(e), Some(r), Some(u), Some(p)) => (e, r, u, p),
                _ => {
                    debug!(%line, "skipping malformed user line");
                    continue;
                }
            };
            users.insert(
                (realm.to_string(), user.to_string()),
                StoredPassword {
                    secret: password.to_string(),
                    digest_ready,
                    enabled: enabled != "0",
                },
            );
        }
        debug!(count = users.len(), "loaded user file");
        Ok(FileStore { users })
    }
}

impl CredentialStore for FileStore {
    fn lookup(&self, realm: &str, user: &str) -> Option<StoredPassword> {
        self.users
            .get(&(realm.to_string(), user.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_store_validates() {
        let store = MemoryStore::new();
        store.add_user("R", "joe", "secret");
        let stored = store.lookup("R", "joe").unwrap();
        assert!(store.validate("R", "joe", "secret", &stored));
        assert!(!store.validate("R", "joe", "wrong", &stored));
        assert!(store.lookup("R", "jane").is_none());
    }

    #[test]
    fn digest_ready_validation() {
        let store = MemoryStore::new();
        store.add_digest_user("R", "joe", "secret");
        let stored = store.lookup("R", "joe").unwrap();
        assert!(stored.digest_ready);
        assert!(store.validate("R", "joe", "secret", &stored));
        assert!(!store.validate("R", "joe", "wrong", &stored));
    }

    #[test]
    fn file_store_parses_user_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "1:R:joe:secret").unwrap();
        writeln!(file, "0:R:mallory:guess").unwrap();
        writeln!(file, "garbage-line").unwrap();
        file.flush().unwrap();

        let store = FileStore::open(file.path(), false).unwrap();
        let joe = store.lookup("R", "joe").unwrap();
        assert!(joe.enabled);
        assert_eq!(joe.secret, "secret");
        let mallory = store.lookup("R", "mallory").unwrap();
        assert!(!mallory.enabled);
        assert!(store.lookup("R", "nobody").is_none());
    }
}
