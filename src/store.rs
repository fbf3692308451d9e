//! Concurrent, TTL-indexed mapping from secret name to envelope-sealed record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::crypto::{Crypto, CryptoError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such secret")]
    NotFound,
    #[error("not authorized for this secret")]
    Forbidden,
    #[error("seal failed: {0}")]
    Seal(#[source] CryptoError),
    #[error("open failed: {0}")]
    Open(#[source] CryptoError),
}

/// `0` denotes "shared with any allowed peer" per spec's data model.
pub const SHARED_OWNER: u32 = 0;

/// `None` expiry means "never expires", equivalent to the wire protocol's
/// `expires_at == 0` sentinel; using `Option<Instant>` internally keeps the
/// deadline comparison entirely in the monotonic clock domain.
struct SecretRecord {
    ciphertext: Vec<u8>,
    nonce: [u8; crate::crypto::NONCE_LEN],
    tag: [u8; crate::crypto::TAG_LEN],
    owner: u32,
    expires_at: Option<Instant>,
}

impl Drop for SecretRecord {
    fn drop(&mut self) {
        self.ciphertext.zeroize();
    }
}

impl SecretRecord {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }

    fn visible_to(&self, requester_id: u32) -> bool {
        self.owner == SHARED_OWNER || self.owner == requester_id
    }
}

struct Inner {
    records: HashMap<String, SecretRecord>,
}

/// The secret store: one mutex, short critical sections (a memcpy plus one
/// AES-GCM pass), guarded mapping from name to sealed record.
pub struct Store {
    inner: Mutex<Inner>,
    crypto: Arc<Crypto>,
    default_ttl: Option<Duration>,
}

impl Store {
    pub fn new(crypto: Arc<Crypto>, default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner { records: HashMap::new() }),
            crypto,
            default_ttl,
        }
    }

    /// Encrypts `value` and inserts (or atomically replaces) the record for `name`.
    ///
    /// `ttl` of `None` asks for the configured default (itself `None` if the
    /// agent has no default, meaning "never expires"); `Some(d)` pins the
    /// record's lifetime to exactly `d` regardless of the configured default.
    pub fn put(
        &self,
        name: &str,
        value: &[u8],
        ttl: Option<Duration>,
        requester_id: u32,
    ) -> Result<(), StoreError> {
        let sealed = self.crypto.seal(value).map_err(StoreError::Seal)?;
        let effective_ttl = ttl.or(self.default_ttl);
        let expires_at = effective_ttl.map(|d| Instant::now() + d);

        let record = SecretRecord {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            tag: sealed.tag,
            owner: requester_id,
            expires_at,
        };

        let mut inner = self.inner.lock().unwrap();
        // Dropping the previous record (if any) zeroes its ciphertext before release.
        inner.records.insert(name.to_string(), record);
        debug!(name, owner = requester_id, "secret stored");
        Ok(())
    }

    /// Looks up, authorizes, and decrypts `name`. Returns owned plaintext.
    ///
    /// An absent, expired, or unauthorized record is uniformly reported as
    /// [`StoreError::NotFound`]/[`StoreError::Forbidden`]; an expired record
    /// found here is also dropped immediately (lazy eviction), the sweeper
    /// being the backstop that guarantees bounded staleness even with no
    /// reader.
    pub fn open(&self, name: &str, requester_id: u32) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let expired = matches!(inner.records.get(name), Some(r) if r.is_expired(now));
        if expired {
            inner.records.remove(name);
        }

        let record = inner.records.get(name).ok_or(StoreError::NotFound)?;
        if !record.visible_to(requester_id) {
            return Err(StoreError::Forbidden);
        }

        let plaintext = self
            .crypto
            .open(&record.ciphertext, &record.nonce, &record.tag)
            .map_err(StoreError::Open)?;
        Ok(plaintext)
    }

    pub fn delete(&self, name: &str, requester_id: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.records.get(name) {
            None => Err(StoreError::NotFound),
            Some(r) if !r.visible_to(requester_id) => Err(StoreError::Forbidden),
            Some(_) => {
                inner.records.remove(name);
                Ok(())
            }
        }
    }

    /// Names visible to `requester_id` whose expiry has not passed.
    pub fn list(&self, requester_id: u32) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .records
            .iter()
            .filter(|(_, r)| !r.is_expired(now) && r.visible_to(requester_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    /// Evicts every record whose deadline has passed. Returns the count evicted.
    fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            inner.records.remove(name);
        }
        expired.len()
    }

    /// Destroys every remaining record. Called once from the shutdown path.
    fn destroy_all(&self) {
        self.inner.lock().unwrap().records.clear();
    }
}

/// Background thread that evicts expired records on a fixed cadence.
pub struct Sweeper {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(store: Arc<Store>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_cl = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_cl.load(Ordering::Relaxed) {
                thread::sleep(period);
                let evicted = store.sweep();
                if evicted > 0 {
                    info!(evicted, "sweeper evicted expired secrets");
                }
            }
            store.destroy_all();
        });
        Self { stop, handle: Some(handle) }
    }

    /// Signals the sweeper to stop and joins it. The store's remaining
    /// records are destroyed by the sweeper thread as its last act.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(Arc::new(Crypto::generate().unwrap()), None)
    }

    #[test]
    fn put_get_roundtrip() {
        let s = store();
        s.put("pw", b"swordfish", None, 1000).unwrap();
        let out = s.open("pw", 1000).unwrap();
        assert_eq!(out, b"swordfish");
    }

    #[test]
    fn cross_user_denied() {
        let s = store();
        s.put("api", b"tok", None, 1000).unwrap();
        assert!(matches!(s.open("api", 1001), Err(StoreError::Forbidden)));
        assert!(matches!(s.delete("api", 1001), Err(StoreError::Forbidden)));
    }

    #[test]
    fn shared_owner_visible_to_anyone() {
        let s = store();
        s.put("shared", b"v", None, SHARED_OWNER).unwrap();
        assert_eq!(s.open("shared", 42).unwrap(), b"v");
    }

    #[test]
    fn ttl_expiry_then_absence() {
        let s = store();
        s.put("eph", b"v", Some(Duration::from_millis(10)), 1000).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(matches!(s.open("eph", 1000), Err(StoreError::NotFound)));
        assert!(!s.list(1000).contains(&"eph".to_string()));
    }

    #[test]
    fn sweeper_evicts_expired_and_updates_size() {
        let s = Arc::new(store());
        s.put("eph", b"v", Some(Duration::from_millis(10)), 1000).unwrap();
        assert_eq!(s.size(), 1);
        let sweeper = Sweeper::spawn(Arc::clone(&s), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(s.size(), 0);
        sweeper.shutdown();
    }

    #[test]
    fn overwrite_never_yields_old_value() {
        let s = store();
        s.put("k", b"v1", None, 1000).unwrap();
        s.put("k", b"v2-longer-value", None, 1000).unwrap();
        assert_eq!(s.open("k", 1000).unwrap(), b"v2-longer-value");
    }

    #[test]
    fn list_filters_by_owner() {
        let s = store();
        s.put("a1", b"x", None, 1000).unwrap();
        s.put("a2", b"x", None, 1000).unwrap();
        s.put("b1", b"x", None, 1001).unwrap();
        let mut from_a = s.list(1000);
        from_a.sort();
        assert_eq!(from_a, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(s.list(1001), vec!["b1".to_string()]);
    }
}
