//! Exit registry
//!
//! Concurrency-safe map from pubKeyHash to the live reverse-tunnel
//! connection. At most one entry per hash exists at any instant; a newer
//! registration closes and replaces the old connection. Eviction from
//! failure paths goes through [`Registry::remove_if_match`], which
//! compares connection identity under the write lock so a stale handle
//! can never evict a newer registration.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use veilgate_protocol::ExitKeyEntry;

/// Close reason sent to a connection displaced by a newer registration.
pub const REASON_REPLACED: &[u8] = b"replaced by new connection";
/// Close reason sent when the heartbeat TTL expires.
pub const REASON_HEARTBEAT_TIMEOUT: &[u8] = b"heartbeat timeout";

/// The slice of connection behavior the registry needs. Implemented for
/// `quinn::Connection`; tests use in-process mocks.
pub trait RegistryConn: Clone + Send + Sync + 'static {
    /// Stable identity token for this connection handle. Two handles to
    /// the same underlying connection return the same id.
    fn conn_id(&self) -> usize;

    /// Close with an application error code and reason. Non-blocking.
    fn close_with_reason(&self, code: u32, reason: &[u8]);
}

impl RegistryConn for quinn::Connection {
    fn conn_id(&self) -> usize {
        self.stable_id()
    }

    fn close_with_reason(&self, code: u32, reason: &[u8]) {
        self.close(quinn::VarInt::from_u32(code), reason);
    }
}

struct ExitEntry<C> {
    conn: C,
    key_config: Vec<u8>,
    #[allow(dead_code)]
    registered_at: Instant,
    last_heartbeat: Instant,
}

/// pubKeyHash → live exit connection.
pub struct Registry<C: RegistryConn> {
    entries: RwLock<HashMap<String, ExitEntry<C>>>,
}

impl<C: RegistryConn> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: RegistryConn> Registry<C> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an exit connection. An existing entry for the same hash is
    /// closed and overwritten; the last registration wins.
    pub fn register(&self, pub_key_hash: &str, conn: C, key_config: Vec<u8>) {
        let mut entries = self.entries.write().unwrap();
        if let Some(old) = entries.get(pub_key_hash) {
            info!("exit {pub_key_hash} re-registered, closing old connection");
            old.conn.close_with_reason(0, REASON_REPLACED);
        }
        let now = Instant::now();
        entries.insert(
            pub_key_hash.to_string(),
            ExitEntry {
                conn,
                key_config,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        info!("exit registered: {pub_key_hash} ({} total)", entries.len());
    }

    /// Return the currently registered connection for a hash.
    pub fn lookup(&self, pub_key_hash: &str) -> Option<C> {
        let entries = self.entries.read().unwrap();
        entries.get(pub_key_hash).map(|e| e.conn.clone())
    }

    /// Unconditional removal, for whole-registry teardown only. Failure
    /// paths must use [`Registry::remove_if_match`].
    pub fn remove(&self, pub_key_hash: &str) {
        let mut entries = self.entries.write().unwrap();
        if entries.remove(pub_key_hash).is_some() {
            info!("exit removed: {pub_key_hash} ({} total)", entries.len());
        }
    }

    /// Remove the entry only if it still holds the given connection.
    /// Returns whether a deletion occurred. Between observing a stale
    /// connection and deleting it, a newer registration may have replaced
    /// it; the identity compare under the lock makes that race harmless.
    pub fn remove_if_match(&self, pub_key_hash: &str, conn: &C) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get(pub_key_hash) {
            Some(entry) if entry.conn.conn_id() == conn.conn_id() => {
                entries.remove(pub_key_hash);
                info!("exit removed (matched): {pub_key_hash} ({} total)", entries.len());
                true
            }
            Some(_) => {
                debug!("exit {pub_key_hash} already re-registered, skipping removal");
                false
            }
            None => false,
        }
    }

    /// Refresh the heartbeat timestamp. A late heartbeat for a replaced
    /// registration silently no-ops rather than creating a ghost entry.
    pub fn update_heartbeat(&self, pub_key_hash: &str) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(pub_key_hash) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Close and evict every entry whose last heartbeat is older than the
    /// TTL. The closed exit observes the close and reconnects.
    pub fn cleanup(&self, ttl: Duration) {
        let mut entries = self.entries.write().unwrap();
        let now = Instant::now();
        entries.retain(|hash, entry| {
            let age = now.duration_since(entry.last_heartbeat);
            if age > ttl {
                warn!("exit {hash} heartbeat timed out ({age:?}), removing");
                entry.conn.close_with_reason(0, REASON_HEARTBEAT_TIMEOUT);
                false
            } else {
                true
            }
        });
    }

    /// Snapshot of live entries that advertised a non-empty KeyConfig.
    pub fn list_exit_keys(&self) -> Vec<ExitKeyEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|(_, e)| !e.key_config.is_empty())
            .map(|(hash, e)| ExitKeyEntry {
                pub_key_hash: hash.clone(),
                key_config: e.key_config.clone(),
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct MockConn {
        id: usize,
        closed: Arc<AtomicBool>,
    }

    impl MockConn {
        fn new(id: usize) -> Self {
            Self {
                id,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl RegistryConn for MockConn {
        fn conn_id(&self) -> usize {
            self.id
        }

        fn close_with_reason(&self, _code: u32, _reason: &[u8]) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_lookup() {
        let registry = Registry::new();
        let conn = MockConn::new(1);
        registry.register("h", conn.clone(), vec![1]);

        let found = registry.lookup("h").unwrap();
        assert_eq!(found.conn_id(), 1);
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_reregister_closes_old_connection() {
        let registry = Registry::new();
        let old = MockConn::new(1);
        let new = MockConn::new(2);

        registry.register("h", old.clone(), vec![1]);
        registry.register("h", new.clone(), vec![2]);

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(registry.lookup("h").unwrap().conn_id(), 2);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_concurrent_registers_single_owner() {
        let registry = Arc::new(Registry::new());
        let conns: Vec<MockConn> = (0..16).map(MockConn::new).collect();

        let handles: Vec<_> = conns
            .iter()
            .cloned()
            .map(|conn| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register("h", conn, vec![1]))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.count(), 1);
        let winner = registry.lookup("h").unwrap();
        // Exactly the registered connection is open; every loser was closed.
        for conn in &conns {
            if conn.conn_id() == winner.conn_id() {
                assert!(!conn.is_closed());
            } else {
                assert!(conn.is_closed());
            }
        }
    }

    #[test]
    fn test_remove_if_match_skips_newer_registration() {
        let registry = Registry::new();
        let stale = MockConn::new(1);
        let current = MockConn::new(2);

        registry.register("h", stale.clone(), vec![]);
        registry.register("h", current.clone(), vec![]);

        // A failure path still holding the stale handle must not evict.
        assert!(!registry.remove_if_match("h", &stale));
        assert_eq!(registry.lookup("h").unwrap().conn_id(), 2);

        assert!(registry.remove_if_match("h", &current));
        assert!(registry.lookup("h").is_none());
        assert!(!registry.remove_if_match("h", &current));
    }

    #[test]
    fn test_update_heartbeat_missing_entry_is_noop() {
        let registry: Registry<MockConn> = Registry::new();
        registry.update_heartbeat("ghost");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_cleanup_evicts_and_closes_expired() {
        let registry = Registry::new();
        let conn = MockConn::new(1);
        registry.register("h", conn.clone(), vec![1]);

        std::thread::sleep(Duration::from_millis(30));
        registry.cleanup(Duration::from_millis(10));

        assert!(conn.is_closed());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_heartbeat_keeps_entry_alive() {
        let registry = Registry::new();
        let conn = MockConn::new(1);
        registry.register("h", conn.clone(), vec![1]);

        let ttl = Duration::from_millis(50);
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(15));
            registry.update_heartbeat("h");
            registry.cleanup(ttl);
            assert_eq!(registry.count(), 1, "entry expired despite heartbeats");
        }
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_list_exit_keys_skips_empty_configs() {
        let registry = Registry::new();
        registry.register("with", MockConn::new(1), vec![9, 9]);
        registry.register("without", MockConn::new(2), vec![]);

        let keys = registry.list_exit_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].pub_key_hash, "with");
        assert_eq!(keys[0].key_config, vec![9, 9]);
    }
}
