use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const HANDLE_PREFIX: &str = "blob:drift/";

/// Process-local registry of decoded image bytes, addressed by opaque
/// handle URLs. Handles never survive a restart; callers rebuild them from
/// the persisted payload on every load and must revoke a handle before
/// dropping the view that holds it, or the bytes stay resident for the rest
/// of the session.
#[derive(Debug, Default)]
pub struct BlobRegistry {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    next_serial: AtomicU64,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` and returns a fresh handle URL. Handle identity is
    /// unique within the process but deliberately not stable across runs.
    pub fn create(&self, bytes: Vec<u8>) -> String {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let handle = format!("{HANDLE_PREFIX}{serial:08x}");
        self.entries
            .lock()
            .expect("blob registry lock poisoned")
            .insert(handle.clone(), bytes);
        handle
    }

    pub fn resolve(&self, handle: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("blob registry lock poisoned")
            .get(handle)
            .cloned()
    }

    /// Releases the bytes behind `handle`. Returns false when the handle is
    /// unknown or already revoked.
    pub fn revoke(&self, handle: &str) -> bool {
        self.entries
            .lock()
            .expect("blob registry lock poisoned")
            .remove(handle)
            .is_some()
    }

    pub fn is_handle(url: &str) -> bool {
        url.starts_with(HANDLE_PREFIX)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("blob registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_resolve_revoke() {
        let registry = BlobRegistry::new();
        let handle = registry.create(vec![1, 2, 3]);
        assert!(BlobRegistry::is_handle(&handle));
        assert_eq!(registry.resolve(&handle), Some(vec![1, 2, 3]));
        assert!(registry.revoke(&handle));
        assert_eq!(registry.resolve(&handle), None);
        assert!(!registry.revoke(&handle));
    }

    #[test]
    fn handles_are_unique_per_allocation() {
        let registry = BlobRegistry::new();
        let a = registry.create(vec![0]);
        let b = registry.create(vec![0]);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn hosted_urls_are_not_handles() {
        assert!(!BlobRegistry::is_handle("https://example.com/a.png"));
    }
}
