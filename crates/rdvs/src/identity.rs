use rdv_common::ClientId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues client identities. Each identity is a random UUIDv4, redrawn on
/// the (vanishingly unlikely) event that it is already in use.
#[derive(Debug, Default)]
pub struct IdentityAllocator {
    issued: AtomicU64,
}

impl IdentityAllocator {
    /// Create an allocator that has issued nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh identity for which `is_taken` returns `false`.
    pub fn allocate(&self, is_taken: impl Fn(&ClientId) -> bool) -> ClientId {
        loop {
            let id = ClientId::generate();
            if !is_taken(&id) {
                self.issued.fetch_add(1, Ordering::Relaxed);
                return id;
            }
            tracing::warn!(client = %id, "identity collision, drawing again");
        }
    }

    /// Number of identities issued so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    #[test]
    fn allocations_are_unique_and_counted() {
        let alloc = IdentityAllocator::new();
        let ids: HashSet<ClientId> = (0..1000).map(|_| alloc.allocate(|_| false)).collect();
        assert_eq!(ids.len(), 1000);
        assert_eq!(alloc.issued(), 1000);
    }

    #[test]
    fn taken_identity_is_redrawn() {
        let alloc = IdentityAllocator::new();
        let rejections = Cell::new(0);
        let id = alloc.allocate(|_| {
            rejections.set(rejections.get() + 1);
            rejections.get() <= 2
        });
        assert_eq!(rejections.get(), 3);
        assert!(!id.as_str().is_empty());
        assert_eq!(alloc.issued(), 1);
    }
}
