use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::path::CallShape;

/// Identity of one active call. Also serves as the reply correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// What the registry knows about an active call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub method: String,
    pub shape: CallShape,
}

/// Tracks active calls for one endpoint.
///
/// Entries are inserted when a call opens and removed when its guard drops,
/// so concurrent calls only ever touch their own entry.
#[derive(Debug)]
pub struct CallRegistry {
    calls: DashMap<CallId, CallInfo, ahash::RandomState>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: DashMap::default(),
        }
    }

    /// Record a call that just opened. The entry lives as long as the guard.
    pub fn open(self: &Arc<Self>, method: impl Into<String>, shape: CallShape) -> CallGuard {
        let id = CallId::new();
        self.calls.insert(
            id,
            CallInfo {
                method: method.into(),
                shape,
            },
        );
        CallGuard {
            id,
            map: Arc::clone(self),
        }
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn info(&self, id: &CallId) -> Option<CallInfo> {
        self.calls.get(id).map(|entry| entry.value().clone())
    }

    /// Calls opened and not yet finished.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn remove(&self, id: &CallId) {
        self.calls.remove(id);
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one call registered. Whichever task finishes the call last drops it.
pub struct CallGuard {
    id: CallId,
    map: Arc<CallRegistry>,
}

impl CallGuard {
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

impl fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_call() {
        let registry = Arc::new(CallRegistry::new());

        let guard = registry.open("PingSyncSync", CallShape::UNARY);
        let id = guard.id();
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.info(&id).unwrap().method, "PingSyncSync");

        drop(guard);
        assert!(!registry.contains(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_method_gets_distinct_calls() {
        let registry = Arc::new(CallRegistry::new());

        let first = registry.open("PingAsyncAsync", CallShape::BIDI_STREAMING);
        let second = registry.open("PingAsyncAsync", CallShape::BIDI_STREAMING);

        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&second.id()));
    }

    #[test]
    fn test_concurrent_open_and_close() {
        let registry = Arc::new(CallRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let guard = registry.open("PingSyncAsync", CallShape::SERVER_STREAMING);
                        assert!(registry.contains(&guard.id()));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
