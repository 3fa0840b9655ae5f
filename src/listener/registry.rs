use super::MatchMode;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// One pattern registration. The pattern bytes are the uniqueness key; the
// ordered sequence below decides match precedence.
struct Registration<L: ?Sized> {
    mode: MatchMode,
    listener: Arc<L>,
}

/// Ordered pattern-to-listener table with per-instance default listener.
///
/// Registration order is match-attempt order: [`resolve`](Self::resolve)
/// returns the first registration whose pattern matches, so more specific
/// patterns should be registered first. Registering a byte-identical pattern
/// again overwrites the existing entry's listener and mode but keeps its
/// position in the match order.
///
/// Every registry is constructed with a fallback listener, so default
/// resolution never comes up empty: [`default`](Self::default_listener)
/// returns the per-instance default if one was set, else the fallback.
///
/// The registry itself performs no locking; connections wrap it in a mutex
/// and clone resolved listeners out before invoking them.
pub struct ListenerRegistry<L: ?Sized> {
    // Match order. Holds the pattern keys; the map holds the registrations.
    order: Vec<Vec<u8>>,
    entries: HashMap<Vec<u8>, Registration<L>>,
    default: Option<Arc<L>>,
    fallback: Arc<L>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Creates a registry with the required fallback default listener.
    pub fn new(fallback: Arc<L>) -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            default: None,
            fallback,
        }
    }

    /// Registers a listener under a byte pattern.
    ///
    /// No-op if `pattern` is empty. If a byte-identical pattern is already
    /// registered, its listener and mode are overwritten in place and the
    /// original match-order position is kept.
    pub fn register(&mut self, pattern: &[u8], listener: Arc<L>, mode: MatchMode) {
        if pattern.is_empty() {
            return;
        }
        let registration = Registration { mode, listener };
        if self.entries.insert(pattern.to_vec(), registration).is_none() {
            self.order.push(pattern.to_vec());
            debug!(pattern_len = pattern.len(), ?mode, "Registered listener");
        } else {
            debug!(pattern_len = pattern.len(), ?mode, "Overwrote listener");
        }
    }

    /// Removes the registration for a pattern. No-op if absent.
    pub fn unregister(&mut self, pattern: &[u8]) {
        if self.entries.remove(pattern).is_some() {
            self.order.retain(|p| p != pattern);
            debug!(pattern_len = pattern.len(), "Unregistered listener");
        }
    }

    /// Returns the first registered listener whose pattern matches `payload`,
    /// in registration order. `None` if nothing matches; callers then fall
    /// back to [`default_listener`](Self::default_listener).
    pub fn resolve(&self, payload: &[u8]) -> Option<Arc<L>> {
        for pattern in &self.order {
            let entry = &self.entries[pattern];
            let matched = match entry.mode {
                MatchMode::Contains => contains(payload, pattern),
                MatchMode::StartsWith => payload.starts_with(pattern),
                MatchMode::EndsWith => payload.ends_with(pattern),
                MatchMode::None => false,
            };
            if matched {
                return Some(Arc::clone(&entry.listener));
            }
        }
        None
    }

    /// Sets or clears the per-instance default listener.
    pub fn set_default(&mut self, listener: Option<Arc<L>>) {
        self.default = listener;
    }

    /// The listener that receives unmatched payloads: the per-instance
    /// default if set, else the construction-time fallback.
    pub fn default_listener(&self) -> Arc<L> {
        Arc::clone(self.default.as_ref().unwrap_or(&self.fallback))
    }

    /// All registered listeners in match order, for terminated broadcasts.
    /// Does not include the default listener.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.order
            .iter()
            .map(|p| Arc::clone(&self.entries[p].listener))
            .collect()
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no patterns are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn contains(payload: &[u8], pattern: &[u8]) -> bool {
    if pattern.len() > payload.len() {
        return false;
    }
    payload.windows(pattern.len()).any(|w| w == pattern)
}
