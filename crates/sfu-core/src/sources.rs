//! External webcam source tracking
//!
//! SIP-dialed webcam sources announce themselves on the bus with a
//! reserved user-id prefix. Camera sessions consult this table to resolve
//! the actual media source. The table is append-mostly; entries are never
//! removed during normal operation and racy reads are tolerated.

use dashmap::DashMap;

/// User-id prefix reserved for external (SIP-dialed) video sources.
pub const EXTERNAL_SOURCE_PREFIX: &str = "v_";

const SIP_SUFFIX: &str = "|SIP";

/// Strip the `|SIP` transport suffix, if any.
pub fn normalize_stream_name(stream_name: &str) -> String {
    stream_name
        .strip_suffix(SIP_SUFFIX)
        .unwrap_or(stream_name)
        .to_string()
}

/// Process-wide registry of external video sources, keyed by both the
/// original stream name and the announcing user id.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    entries: DashMap<String, String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broadcast announcement. Only external sources are
    /// tracked; other announcements are ignored.
    pub fn register(&self, stream_name: &str, user_id: &str) {
        if !user_id.starts_with(EXTERNAL_SOURCE_PREFIX) {
            return;
        }
        let normalized = normalize_stream_name(stream_name);
        tracing::debug!(
            "Registered external source {} -> {}",
            stream_name,
            normalized
        );
        self.entries
            .insert(stream_name.to_string(), normalized.clone());
        self.entries.insert(user_id.to_string(), normalized);
    }

    /// Resolve a stream name or user id to its registered source.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
