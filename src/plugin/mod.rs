//! The Plugin Registry (spec.md §4.A): holds loaded decoders, matches raw
//! bytes to a decoder, and owns plugin lifecycle.
//!
//! Plugins are registered statically at startup (spec.md §9 REDESIGN FLAGS —
//! "a systems-language port should prefer static plugin registration"),
//! never loaded from a dynamic library. Hot add/remove is supported only
//! while the registry is quiescent, which the Pipeline guarantees by
//! holding no in-flight match when it calls `reload`.

pub mod nmea;

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::error::{DecodeError, PluginInitError, PluginRuntimeError, ValidationError};
use crate::record::CanonicalRecord;

/// The closed set of protocol tags spec.md §3 defines for `PluginDescriptor`.
/// `Other` is the escape hatch for third-party decoders outside the
/// in-tree reference plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProtocolTag {
    Nmea,
    Ublox,
    Taip,
    Other,
}

impl ProtocolTag {
    /// Lower-cased form used in bus topic names (spec.md §6).
    pub fn as_topic_fragment(&self) -> &'static str {
        match self {
            ProtocolTag::Nmea => "nmea",
            ProtocolTag::Ublox => "ublox",
            ProtocolTag::Taip => "taip",
            ProtocolTag::Other => "other",
        }
    }
}

/// A read-only view into the `PluginSettings` configuration section, handed
/// to a plugin's `init` hook so it can pick up its own settings without the
/// registry knowing anything about plugin-specific keys.
#[derive(Debug, Clone, Default)]
pub struct PluginConfigView {
    pub values: HashMap<String, String>,
}

impl PluginConfigView {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A pluggable decoder for one wire protocol (spec.md §3, "Plugin Descriptor").
///
/// Implementations must be reentrant: the Pipeline's worker pool calls
/// `decode`/`validate` from multiple tasks concurrently (spec.md §5).
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn protocol_tag(&self) -> ProtocolTag;

    /// Cheap, pure predicate on the leading bytes of a frame. Must complete
    /// in microseconds — it runs for every registered plugin on every
    /// incoming frame until one matches.
    fn matches(&self, frame: &[u8]) -> bool;

    fn decode(&self, frame: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError>;

    /// Plugin-specific validation run before the central `Validator`
    /// (spec.md §4.E step 4). The default accepts everything.
    fn validate(&self, _record: &CanonicalRecord) -> Result<(), ValidationError> {
        Ok(())
    }

    fn init(&self, _config: &PluginConfigView) -> Result<(), PluginInitError> {
        Ok(())
    }

    fn cleanup(&self) -> Result<(), PluginRuntimeError> {
        Ok(())
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
}

/// Holds an ordered collection of plugin descriptors. Read-mostly: matching
/// takes the read lock, `register`/`shutdown` take the write lock.
pub struct PluginRegistry {
    entries: RwLock<Vec<Entry>>,
    init_errors: Mutex<Vec<(String, String)>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            entries: RwLock::new(Vec::new()),
            init_errors: Mutex::new(Vec::new()),
        }
    }

    /// Invoke the plugin's init hook with a configuration view; append on
    /// success. A plugin that fails init is isolated: the error is recorded
    /// and the plugin never takes part in matching, but the failure never
    /// propagates to the caller (spec.md §4.A).
    pub async fn register(&self, plugin: Arc<dyn Plugin>, config: &PluginConfigView) {
        match plugin.init(config) {
            Ok(()) => {
                info!("registered plugin `{}` v{}", plugin.name(), plugin.version());
                self.entries.write().await.push(Entry { plugin });
            }
            Err(e) => {
                warn!("plugin `{}` failed to initialize: {}", plugin.name(), e.reason);
                self.init_errors
                    .lock()
                    .await
                    .push((plugin.name().to_string(), e.reason));
            }
        }
    }

    /// Consult each plugin's capability predicate in registration order and
    /// return the first match. Ties are broken by registration order; this
    /// is observable and part of the contract (spec.md §4.A).
    pub async fn match_for_bytes(&self, frame: &[u8]) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|entry| entry.plugin.matches(frame))
            .map(|entry| entry.plugin.clone())
    }

    pub async fn get_by_protocol(&self, tag: ProtocolTag) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|entry| entry.plugin.protocol_tag() == tag)
            .map(|entry| entry.plugin.clone())
    }

    pub async fn plugin_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn init_errors(&self) -> Vec<(String, String)> {
        self.init_errors.lock().await.clone()
    }

    /// Invoke every cleanup hook in reverse registration order. Individual
    /// failures are logged but never abort the shutdown sweep.
    pub async fn shutdown(&self) {
        let entries = self.entries.read().await;
        for entry in entries.iter().rev() {
            if let Err(e) = entry.plugin.cleanup() {
                error!("plugin `{}` cleanup failed: {}", entry.plugin.name(), e.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Picky {
        prefix: u8,
    }
    impl Plugin for Picky {
        fn name(&self) -> &str {
            "picky"
        }
        fn version(&self) -> &str {
            "1.0"
        }
        fn protocol_tag(&self) -> ProtocolTag {
            ProtocolTag::Other
        }
        fn matches(&self, frame: &[u8]) -> bool {
            frame.first() == Some(&self.prefix)
        }
        fn decode(&self, _frame: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError> {
            Ok(CanonicalRecord::new(device_id, 1.0, 1.0))
        }
    }

    struct AlwaysFailsInit;
    impl Plugin for AlwaysFailsInit {
        fn name(&self) -> &str {
            "broken"
        }
        fn version(&self) -> &str {
            "0.0"
        }
        fn protocol_tag(&self) -> ProtocolTag {
            ProtocolTag::Other
        }
        fn matches(&self, _frame: &[u8]) -> bool {
            true
        }
        fn decode(&self, _frame: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError> {
            Ok(CanonicalRecord::new(device_id, 0.0, 0.0))
        }
        fn init(&self, _config: &PluginConfigView) -> Result<(), PluginInitError> {
            Err(PluginInitError {
                plugin: "broken".into(),
                reason: "nope".into(),
            })
        }
    }

    #[tokio::test]
    async fn first_registered_match_wins_ties() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(Picky { prefix: b'$' }), &PluginConfigView::default())
            .await;
        registry
            .register(Arc::new(Picky { prefix: b'$' }), &PluginConfigView::default())
            .await;

        let matched = registry.match_for_bytes(b"$GPRMC,...").await.unwrap();
        assert_eq!(matched.name(), "picky");
        assert_eq!(registry.plugin_count().await, 2);
    }

    #[tokio::test]
    async fn failed_init_isolates_the_plugin() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(AlwaysFailsInit), &PluginConfigView::default())
            .await;

        assert_eq!(registry.plugin_count().await, 0);
        assert!(registry.match_for_bytes(b"anything").await.is_none());
        assert_eq!(registry.init_errors().await.len(), 1);
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(Picky { prefix: b'$' }), &PluginConfigView::default())
            .await;
        assert!(registry.match_for_bytes(b"@nope").await.is_none());
    }
}
