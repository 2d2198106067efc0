use std::sync::Arc;

use relay_core::BackendSpec;

use crate::transport::Backend;

struct DirectoryEntry {
    spec: BackendSpec,
    transport: Arc<dyn Backend>,
}

/// Registry of configured backends and their transports.
///
/// Declaration order is preserved because it is the final tie-breaker during
/// selection, so entries live in a Vec rather than a map.
pub struct BackendDirectory {
    entries: Vec<DirectoryEntry>,
}

impl BackendDirectory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a backend. Re-registering an id replaces the transport and
    /// spec in place, keeping the original declaration position.
    pub fn register(&mut self, spec: BackendSpec, transport: Arc<dyn Backend>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.spec.id == spec.id) {
            entry.spec = spec;
            entry.transport = transport;
        } else {
            self.entries.push(DirectoryEntry { spec, transport });
        }
    }

    pub fn spec(&self, id: &str) -> Option<&BackendSpec> {
        self.entries.iter().find(|e| e.spec.id == id).map(|e| &e.spec)
    }

    pub fn transport(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.entries
            .iter()
            .find(|e| e.spec.id == id)
            .map(|e| Arc::clone(&e.transport))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.spec.id == id)
    }

    /// All backend ids in declaration order.
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.id.as_str()).collect()
    }

    /// Candidate specs for a capability class, in declaration order.
    ///
    /// A backend with no class serves every request. A request with no class
    /// accepts every backend.
    pub fn candidates_for(&self, class: Option<&str>) -> Vec<&BackendSpec> {
        self.entries
            .iter()
            .map(|e| &e.spec)
            .filter(|spec| match (class, spec.class.as_deref()) {
                (None, _) | (_, None) => true,
                (Some(wanted), Some(offered)) => wanted == offered,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BackendDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoBackend;

    fn spec(id: &str, priority: u32, class: Option<&str>) -> BackendSpec {
        BackendSpec {
            id: id.to_string(),
            rate_limit_per_window: 100,
            window_seconds: 60,
            priority,
            cost_per_call: 1,
            class: class.map(str::to_string),
            request_timeout_ms: 1000,
        }
    }

    fn directory_with(ids: &[(&str, Option<&str>)]) -> BackendDirectory {
        let mut directory = BackendDirectory::new();
        for (i, (id, class)) in ids.iter().enumerate() {
            directory.register(spec(id, i as u32, *class), Arc::new(EchoBackend::new(id)));
        }
        directory
    }

    #[test]
    fn register_and_lookup() {
        let directory = directory_with(&[("a", None), ("b", None)]);
        assert!(directory.contains("a"));
        assert!(!directory.contains("c"));
        assert_eq!(directory.count(), 2);
        assert_eq!(directory.spec("b").unwrap().id, "b");
        assert!(directory.transport("a").is_some());
        assert!(directory.transport("c").is_none());
    }

    #[test]
    fn ids_keep_declaration_order() {
        let directory = directory_with(&[("zeta", None), ("alpha", None), ("mid", None)]);
        assert_eq!(directory.ids(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn reregister_replaces_in_place() {
        let mut directory = directory_with(&[("a", None), ("b", None)]);
        directory.register(spec("a", 7, Some("fast")), Arc::new(EchoBackend::new("a")));

        assert_eq!(directory.count(), 2);
        assert_eq!(directory.ids(), vec!["a", "b"]);
        assert_eq!(directory.spec("a").unwrap().priority, 7);
    }

    #[test]
    fn class_filtering() {
        let directory = directory_with(&[
            ("general", None),
            ("fast-1", Some("fast")),
            ("capable-1", Some("capable")),
            ("fast-2", Some("fast")),
        ]);

        let fast: Vec<&str> = directory
            .candidates_for(Some("fast"))
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(fast, vec!["general", "fast-1", "fast-2"]);

        let any: Vec<&str> = directory
            .candidates_for(None)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(any, vec!["general", "fast-1", "capable-1", "fast-2"]);
    }

    #[test]
    fn unmatched_class_yields_generalists_only() {
        let directory = directory_with(&[("general", None), ("fast-1", Some("fast"))]);
        let out: Vec<&str> = directory
            .candidates_for(Some("huge"))
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(out, vec!["general"]);
    }
}
