// SPDX-License-Identifier: Apache-2.0 OR MIT
// Hierarchical logger registry
//
// The registry is read-mostly and never sits on the emission path:
// handles hold their node directly and the gate is one atomic load.
// Structural changes (creation, configuration, threshold updates) take
// the registry lock, recompute the affected effective caches, and are
// visible to emitters immediately through the nodes' atomics.

use crate::logger::{Logger, LoggerNode, SinkList};
use crate::severity::Severity;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

pub(crate) const DEFAULT_ROOT_THRESHOLD: Severity = Severity::WARNING;

/// One logger's configuration, applied by the runtime.
pub(crate) struct LoggerAssignment {
    pub name: String,
    pub threshold: Option<Severity>,
    pub sinks: Option<SinkList>,
}

struct Inner {
    nodes: HashMap<String, Arc<LoggerNode>>,
    by_id: HashMap<u64, Arc<LoggerNode>>,
    /// Explicit sink lists by logger name; other loggers inherit from
    /// the nearest configured ancestor.
    assignments: HashMap<String, SinkList>,
    next_id: u64,
}

pub(crate) struct Registry {
    inner: RwLock<Inner>,
}

pub(crate) fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn parent_name(name: &str) -> Option<&str> {
    if name.is_empty() {
        return None;
    }
    Some(name.rsplit_once('.').map(|(prefix, _)| prefix).unwrap_or(""))
}

impl Registry {
    fn new() -> Self {
        let mut inner = Inner {
            nodes: HashMap::new(),
            by_id: HashMap::new(),
            assignments: HashMap::new(),
            next_id: 1,
        };
        let root = inner.create_node(String::new());
        root.set_explicit(Some(DEFAULT_ROOT_THRESHOLD));
        root.set_effective(DEFAULT_ROOT_THRESHOLD);
        Registry {
            inner: RwLock::new(inner),
        }
    }

    /// Get (creating on demand, ancestors included) a handle for `name`.
    pub(crate) fn logger(&self, name: &str) -> Logger {
        if let Some(node) = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .nodes
            .get(name)
        {
            return Logger::from_node(node.clone());
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let node = inner.ensure_node(name);
        Logger::from_node(node)
    }

    /// Resolve a node by its stable id (frame decoding).
    pub(crate) fn node_by_id(&self, id: u64) -> Option<Arc<LoggerNode>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .get(&id)
            .cloned()
    }

    /// Set an explicit threshold. Effective thresholds of the whole
    /// subtree update before this returns.
    pub(crate) fn set_threshold(&self, name: &str, severity: Severity) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let node = inner.ensure_node(name);
        node.set_explicit(Some(severity));
        inner.recompute_thresholds();
    }

    /// All known loggers with their effective thresholds.
    pub(crate) fn list(&self) -> Vec<(String, Severity)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<(String, Severity)> = inner
            .nodes
            .values()
            .map(|node| {
                (
                    node.name().to_string(),
                    Severity::from_rank(node.effective()),
                )
            })
            .collect();
        list.sort();
        list
    }

    /// Replace the whole configuration: explicit thresholds and sink
    /// assignments are cleared, then the given assignments applied and
    /// every effective cache recomputed.
    pub(crate) fn apply_configuration(
        &self,
        root_threshold: Severity,
        assignments: Vec<LoggerAssignment>,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for node in inner.nodes.values() {
            node.set_explicit(None);
        }
        inner.assignments.clear();

        let root = inner.ensure_node("");
        root.set_explicit(Some(root_threshold));
        for assignment in assignments {
            let node = inner.ensure_node(&assignment.name);
            if let Some(threshold) = assignment.threshold {
                node.set_explicit(Some(threshold));
            }
            if let Some(sinks) = assignment.sinks {
                inner.assignments.insert(assignment.name, sinks);
            }
        }
        inner.recompute_thresholds();
        inner.recompute_sinks();
    }
}

impl Inner {
    fn create_node(&mut self, name: String) -> Arc<LoggerNode> {
        let id = self.next_id;
        self.next_id += 1;
        let node = Arc::new(LoggerNode::new(name.clone(), id, DEFAULT_ROOT_THRESHOLD));
        self.nodes.insert(name, node.clone());
        self.by_id.insert(id, node.clone());
        node
    }

    /// Get or create the node and its missing ancestors, with effective
    /// caches inherited from the nearest existing ancestor.
    fn ensure_node(&mut self, name: &str) -> Arc<LoggerNode> {
        if let Some(node) = self.nodes.get(name) {
            return node.clone();
        }
        // Collect the missing suffix of the ancestor chain.
        let mut missing: Vec<String> = Vec::new();
        let mut cursor = name;
        loop {
            missing.push(cursor.to_string());
            match parent_name(cursor) {
                Some(parent) if !self.nodes.contains_key(parent) => cursor = parent,
                _ => break,
            }
        }
        // Create root-most first so inheritance resolves on the way down.
        let mut created = None;
        for ancestor in missing.into_iter().rev() {
            let threshold = self.resolved_threshold(&ancestor);
            let sinks = self.resolved_sinks(&ancestor);
            let node = self.create_node(ancestor);
            node.set_effective(threshold);
            node.set_sinks(sinks);
            created = Some(node);
        }
        created.expect("at least one node created")
    }

    /// Effective threshold `name` would inherit, ignoring any explicit
    /// setting on `name` itself.
    fn resolved_threshold(&self, name: &str) -> Severity {
        let mut cursor = parent_name(name);
        while let Some(ancestor) = cursor {
            if let Some(node) = self.nodes.get(ancestor) {
                if let Some(explicit) = node.explicit() {
                    return explicit;
                }
                // Ancestor exists but inherits too; its cache is valid.
                return Severity::from_rank(node.effective());
            }
            cursor = parent_name(ancestor);
        }
        DEFAULT_ROOT_THRESHOLD
    }

    fn resolved_sinks(&self, name: &str) -> SinkList {
        let mut cursor = Some(name);
        while let Some(candidate) = cursor {
            if let Some(sinks) = self.assignments.get(candidate) {
                return sinks.clone();
            }
            cursor = parent_name(candidate);
        }
        Arc::new(Vec::new())
    }

    /// Recompute every node's effective threshold from the explicit
    /// settings. Shorter names first so parents resolve before children.
    fn recompute_thresholds(&mut self) {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort_by_key(|name| name.len());
        for name in names {
            let node = self.nodes[&name].clone();
            let effective = match node.explicit() {
                Some(explicit) => explicit,
                None => self.resolved_threshold(&name),
            };
            node.set_effective(effective);
        }
    }

    fn recompute_sinks(&mut self) {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            let sinks = self.resolved_sinks(&name);
            self.nodes[&name].set_sinks(sinks);
        }
    }

    #[cfg(test)]
    fn effective_of(&self, name: &str) -> Option<Severity> {
        self.nodes
            .get(name)
            .map(|node| Severity::from_rank(node.effective()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn test_root_exists_with_default_threshold() {
        let registry = fresh_registry();
        let root = registry.logger("");
        assert!(root.enabled_for(Severity::WARNING));
        assert!(!root.enabled_for(Severity::INFO));
    }

    #[test]
    fn test_children_inherit_threshold() {
        let registry = fresh_registry();
        registry.set_threshold("net", Severity::DEBUG);

        let child = registry.logger("net.http.client");
        assert!(child.enabled_for(Severity::DEBUG));

        // Sibling subtree still inherits the root threshold.
        let other = registry.logger("db");
        assert!(!other.enabled_for(Severity::INFO));
    }

    #[test]
    fn test_explicit_beats_inherited() {
        let registry = fresh_registry();
        registry.set_threshold("net", Severity::DEBUG);
        registry.set_threshold("net.http", Severity::ERROR);

        assert!(registry.logger("net.tcp").enabled_for(Severity::DEBUG));
        assert!(!registry.logger("net.http.client").enabled_for(Severity::WARNING));
        assert!(registry.logger("net.http.client").enabled_for(Severity::ERROR));
    }

    #[test]
    fn test_threshold_change_reaches_existing_handles() {
        let registry = fresh_registry();
        let handle = registry.logger("svc.worker");
        assert!(!handle.enabled_for(Severity::INFO));
        registry.set_threshold("svc", Severity::TRACE);
        assert!(handle.enabled_for(Severity::INFO));
    }

    #[test]
    fn test_list_is_sorted_and_effective() {
        let registry = fresh_registry();
        registry.set_threshold("b", Severity::INFO);
        let _ = registry.logger("a.x");
        let list = registry.list();
        let names: Vec<&str> = list.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["", "a", "a.x", "b"]);
        let b = list.iter().find(|(name, _)| name == "b").unwrap();
        assert_eq!(b.1, Severity::INFO);
        let ax = list.iter().find(|(name, _)| name == "a.x").unwrap();
        assert_eq!(ax.1, DEFAULT_ROOT_THRESHOLD);
    }

    #[test]
    fn test_node_by_id_roundtrip() {
        let registry = fresh_registry();
        let _ = registry.logger("lookup.me");
        let inner = registry.inner.read().unwrap();
        let node = inner.nodes.get("lookup.me").unwrap().clone();
        drop(inner);
        let found = registry.node_by_id(node.id()).unwrap();
        assert_eq!(found.name(), "lookup.me");
    }

    #[test]
    fn test_apply_configuration_resets_previous_state() {
        let registry = fresh_registry();
        registry.set_threshold("old", Severity::TRACE);
        registry.apply_configuration(
            Severity::ERROR,
            vec![LoggerAssignment {
                name: "fresh".to_string(),
                threshold: Some(Severity::DEBUG),
                sinks: None,
            }],
        );
        let inner = registry.inner.read().unwrap();
        // "old" lost its explicit threshold and now inherits the root.
        assert_eq!(inner.effective_of("old"), Some(Severity::ERROR));
        assert_eq!(inner.effective_of("fresh"), Some(Severity::DEBUG));
    }
}
