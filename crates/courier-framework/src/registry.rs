//! Handler registry.
//!
//! Handlers are organised in numbered groups. Groups are evaluated in
//! ascending order; within a group, handlers keep registration order.
//!
//! The registry is copy-on-write: dispatch works on an immutable
//! [`snapshot`](HandlerRegistry::snapshot), so handlers can be added or
//! removed while updates are being processed without affecting dispatches
//! that already started.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::handler::BoxedHandler;

/// Group number to handlers, in registration order.
pub type HandlerGroups = BTreeMap<i32, Vec<BoxedHandler>>;

/// Registered handlers, grouped by priority.
#[derive(Default)]
pub struct HandlerRegistry {
    groups: RwLock<Arc<HandlerGroups>>,
}

/// Compares handlers by allocation, ignoring vtable pointers.
fn same_handler(a: &BoxedHandler, b: &BoxedHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the end of `group`.
    pub fn add_handler(&self, handler: BoxedHandler, group: i32) {
        let mut groups = self.groups.write();
        debug!(handler = handler.name(), group, "Registering handler");
        Arc::make_mut(&mut groups)
            .entry(group)
            .or_default()
            .push(handler);
    }

    /// Removes `handler` from `group`.
    ///
    /// Returns `false`, and changes nothing, if it was not registered there.
    pub fn remove_handler(&self, handler: &BoxedHandler, group: i32) -> bool {
        let mut guard = self.groups.write();
        let present = guard
            .get(&group)
            .is_some_and(|list| list.iter().any(|h| same_handler(h, handler)));
        if !present {
            return false;
        }

        let groups = Arc::make_mut(&mut guard);
        if let Some(list) = groups.get_mut(&group) {
            list.retain(|h| !same_handler(h, handler));
            if list.is_empty() {
                groups.remove(&group);
            }
        }
        debug!(handler = handler.name(), group, "Removed handler");
        true
    }

    /// Returns the current handlers.
    pub fn snapshot(&self) -> Arc<HandlerGroups> {
        Arc::clone(&self.groups.read())
    }

    /// Returns the handlers of one group.
    pub fn handlers(&self, group: i32) -> Vec<BoxedHandler> {
        self.groups.read().get(&group).cloned().unwrap_or_default()
    }

    /// Returns every registered handler, in dispatch order.
    pub fn all(&self) -> Vec<BoxedHandler> {
        self.snapshot().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.snapshot();
        let mut map = f.debug_map();
        for (group, handlers) in groups.iter() {
            let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
            map.entry(group, &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Matcher;

    fn handler(name: &str) -> BoxedHandler {
        Matcher::new().name(name).boxed()
    }

    #[test]
    fn test_groups_are_sorted_and_ordered() {
        let registry = HandlerRegistry::new();
        registry.add_handler(handler("b"), 5);
        registry.add_handler(handler("a1"), -1);
        registry.add_handler(handler("a2"), -1);

        let names: Vec<String> = registry
            .all()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, ["a1", "a2", "b"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = HandlerRegistry::new();
        let h = handler("x");
        registry.add_handler(Arc::clone(&h), 0);

        assert!(!registry.remove_handler(&h, 1));
        assert!(registry.remove_handler(&h, 0));
        assert!(!registry.remove_handler(&h, 0));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let registry = HandlerRegistry::new();
        registry.add_handler(handler("first"), 0);
        let snapshot = registry.snapshot();

        registry.add_handler(handler("second"), 0);
        assert_eq!(snapshot[&0].len(), 1);
        assert_eq!(registry.handlers(0).len(), 2);
    }
}
