//! Lookup table from command identity to its process handle.

use std::sync::Arc;

use dashmap::DashMap;

use crate::process::{CommandId, ProcessHandle};

/// Owns every [`ProcessHandle`] created during the application's run.
///
/// Handles are created lazily and never removed, so history survives
/// configuration reloads.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: DashMap<CommandId, Arc<ProcessHandle>>,
    max_lines: Option<usize>,
}

impl ProcessRegistry {
    /// Creates a registry whose handles cap their logs at `max_lines` (unbounded if `None`).
    pub fn new(max_lines: Option<usize>) -> Self {
        Self {
            handles: DashMap::new(),
            max_lines,
        }
    }

    /// Returns the handle for `id`, creating it on first reference.
    pub fn get_or_create(&self, id: &CommandId) -> Arc<ProcessHandle> {
        if let Some(handle) = self.handles.get(id) {
            return handle.value().clone();
        }
        self.handles
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ProcessHandle::new(self.max_lines)))
            .value()
            .clone()
    }

    pub fn get(&self, id: &CommandId) -> Option<Arc<ProcessHandle>> {
        self.handles.get(id).map(|handle| handle.value().clone())
    }

    /// Identities whose handle is currently running.
    pub fn running(&self) -> Vec<CommandId> {
        self.handles
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NO_LOGS;

    #[test]
    fn get_or_create_is_idempotent_across_threads() {
        let registry = Arc::new(ProcessRegistry::new(None));
        let id = CommandId::new("Tools", "clock");
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.get_or_create(&id))
            })
            .collect();
        let handles: Vec<_> = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect();
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(registry.len(), 1);
        assert_eq!(handles[0].snapshot_log(), vec![NO_LOGS]);
    }

    #[test]
    fn get_does_not_create() {
        let registry = ProcessRegistry::new(Some(10));
        let id = CommandId::new("A", "b");
        assert!(registry.get(&id).is_none());
        registry.get_or_create(&id);
        assert!(registry.get(&id).is_some());
        assert!(registry.running().is_empty());
    }
}
