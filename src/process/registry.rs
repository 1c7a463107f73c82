use crate::error::{Result, StagehandError};
use crate::process::ProcessHandle;
use std::sync::Arc;

/// Name → handle mapping that preserves insertion (launch) order
#[derive(Debug, Default)]
pub struct Registry {
    handles: Vec<Arc<ProcessHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. A name that is already present is refused and the
    /// registry is left untouched.
    pub fn insert(&mut self, handle: Arc<ProcessHandle>) -> Result<()> {
        if self.contains(handle.name()) {
            return Err(StagehandError::DuplicateName(handle.name().to_string()));
        }
        self.handles.push(handle);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.iter().any(|h| h.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.iter().find(|h| h.name() == name).cloned()
    }

    /// Consistent copy of the handle list for readers (monitor, shutdown)
    pub fn snapshot(&self) -> Vec<Arc<ProcessHandle>> {
        self.handles.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
