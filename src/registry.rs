//! Handle registry - integer handles for sandbox sessions and modules
//!
//! Handles start at 1 and come from a counter that is never decremented, so
//! a handle is never reused within the life of one registry.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Integer handle issued by a [`HandleRegistry`]
pub type Handle = u64;

/// Registry of live objects addressed by handle
#[derive(Debug)]
pub struct HandleRegistry<T> {
    items: HashMap<Handle, T>,
    next: Handle,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    /// Create a new empty registry
    pub fn new() -> Self {
        HandleRegistry {
            items: HashMap::new(),
            next: 1,
        }
    }

    /// Store an item under the next handle
    pub fn add(&mut self, item: T) -> Handle {
        let handle = self.next;
        self.next += 1;
        self.items.insert(handle, item);
        handle
    }

    /// Build an item that needs to know its own handle before it exists.
    ///
    /// The counter only advances when `build` succeeds.
    pub fn try_add_with<F>(&mut self, build: F) -> Result<Handle>
    where
        F: FnOnce(Handle) -> Result<T>,
    {
        let handle = self.next;
        let item = build(handle)?;
        self.next += 1;
        self.items.insert(handle, item);
        Ok(handle)
    }

    /// Get an item by handle
    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.items
            .get(&handle)
            .ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    /// Remove an item, returning it
    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        self.items
            .remove(&handle)
            .ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    /// Whether a handle is currently registered
    pub fn has(&self, handle: Handle) -> bool {
        self.items.contains_key(&handle)
    }

    /// Number of live items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the registry holds nothing
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
