//! Value handle table.
//!
//! Maps opaque `u64` handles to evaluator-side values so the host can refer
//! to them across round trips. Owned by the worker for the lifetime of one
//! session.

use std::collections::HashMap;

/// Lookup or free of a handle that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid handle {0}")]
pub struct InvalidHandle(pub u64);

/// Per-session handle table.
///
/// Handles come from a strictly increasing counter starting at 0. The table
/// does not deduplicate: storing the same value twice yields two handles.
#[derive(Debug)]
pub struct HandleTable<V> {
    values: HashMap<u64, V>,
    next: u64,
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HandleTable<V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            next: 0,
        }
    }

    /// Store a value and return its new handle.
    pub fn allocate(&mut self, value: V) -> u64 {
        let handle = self.next;
        self.next += 1;
        self.values.insert(handle, value);
        handle
    }

    /// Borrow the value bound to `handle`.
    pub fn lookup(&self, handle: u64) -> Result<&V, InvalidHandle> {
        self.values.get(&handle).ok_or(InvalidHandle(handle))
    }

    /// Remove the entry for `handle`.
    pub fn free(&mut self, handle: u64) -> Result<(), InvalidHandle> {
        self.values
            .remove(&handle)
            .map(drop)
            .ok_or(InvalidHandle(handle))
    }

    /// Drop every entry and reset the counter.
    pub fn clear(&mut self) {
        self.values.clear();
        self.next = 0;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_strictly_increasing() {
        let mut table = HandleTable::new();
        let handles: Vec<u64> = (0..5).map(|i| table.allocate(i)).collect();
        assert_eq!(handles, vec![0, 1, 2, 3, 4]);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn freed_handles_are_not_reused() {
        let mut table = HandleTable::new();
        let a = table.allocate("a");
        table.free(a).unwrap();
        let b = table.allocate("b");
        assert_ne!(a, b);
        assert_eq!(table.lookup(a), Err(InvalidHandle(a)));
        assert_eq!(table.lookup(b), Ok(&"b"));
    }

    #[test]
    fn double_free_fails() {
        let mut table = HandleTable::new();
        let h = table.allocate(1);
        assert!(table.free(h).is_ok());
        assert_eq!(table.free(h), Err(InvalidHandle(h)));
        assert_eq!(table.free(42), Err(InvalidHandle(42)));
    }

    #[test]
    fn same_value_twice_gets_two_handles() {
        let mut table = HandleTable::new();
        let a = table.allocate("x");
        let b = table.allocate("x");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn clear_resets_counter() {
        let mut table = HandleTable::new();
        table.allocate(1);
        table.allocate(2);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.allocate(3), 0);
    }
}
