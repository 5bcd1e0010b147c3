//! Compiled routine bundle
//!
//! A routine owns sealed executable pages, one or more entry-point offsets,
//! and any resources the generated code captured by address (sub-routines,
//! constant blocks). It is immutable after construction and shared by
//! reference: the routine caches and every in-flight draw hold strong
//! references, so eviction never unmaps code that is still callable.

use crate::foundation::memory::CodeMemory;
use std::any::Any;
use std::sync::Arc;

/// Immutable machine-code bundle
pub struct Routine {
    memory: CodeMemory,
    entries: Vec<usize>,
    #[allow(dead_code)] // held only to pin captured resources for the routine's lifetime
    captures: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Routine {
    /// Wraps sealed code memory. Panics if the memory is still writable or an
    /// entry offset lies outside the region.
    pub(crate) fn new(
        memory: CodeMemory,
        entries: Vec<usize>,
        captures: Vec<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        assert!(memory.is_executable(), "routine memory must be sealed");
        assert!(!entries.is_empty());
        for &offset in &entries {
            assert!(offset < memory.size());
        }
        Self {
            memory,
            entries,
            captures,
        }
    }

    /// Address of the `index`-th entry point
    pub fn entry(&self, index: usize) -> *const u8 {
        self.memory.entry(self.entries[index])
    }

    /// Number of entry points
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Size of the code region in bytes
    pub fn code_size(&self) -> usize {
        self.memory.size()
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("entries", &self.entries)
            .field("code_size", &self.memory.size())
            .finish()
    }
}
