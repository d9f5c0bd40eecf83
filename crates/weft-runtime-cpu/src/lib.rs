//! Reference host runtime backing graph buffers with aligned heap memory.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use weft::runtime::{Runtime, RuntimeError};

/// Cache-line alignment; comfortably above the graph allocator's 8-byte
/// offset granularity.
const BUFFER_ALIGNMENT: usize = 64;

/// Host runtime that services buffer requests from the global allocator.
///
/// Layouts are remembered per pointer so release needs nothing but the
/// pointer, matching the [`Runtime`] contract.
pub struct CpuRuntime {
    layouts: Mutex<HashMap<usize, Layout>>,
}

impl CpuRuntime {
    pub fn new() -> Self {
        CpuRuntime {
            layouts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, RuntimeError> {
        // An empty plan still gets a unique, dereferenceable base.
        let size = bytes.max(1);
        let layout =
            Layout::from_size_align(size, BUFFER_ALIGNMENT).map_err(|_| {
                RuntimeError::InvalidLayout {
                    runtime: self.name().to_string(),
                    bytes,
                }
            })?;
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| RuntimeError::AllocationFailed {
            runtime: self.name().to_string(),
            bytes,
        })?;
        self.layouts
            .lock()
            .expect("cpu runtime layout table poisoned")
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn dealloc(&self, ptr: NonNull<u8>) {
        let layout = self
            .layouts
            .lock()
            .expect("cpu runtime layout table poisoned")
            .remove(&(ptr.as_ptr() as usize));
        if let Some(layout) = layout {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}
