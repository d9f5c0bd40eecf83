//! Runtime capability that supplies raw device memory, and the non-owning
//! blob views handed to tensors.
//!
//! The graph core never allocates device memory itself: the [`Allocator`]
//! plans byte offsets in host space and asks a [`Runtime`] for exactly one
//! backing buffer per graph. Concrete runtimes live in satellite crates
//! (`weft-runtime-cpu` provides the aligned-heap reference implementation).
//!
//! [`Allocator`]: crate::allocator::Allocator

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// Failure surfaced by a runtime when it cannot service a memory request.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime `{runtime}` failed to allocate {bytes} bytes")]
    AllocationFailed { runtime: String, bytes: usize },
    #[error("runtime `{runtime}` rejected the layout for {bytes} bytes")]
    InvalidLayout { runtime: String, bytes: usize },
}

/// Capability for acquiring and releasing one raw byte buffer.
///
/// Implementations must hand out buffers aligned to at least the graph
/// allocator's alignment (8 bytes). Allocation failure is fatal to the
/// calling graph; there is no retry protocol.
pub trait Runtime: Send + Sync {
    /// Human-readable identifier (e.g. `"cpu"`).
    fn name(&self) -> &str;

    /// Obtains a buffer of `bytes` bytes.
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, RuntimeError>;

    /// Releases a buffer previously returned by [`Runtime::alloc`].
    fn dealloc(&self, ptr: NonNull<u8>);
}

/// Non-owning view into a runtime buffer bound to a tensor.
///
/// The allocator keeps exclusive ownership of the backing allocation; a blob
/// only records where inside that buffer the tensor's bytes start and which
/// runtime the memory belongs to.
pub struct Blob {
    runtime: Arc<dyn Runtime>,
    ptr: NonNull<u8>,
}

impl Blob {
    pub fn new(runtime: Arc<dyn Runtime>, ptr: NonNull<u8>) -> Self {
        Blob { runtime, ptr }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("runtime", &self.runtime.name())
            .field("ptr", &self.ptr)
            .finish()
    }
}
