//! Tensor metadata: shape, dtype, producer/consumer links, and the optional
//! memory view bound during graph memory planning.

mod dtype;
mod shape;

use std::fmt;
use std::slice;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};

use crate::generator::DataGenerator;
use crate::ids::{next_fuid, Fuid, Guid};
use crate::runtime::{Blob, Runtime};

pub use dtype::DType;
pub use shape::Shape;

/// Metadata entity describing one value flowing through the graph.
///
/// A tensor does not hold elements itself. Until `data_malloc` runs it is
/// pure bookkeeping: a shape, a dtype, the operator that produces it
/// (`source`, absent for graph inputs) and the operators that consume it
/// (`targets`). Afterwards it additionally carries a [`Blob`] aliasing the
/// graph's single backing buffer.
pub struct Tensor {
    fuid: Fuid,
    shape: Shape,
    dtype: DType,
    source: Option<Guid>,
    targets: Vec<Guid>,
    blob: Option<Arc<Blob>>,
    runtime: Arc<dyn Runtime>,
}

impl Tensor {
    pub fn new(shape: Shape, dtype: DType, runtime: Arc<dyn Runtime>) -> Self {
        Tensor {
            fuid: next_fuid(),
            shape,
            dtype,
            source: None,
            targets: Vec::new(),
            blob: None,
            runtime,
        }
    }

    pub fn fuid(&self) -> Fuid {
        self.fuid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Total element count.
    pub fn num_elements(&self) -> Result<usize> {
        self.shape.num_elements()
    }

    /// Unaligned byte footprint; alignment rounding is the allocator's job.
    pub fn byte_size(&self) -> Result<usize> {
        self.shape
            .num_elements()?
            .checked_mul(self.dtype.size_in_bytes())
            .ok_or_else(|| anyhow!("tensor {}: byte size overflows usize", self.fuid))
    }

    /// Replaces the shape, preserving the fuid. Called during shape
    /// inference when an operator's output dimensions change.
    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub fn source(&self) -> Option<Guid> {
        self.source
    }

    pub fn set_source(&mut self, source: Option<Guid>) {
        self.source = source;
    }

    /// Consuming operators in first-seen order, duplicate-free.
    pub fn targets(&self) -> &[Guid] {
        &self.targets
    }

    pub fn add_target(&mut self, op: Guid) {
        if !self.targets.contains(&op) {
            self.targets.push(op);
        }
    }

    pub fn remove_target(&mut self, op: Guid) {
        self.targets.retain(|&target| target != op);
    }

    pub fn blob(&self) -> Option<&Arc<Blob>> {
        self.blob.as_ref()
    }

    /// Binds the memory view produced by graph memory planning.
    ///
    /// At most one binding per tensor; rebinding would silently alias two
    /// plan offsets and is rejected.
    pub fn set_data_blob(&mut self, blob: Arc<Blob>) -> Result<()> {
        ensure!(
            self.blob.is_none(),
            "tensor {} already has a bound data blob",
            self.fuid
        );
        self.blob = Some(blob);
        Ok(())
    }

    /// Fills the tensor's bytes through the bound blob using `generator`.
    pub fn set_data(&self, generator: &dyn DataGenerator) -> Result<()> {
        let blob = self.require_blob()?;
        let count = self.shape.num_elements()?;
        match self.dtype {
            DType::U32 => {
                let data =
                    unsafe { slice::from_raw_parts_mut(blob.ptr().as_ptr() as *mut u32, count) };
                generator.fill_u32(data);
            }
            DType::F32 => {
                let data =
                    unsafe { slice::from_raw_parts_mut(blob.ptr().as_ptr() as *mut f32, count) };
                generator.fill_f32(data);
            }
        }
        Ok(())
    }

    /// Copies the tensor's elements back to host memory.
    pub fn copy_out_u32(&self) -> Result<Vec<u32>> {
        ensure!(
            self.dtype == DType::U32,
            "tensor {} holds {:?} elements, not U32",
            self.fuid,
            self.dtype
        );
        let blob = self.require_blob()?;
        let count = self.shape.num_elements()?;
        let data = unsafe { slice::from_raw_parts(blob.ptr().as_ptr() as *const u32, count) };
        Ok(data.to_vec())
    }

    pub fn copy_out_f32(&self) -> Result<Vec<f32>> {
        ensure!(
            self.dtype == DType::F32,
            "tensor {} holds {:?} elements, not F32",
            self.fuid,
            self.dtype
        );
        let blob = self.require_blob()?;
        let count = self.shape.num_elements()?;
        let data = unsafe { slice::from_raw_parts(blob.ptr().as_ptr() as *const f32, count) };
        Ok(data.to_vec())
    }

    fn require_blob(&self) -> Result<&Arc<Blob>> {
        self.blob
            .as_ref()
            .ok_or_else(|| anyhow!("tensor {} has no bound data blob", self.fuid))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {}, shape {}, dtype {:?}, source ",
            self.fuid, self.shape, self.dtype
        )?;
        match self.source {
            Some(guid) => write!(f, "{guid}")?,
            None => write!(f, "none")?,
        }
        write!(f, ", targets [")?;
        for (idx, target) in self.targets.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{target}")?;
        }
        write!(f, "]")
    }
}
