//! Host-side fill utilities for seeding tensor buffers.

/// Writes a deterministic pattern into a typed host buffer.
///
/// One hook per recognised dtype; the dispatch on [`DType`] happens at the
/// tensor layer so generators stay oblivious to graph metadata.
///
/// [`DType`]: crate::tensor::DType
pub trait DataGenerator {
    fn fill_u32(&self, data: &mut [u32]);
    fn fill_f32(&self, data: &mut [f32]);
}

/// Writes `0, 1, 2, …` cast to the element type.
pub struct IncrementalGenerator;

impl DataGenerator for IncrementalGenerator {
    fn fill_u32(&self, data: &mut [u32]) {
        for (idx, slot) in data.iter_mut().enumerate() {
            *slot = idx as u32;
        }
    }

    fn fill_f32(&self, data: &mut [f32]) {
        for (idx, slot) in data.iter_mut().enumerate() {
            *slot = idx as f32;
        }
    }
}

/// Writes one constant value cast to the element type.
pub struct ConstantGenerator {
    value: f32,
}

impl ConstantGenerator {
    pub fn new(value: f32) -> Self {
        ConstantGenerator { value }
    }
}

impl DataGenerator for ConstantGenerator {
    fn fill_u32(&self, data: &mut [u32]) {
        data.fill(self.value as u32);
    }

    fn fill_f32(&self, data: &mut [f32]) {
        data.fill(self.value);
    }
}
