//! Scalar element kinds recognised by the graph core.

/// Logical dtype tag shared by tensors and the host fill utilities.
///
/// Further kinds are an extension point; every match over `DType` in the
/// crate is exhaustive so a new variant surfaces each site that needs work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit unsigned integer, primarily for index data.
    U32,
    /// 32-bit IEEE-754 floating point.
    F32,
}

impl DType {
    /// Returns the number of bytes occupied by one scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::U32 => 4,
            DType::F32 => 4,
        }
    }
}
