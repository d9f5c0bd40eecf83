//! Core of a small static-graph inference runtime.
//!
//! The crate models computation as an explicit dataflow graph of tensors
//! and operators, with three load-bearing pieces: the mutable graph IR with
//! producer/consumer bookkeeping and topological ordering, an algebraic
//! optimizer that cancels inverse transposes and fuses transposes into
//! matmul operands, and an offset-based memory planner that packs every
//! tensor into one runtime buffer obtained lazily. Numeric kernels and
//! concrete device runtimes live behind the [`runtime::Runtime`] capability
//! in satellite crates.

pub mod allocator;
pub mod generator;
pub mod graph;
pub mod ids;
pub mod runtime;
pub mod tensor;

pub use allocator::Allocator;
pub use graph::{Graph, OpKind, OpType, Operator};
pub use ids::{Fuid, Guid};
pub use runtime::{Blob, Runtime, RuntimeError};
pub use tensor::{DType, Shape, Tensor};
