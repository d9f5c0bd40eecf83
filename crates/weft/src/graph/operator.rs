//! Typed graph nodes and their shape inference rules.

use std::fmt;

use anyhow::{ensure, Result};

use crate::ids::{next_guid, Fuid, Guid};
use crate::tensor::Shape;

/// Operator kind tag, used where only the discriminant matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Transpose,
    MatMul,
}

/// Per-variant attributes.
///
/// `MatMul`'s `m`/`n`/`k` cache the effective problem dimensions; they are
/// refreshed whenever shape inference runs so downstream kernels can read
/// them without re-deriving the transposed views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Transpose {
        /// Axis reshuffle: `out[i] = in[permute[i]]`.
        permute: Vec<usize>,
    },
    MatMul {
        trans_a: bool,
        trans_b: bool,
        m: usize,
        n: usize,
        k: usize,
    },
}

/// Graph node with fixed-arity tensor connections.
///
/// Inputs and outputs are tensor handles resolved through the owning
/// graph's collections; predecessor and successor sets are derived from the
/// tensor links and kept consistent by the graph's mutation paths.
pub struct Operator {
    guid: Guid,
    kind: OpKind,
    inputs: Vec<Fuid>,
    outputs: Vec<Fuid>,
    predecessors: Vec<Guid>,
    successors: Vec<Guid>,
}

impl Operator {
    pub(super) fn transpose(input: Fuid, output: Fuid, permute: Vec<usize>) -> Self {
        Operator {
            guid: next_guid(),
            kind: OpKind::Transpose { permute },
            inputs: vec![input],
            outputs: vec![output],
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub(super) fn matmul(a: Fuid, b: Fuid, output: Fuid, trans_a: bool, trans_b: bool) -> Self {
        Operator {
            guid: next_guid(),
            kind: OpKind::MatMul {
                trans_a,
                trans_b,
                m: 0,
                n: 0,
                k: 0,
            },
            inputs: vec![a, b],
            outputs: vec![output],
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn op_type(&self) -> OpType {
        match self.kind {
            OpKind::Transpose { .. } => OpType::Transpose,
            OpKind::MatMul { .. } => OpType::MatMul,
        }
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub(super) fn kind_mut(&mut self) -> &mut OpKind {
        &mut self.kind
    }

    pub fn inputs(&self) -> &[Fuid] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Fuid] {
        &self.outputs
    }

    pub fn predecessors(&self) -> &[Guid] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[Guid] {
        &self.successors
    }

    /// Swaps every occurrence of `old` in the input list for `new`.
    pub fn replace_input(&mut self, old: Fuid, new: Fuid) {
        for input in &mut self.inputs {
            if *input == old {
                *input = new;
            }
        }
    }

    /// Swaps only the operand at `index`; rewrites that must distinguish
    /// two uses of the same tensor go through this instead.
    pub(super) fn replace_input_at(&mut self, index: usize, new: Fuid) {
        self.inputs[index] = new;
    }

    pub fn add_predecessor(&mut self, op: Guid) {
        if !self.predecessors.contains(&op) {
            self.predecessors.push(op);
        }
    }

    pub fn remove_predecessor(&mut self, op: Guid) {
        self.predecessors.retain(|&pred| pred != op);
    }

    pub fn add_successor(&mut self, op: Guid) {
        if !self.successors.contains(&op) {
            self.successors.push(op);
        }
    }

    pub fn remove_successor(&mut self, op: Guid) {
        self.successors.retain(|&succ| succ != op);
    }

    /// Derives the output shapes from the given input shapes.
    ///
    /// Fails when the inputs violate the variant's contract (arity, rank,
    /// invalid permutation, inner-dimension or broadcast mismatch).
    pub fn infer_shape(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        match &self.kind {
            OpKind::Transpose { permute } => {
                ensure!(
                    inputs.len() == 1,
                    "operator {}: transpose takes one input, got {}",
                    self.guid,
                    inputs.len()
                );
                Ok(vec![infer_transpose(self.guid, permute, &inputs[0])?])
            }
            OpKind::MatMul {
                trans_a, trans_b, ..
            } => {
                ensure!(
                    inputs.len() == 2,
                    "operator {}: matmul takes two inputs, got {}",
                    self.guid,
                    inputs.len()
                );
                let (shape, _) =
                    infer_matmul(self.guid, *trans_a, *trans_b, &inputs[0], &inputs[1])?;
                Ok(vec![shape])
            }
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Transpose { permute } => {
                write!(
                    f,
                    "Transpose(in={}, out={}, permute=[",
                    self.inputs[0], self.outputs[0]
                )?;
                for (idx, axis) in permute.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{axis}")?;
                }
                write!(f, "])")
            }
            OpKind::MatMul {
                trans_a,
                trans_b,
                m,
                n,
                k,
            } => {
                write!(
                    f,
                    "MatMul([{},{}], a={}, b={}, c={}, mnk=[{},{},{}])",
                    if *trans_a { "A^T" } else { "A" },
                    if *trans_b { "B^T" } else { "B" },
                    self.inputs[0],
                    self.inputs[1],
                    self.outputs[0],
                    m,
                    n,
                    k
                )
            }
        }
    }
}

pub(super) fn infer_transpose(guid: Guid, permute: &[usize], input: &Shape) -> Result<Shape> {
    let rank = input.rank();
    ensure!(
        permute.len() == rank,
        "operator {}: permute length {} does not match input rank {}",
        guid,
        permute.len(),
        rank
    );
    let mut seen = vec![false; rank];
    for &axis in permute {
        ensure!(
            axis < rank,
            "operator {guid}: permute axis {axis} out of range for rank {rank}"
        );
        ensure!(
            !seen[axis],
            "operator {guid}: permute repeats axis {axis}"
        );
        seen[axis] = true;
    }
    let dims: Vec<usize> = permute.iter().map(|&axis| input.dims()[axis]).collect();
    Ok(Shape::new(dims))
}

/// Effective matmul dimensions after transpose flags are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct MatmulDims {
    pub(super) m: usize,
    pub(super) n: usize,
    pub(super) k: usize,
}

pub(super) fn infer_matmul(
    guid: Guid,
    trans_a: bool,
    trans_b: bool,
    a: &Shape,
    b: &Shape,
) -> Result<(Shape, MatmulDims)> {
    ensure!(
        a.rank() >= 2 && b.rank() >= 2,
        "operator {}: matmul operands need rank >= 2, got {} and {}",
        guid,
        a.rank(),
        b.rank()
    );

    let (mut m, mut k_a) = (a.dims()[a.rank() - 2], a.dims()[a.rank() - 1]);
    if trans_a {
        std::mem::swap(&mut m, &mut k_a);
    }
    let (mut k_b, mut n) = (b.dims()[b.rank() - 2], b.dims()[b.rank() - 1]);
    if trans_b {
        std::mem::swap(&mut k_b, &mut n);
    }
    ensure!(
        k_a == k_b,
        "operator {guid}: inner dimensions do not match ({k_a} vs {k_b})"
    );

    let prefix_a = &a.dims()[..a.rank() - 2];
    let prefix_b = &b.dims()[..b.rank() - 2];
    let mut dims = broadcast_prefixes(guid, prefix_a, prefix_b)?;
    dims.push(m);
    dims.push(n);
    Ok((Shape::new(dims), MatmulDims { m, n, k: k_a }))
}

/// Right-aligned broadcast of the batch prefixes; a missing axis counts as
/// one, anything else must match or be one on a single side.
fn broadcast_prefixes(guid: Guid, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut dims = Vec::with_capacity(rank + 2);
    for idx in 0..rank {
        let dim_a = prefix_dim(a, rank, idx);
        let dim_b = prefix_dim(b, rank, idx);
        ensure!(
            dim_a == dim_b || dim_a == 1 || dim_b == 1,
            "operator {guid}: batch prefixes do not broadcast ({dim_a} vs {dim_b} at axis {idx})"
        );
        dims.push(dim_a.max(dim_b));
    }
    Ok(dims)
}

fn prefix_dim(prefix: &[usize], rank: usize, idx: usize) -> usize {
    let pad = rank - prefix.len();
    if idx < pad {
        1
    } else {
        prefix[idx - pad]
    }
}
