//! Mutable dataflow graph owning tensors, operators, and the memory plan.
//!
//! The graph is an arena: it owns the tensor and operator collections, and
//! every cross-link (producer, consumers, predecessors, successors) is an
//! id resolved through those collections, never an owning reference. The
//! usual lifecycle is construct -> add tensors and operators ->
//! [`shape_infer`](Graph::shape_infer) -> [`optimize`](Graph::optimize) ->
//! [`check_valid`](Graph::check_valid) -> [`topo_sort`](Graph::topo_sort)
//! -> [`data_malloc`](Graph::data_malloc).

mod operator;
mod optimize;

use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};

use crate::allocator::Allocator;
use crate::ids::{Fuid, Guid};
use crate::runtime::{Blob, Runtime};
use crate::tensor::{DType, Shape, Tensor};

use operator::infer_matmul;
pub use operator::{OpKind, OpType, Operator};

pub struct Graph {
    runtime: Arc<dyn Runtime>,
    allocator: Allocator,
    tensors: Vec<Tensor>,
    ops: Vec<Operator>,
    sorted: bool,
    data_planned: bool,
}

impl Graph {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Graph {
            allocator: Allocator::new(Arc::clone(&runtime)),
            runtime,
            tensors: Vec::new(),
            ops: Vec::new(),
            sorted: false,
            data_planned: false,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Tensors in insertion order; memory planning allocates in this order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Operators in insertion order, or in topological order after a
    /// successful [`topo_sort`](Graph::topo_sort).
    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn tensor(&self, fuid: Fuid) -> Option<&Tensor> {
        self.tensors.iter().find(|tensor| tensor.fuid() == fuid)
    }

    pub fn operator(&self, guid: Guid) -> Option<&Operator> {
        self.ops.iter().find(|op| op.guid() == guid)
    }

    fn tensor_mut(&mut self, fuid: Fuid) -> Option<&mut Tensor> {
        self.tensors.iter_mut().find(|tensor| tensor.fuid() == fuid)
    }

    fn operator_mut(&mut self, guid: Guid) -> Option<&mut Operator> {
        self.ops.iter_mut().find(|op| op.guid() == guid)
    }

    fn require_tensor(&self, fuid: Fuid) -> Result<&Tensor> {
        self.tensor(fuid)
            .ok_or_else(|| anyhow!("tensor {fuid} is not a graph member"))
    }

    fn require_tensor_mut(&mut self, fuid: Fuid) -> Result<&mut Tensor> {
        self.tensor_mut(fuid)
            .ok_or_else(|| anyhow!("tensor {fuid} is not a graph member"))
    }

    fn require_operator(&self, guid: Guid) -> Result<&Operator> {
        self.operator(guid)
            .ok_or_else(|| anyhow!("operator {guid} is not a graph member"))
    }

    fn require_operator_mut(&mut self, guid: Guid) -> Result<&mut Operator> {
        self.operator_mut(guid)
            .ok_or_else(|| anyhow!("operator {guid} is not a graph member"))
    }

    /// Creates a fresh tensor owned by this graph.
    pub fn add_tensor(&mut self, shape: Shape, dtype: DType) -> Fuid {
        let tensor = Tensor::new(shape, dtype, Arc::clone(&self.runtime));
        let fuid = tensor.fuid();
        self.tensors.push(tensor);
        fuid
    }

    /// Adopts a tensor constructed elsewhere; it must share this graph's
    /// runtime.
    pub fn adopt_tensor(&mut self, tensor: Tensor) -> Result<Fuid> {
        ensure!(
            Arc::ptr_eq(tensor.runtime(), &self.runtime),
            "tensor {} belongs to runtime `{}`, cannot adopt into `{}`",
            tensor.fuid(),
            tensor.runtime().name(),
            self.runtime.name()
        );
        let fuid = tensor.fuid();
        self.tensors.push(tensor);
        Ok(fuid)
    }

    /// Registers a transpose over `input` writing into `output`.
    ///
    /// Validates the permutation against the input rank and shapes the
    /// output tensor from the inference rule.
    pub fn add_transpose(
        &mut self,
        input: Fuid,
        output: Fuid,
        permute: Vec<usize>,
    ) -> Result<Guid> {
        let (in_shape, in_dtype) = {
            let tensor = self.require_tensor(input)?;
            (tensor.shape().clone(), tensor.dtype())
        };
        let out_dtype = self.require_tensor(output)?.dtype();
        ensure!(
            in_dtype == out_dtype,
            "transpose {input} -> {output}: dtype mismatch ({in_dtype:?} vs {out_dtype:?})"
        );
        let op = Operator::transpose(input, output, permute);
        let inferred = op.infer_shape(std::slice::from_ref(&in_shape))?;
        let out_shape = inferred
            .into_iter()
            .next()
            .expect("transpose infers exactly one shape");
        self.require_tensor_mut(output)?.set_shape(out_shape);
        self.add_operator_and_connect(op)
    }

    /// Registers a matrix multiply of `a` and `b` writing into `output`.
    ///
    /// Shapes the output tensor and caches the effective `m`/`n`/`k`.
    pub fn add_matmul(
        &mut self,
        a: Fuid,
        b: Fuid,
        output: Fuid,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Guid> {
        let (shape_a, dtype_a) = {
            let tensor = self.require_tensor(a)?;
            (tensor.shape().clone(), tensor.dtype())
        };
        let (shape_b, dtype_b) = {
            let tensor = self.require_tensor(b)?;
            (tensor.shape().clone(), tensor.dtype())
        };
        let out_dtype = self.require_tensor(output)?.dtype();
        ensure!(
            dtype_a == dtype_b,
            "matmul over {a} and {b}: operand dtype mismatch ({dtype_a:?} vs {dtype_b:?})"
        );
        ensure!(
            dtype_a == out_dtype,
            "matmul output {output}: dtype mismatch ({out_dtype:?} vs {dtype_a:?})"
        );
        let mut op = Operator::matmul(a, b, output, trans_a, trans_b);
        let (out_shape, dims) = infer_matmul(op.guid(), trans_a, trans_b, &shape_a, &shape_b)?;
        if let OpKind::MatMul { m, n, k, .. } = op.kind_mut() {
            *m = dims.m;
            *n = dims.n;
            *k = dims.k;
        }
        self.require_tensor_mut(output)?.set_shape(out_shape);
        self.add_operator_and_connect(op)
    }

    /// Inserts `op` and wires the tensor links: each input gains `op` as a
    /// target, each output records `op` as its producer, and the derived
    /// predecessor/successor sets are rebuilt from those links.
    fn add_operator_and_connect(&mut self, op: Operator) -> Result<Guid> {
        let guid = op.guid();
        for &fuid in op.inputs().iter().chain(op.outputs().iter()) {
            ensure!(
                self.tensor(fuid).is_some(),
                "operator {guid}: tensor {fuid} is not a graph member"
            );
        }
        for &fuid in op.outputs() {
            if let Some(existing) = self.tensor(fuid).and_then(|tensor| tensor.source()) {
                bail!("operator {guid}: output tensor {fuid} already has producer {existing}");
            }
        }

        self.sorted = false;
        let input_fuids = op.inputs().to_vec();
        let output_fuids = op.outputs().to_vec();
        self.ops.push(op);

        for fuid in input_fuids {
            let source = {
                let tensor = self.require_tensor_mut(fuid)?;
                tensor.add_target(guid);
                tensor.source()
            };
            if let Some(pred) = source {
                self.require_operator_mut(pred)?.add_successor(guid);
                self.require_operator_mut(guid)?.add_predecessor(pred);
            }
        }
        for fuid in output_fuids {
            let targets = {
                let tensor = self.require_tensor_mut(fuid)?;
                tensor.set_source(Some(guid));
                tensor.targets().to_vec()
            };
            for succ in targets {
                if succ == guid {
                    continue;
                }
                self.require_operator_mut(succ)?.add_predecessor(guid);
                self.require_operator_mut(guid)?.add_successor(succ);
            }
        }
        Ok(guid)
    }

    /// Deletes an operator and scrubs every remaining reference to it.
    pub fn remove_operator(&mut self, guid: Guid) -> Result<()> {
        let idx = self
            .ops
            .iter()
            .position(|op| op.guid() == guid)
            .ok_or_else(|| anyhow!("operator {guid} is not a graph member"))?;
        self.ops.remove(idx);
        for op in &mut self.ops {
            op.remove_predecessor(guid);
            op.remove_successor(guid);
        }
        for tensor in &mut self.tensors {
            if tensor.source() == Some(guid) {
                tensor.set_source(None);
            }
            tensor.remove_target(guid);
        }
        self.sorted = false;
        Ok(())
    }

    /// Deletes a tensor; it must already be disconnected from every
    /// operator.
    pub fn remove_tensor(&mut self, fuid: Fuid) -> Result<()> {
        let idx = self
            .tensors
            .iter()
            .position(|tensor| tensor.fuid() == fuid)
            .ok_or_else(|| anyhow!("tensor {fuid} is not a graph member"))?;
        for op in &self.ops {
            ensure!(
                !op.inputs().contains(&fuid) && !op.outputs().contains(&fuid),
                "tensor {fuid} is still connected to operator {}",
                op.guid()
            );
        }
        self.tensors.remove(idx);
        self.sorted = false;
        Ok(())
    }

    /// Orders operators so every producer precedes its consumers.
    ///
    /// Repeatedly sweeps the operator list, admitting an operator once all
    /// of its inputs are graph inputs or produced by an already-admitted
    /// operator; ties keep insertion order. Returns `false` when a sweep
    /// admits nothing (the graph has a cycle), leaving the list untouched.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }
        let mut order = Vec::with_capacity(self.ops.len());
        let mut placed: HashSet<Guid> = HashSet::with_capacity(self.ops.len());
        while order.len() < self.ops.len() {
            let mut modified = false;
            for (idx, op) in self.ops.iter().enumerate() {
                if placed.contains(&op.guid()) {
                    continue;
                }
                let ready = op.inputs().iter().all(|&fuid| {
                    match self.tensor(fuid).and_then(|tensor| tensor.source()) {
                        None => true,
                        Some(source) => placed.contains(&source),
                    }
                });
                if ready {
                    modified = true;
                    order.push(idx);
                    placed.insert(op.guid());
                }
            }
            if !modified {
                return false;
            }
        }
        let mut slots: Vec<Option<Operator>> = self.ops.drain(..).map(Some).collect();
        self.ops = order
            .into_iter()
            .map(|idx| slots[idx].take().expect("each operator is admitted once"))
            .collect();
        self.sorted = true;
        true
    }

    /// Re-derives every operator's output shapes in the current order,
    /// updating tensors whose shape changed and refreshing cached matmul
    /// dimensions.
    pub fn shape_infer(&mut self) -> Result<()> {
        for idx in 0..self.ops.len() {
            let (guid, input_shapes, output_fuids) = {
                let op = &self.ops[idx];
                let mut shapes = Vec::with_capacity(op.inputs().len());
                for &fuid in op.inputs() {
                    shapes.push(self.require_tensor(fuid)?.shape().clone());
                }
                (op.guid(), shapes, op.outputs().to_vec())
            };

            let inferred = self.ops[idx].infer_shape(&input_shapes)?;
            ensure!(
                inferred.len() == output_fuids.len(),
                "operator {guid}: inferred {} shapes for {} outputs",
                inferred.len(),
                output_fuids.len()
            );

            let matmul_dims = match self.ops[idx].kind() {
                OpKind::MatMul {
                    trans_a, trans_b, ..
                } => Some(
                    infer_matmul(guid, *trans_a, *trans_b, &input_shapes[0], &input_shapes[1])?.1,
                ),
                OpKind::Transpose { .. } => None,
            };
            if let Some(dims) = matmul_dims {
                if let OpKind::MatMul { m, n, k, .. } = self.ops[idx].kind_mut() {
                    *m = dims.m;
                    *n = dims.n;
                    *k = dims.k;
                }
            }

            for (fuid, new_shape) in output_fuids.into_iter().zip(inferred) {
                let tensor = self.require_tensor_mut(fuid)?;
                if tensor.shape() != &new_shape {
                    tensor.set_shape(new_shape);
                }
            }
        }
        Ok(())
    }

    /// Applies one pass of algebraic rewrites: inverse-transpose pairs are
    /// eliminated and last-two-axes transposes are folded into matmul
    /// trans flags. Clears the sort flag and keeps the graph valid.
    pub fn optimize(&mut self) -> Result<()> {
        optimize::run(self)
    }

    /// Verifies the cross-reference invariants between tensors and
    /// operators; any violation is fatal to the graph.
    pub fn check_valid(&self) -> Result<()> {
        for tensor in &self.tensors {
            let fuid = tensor.fuid();
            ensure!(
                tensor.source().is_some() || !tensor.targets().is_empty(),
                "tensor {fuid} has neither a producer nor consumers"
            );
            if let Some(source) = tensor.source() {
                let op = self.operator(source).ok_or_else(|| {
                    anyhow!("tensor {fuid}: producer {source} is not a graph member")
                })?;
                ensure!(
                    op.outputs().contains(&fuid),
                    "tensor {fuid}: producer {source} does not list it as an output"
                );
            }
            for &target in tensor.targets() {
                let op = self.operator(target).ok_or_else(|| {
                    anyhow!("tensor {fuid}: consumer {target} is not a graph member")
                })?;
                ensure!(
                    op.inputs().contains(&fuid),
                    "tensor {fuid}: consumer {target} does not list it as an input"
                );
            }
        }
        for op in &self.ops {
            let guid = op.guid();
            for &fuid in op.inputs() {
                let tensor = self.tensor(fuid).ok_or_else(|| {
                    anyhow!("operator {guid}: input tensor {fuid} is not a graph member")
                })?;
                ensure!(
                    tensor.targets().contains(&guid),
                    "operator {guid}: input tensor {fuid} does not list it as a target"
                );
            }
            for &fuid in op.outputs() {
                let tensor = self.tensor(fuid).ok_or_else(|| {
                    anyhow!("operator {guid}: output tensor {fuid} is not a graph member")
                })?;
                ensure!(
                    tensor.source() == Some(guid),
                    "operator {guid}: output tensor {fuid} names a different producer"
                );
            }
            for &pred in op.predecessors() {
                ensure!(
                    self.operator(pred).is_some(),
                    "operator {guid}: predecessor {pred} is not a graph member"
                );
            }
            for &succ in op.successors() {
                ensure!(
                    self.operator(succ).is_some(),
                    "operator {guid}: successor {succ} is not a graph member"
                );
            }
        }
        let mut seen = HashSet::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            ensure!(
                seen.insert(tensor.fuid()),
                "duplicate tensor fuid {}",
                tensor.fuid()
            );
        }
        Ok(())
    }

    /// Plans an offset for every tensor, materialises the backing buffer,
    /// and binds each tensor's blob at `base + offset`.
    ///
    /// Allocation follows tensor insertion order, so offsets are
    /// deterministic for a given construction sequence. Callable at most
    /// once per graph; requires an acyclic graph.
    pub fn data_malloc(&mut self) -> Result<()> {
        ensure!(!self.data_planned, "graph memory was already planned");
        ensure!(self.topo_sort(), "graph contains a cycle; cannot plan memory");

        let mut offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            let bytes = tensor.byte_size()?;
            offsets.push(self.allocator.alloc(bytes));
        }

        let base = self.allocator.get_ptr()?;
        let runtime = Arc::clone(&self.runtime);
        for (tensor, offset) in self.tensors.iter_mut().zip(offsets) {
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            tensor.set_data_blob(Arc::new(Blob::new(Arc::clone(&runtime), ptr)))?;
        }

        let (used, peak) = self.allocator.info();
        tracing::debug!(used, peak, "graph memory plan bound");
        self.data_planned = true;
        Ok(())
    }

    /// Live bytes and high-water mark of the memory plan.
    pub fn allocator_info(&self) -> (usize, usize) {
        self.allocator.info()
    }

    /// Tensors with no producing operator (graph inputs and constants).
    pub fn inputs(&self) -> Vec<Fuid> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.source().is_none())
            .map(|tensor| tensor.fuid())
            .collect()
    }

    /// Tensors no operator consumes (graph results).
    pub fn outputs(&self) -> Vec<Fuid> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.targets().is_empty())
            .map(|tensor| tensor.fuid())
            .collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for tensor in &self.tensors {
            writeln!(f, "{tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in &self.ops {
            write!(f, "OP {}, pred [", op.guid())?;
            for (idx, pred) in op.predecessors().iter().enumerate() {
                if idx > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{pred}")?;
            }
            write!(f, "], succ [")?;
            for (idx, succ) in op.successors().iter().enumerate() {
                if idx > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{succ}")?;
            }
            writeln!(f, "], {op}")?;
        }
        Ok(())
    }
}
