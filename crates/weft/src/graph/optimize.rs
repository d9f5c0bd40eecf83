//! Algebraic rewrites over the graph.
//!
//! Two rewrite families run in a single pass:
//!
//! 1. A transpose whose permutation composes with its producing transpose
//!    to the identity is eliminated together with that producer.
//! 2. A matmul operand produced by a transpose that swaps only the last
//!    two axes absorbs the swap into the matching `trans_a`/`trans_b` flag.
//!
//! Deletions are collected during the scan and applied at the end so
//! iteration never observes a half-removed node. The pass clears the
//! graph's sort flag and leaves every `check_valid` invariant intact.

use anyhow::Result;

use crate::ids::{Fuid, Guid};

use super::operator::{OpKind, OpType};
use super::Graph;

pub(super) fn run(graph: &mut Graph) -> Result<()> {
    let mut remove_ops: Vec<Guid> = Vec::new();
    let mut remove_tensors: Vec<Fuid> = Vec::new();

    let scan: Vec<Guid> = graph.ops.iter().map(|op| op.guid()).collect();
    for guid in scan {
        if remove_ops.contains(&guid) {
            continue;
        }
        let op_type = graph.require_operator(guid)?.op_type();
        match op_type {
            OpType::Transpose => {
                cancel_inverse_pair(graph, guid, &mut remove_ops, &mut remove_tensors)?
            }
            OpType::MatMul => {
                fuse_operand_transposes(graph, guid, &mut remove_ops, &mut remove_tensors)?
            }
        }
    }

    let (removed_ops, removed_tensors) = (remove_ops.len(), remove_tensors.len());
    for guid in remove_ops {
        graph.remove_operator(guid)?;
    }
    for fuid in remove_tensors {
        graph.remove_tensor(fuid)?;
    }
    graph.sorted = false;
    if removed_ops > 0 {
        tracing::debug!(removed_ops, removed_tensors, "graph rewrites applied");
    }
    Ok(())
}

/// `transpose(transpose(x, p), q)` with `q ∘ p = identity` collapses so the
/// outer consumers read `x` directly; both transposes and both intermediate
/// tensors go away.
fn cancel_inverse_pair(
    graph: &mut Graph,
    guid: Guid,
    remove_ops: &mut Vec<Guid>,
    remove_tensors: &mut Vec<Fuid>,
) -> Result<()> {
    let (pred_guid, outer_permute) = {
        let op = graph.require_operator(guid)?;
        if op.predecessors().len() != 1 {
            return Ok(());
        }
        let OpKind::Transpose { permute } = op.kind() else {
            return Ok(());
        };
        (op.predecessors()[0], permute.clone())
    };
    if remove_ops.contains(&pred_guid) {
        return Ok(());
    }
    let inner_permute = {
        let pred = graph.require_operator(pred_guid)?;
        match pred.kind() {
            OpKind::Transpose { permute } => permute.clone(),
            OpKind::MatMul { .. } => return Ok(()),
        }
    };
    let Some(composed) = compose_permutes(&inner_permute, &outer_permute) else {
        return Ok(());
    };
    if !is_identity(&composed) {
        return Ok(());
    }

    let (base, stale_in, stale_out) = {
        let op = graph.require_operator(guid)?;
        let pred = graph.require_operator(pred_guid)?;
        (pred.inputs()[0], op.inputs()[0], op.outputs()[0])
    };
    // Splicing is only sound when the intermediate tensor feeds nothing
    // but this pair.
    {
        let stale = graph.require_tensor(stale_in)?;
        if stale.source() != Some(pred_guid)
            || stale.targets().len() != 1
            || stale.targets()[0] != guid
        {
            return Ok(());
        }
    }

    let consumers = graph.require_tensor(stale_out)?.targets().to_vec();
    // A pair feeding nothing is left alone; erasing it would strand the
    // base tensor with no remaining links.
    if consumers.is_empty() {
        return Ok(());
    }

    let base_source = graph.require_tensor(base)?.source();
    for consumer in consumers {
        {
            let op = graph.require_operator_mut(consumer)?;
            op.replace_input(stale_out, base);
            op.remove_predecessor(guid);
            if let Some(source) = base_source {
                op.add_predecessor(source);
            }
        }
        graph.require_tensor_mut(base)?.add_target(consumer);
        if let Some(source) = base_source {
            graph.require_operator_mut(source)?.add_successor(consumer);
        }
    }
    graph.require_tensor_mut(base)?.remove_target(pred_guid);

    push_unique(remove_ops, pred_guid);
    push_unique(remove_ops, guid);
    push_unique(remove_tensors, stale_in);
    push_unique(remove_tensors, stale_out);
    Ok(())
}

/// Splices a last-two-axes transpose out of a matmul operand and toggles
/// the matching trans flag. The toggle happens per operand, so one
/// transpose feeding both operands flips both flags.
fn fuse_operand_transposes(
    graph: &mut Graph,
    guid: Guid,
    remove_ops: &mut Vec<Guid>,
    remove_tensors: &mut Vec<Fuid>,
) -> Result<()> {
    for index in 0..2 {
        let stale = graph.require_operator(guid)?.inputs()[index];
        let Some(pred_guid) = graph.require_tensor(stale)?.source() else {
            continue;
        };
        let base = {
            let pred = graph.require_operator(pred_guid)?;
            let OpKind::Transpose { permute } = pred.kind() else {
                continue;
            };
            if !swaps_last_two(permute) {
                continue;
            }
            pred.inputs()[0]
        };
        {
            let stale_tensor = graph.require_tensor(stale)?;
            if stale_tensor.targets().len() != 1 || stale_tensor.targets()[0] != guid {
                continue;
            }
        }
        let base_source = graph.require_tensor(base)?.source();

        {
            let base_tensor = graph.require_tensor_mut(base)?;
            base_tensor.remove_target(pred_guid);
            base_tensor.add_target(guid);
        }
        {
            let op = graph.require_operator_mut(guid)?;
            op.replace_input_at(index, base);
            op.remove_predecessor(pred_guid);
            if let Some(source) = base_source {
                op.add_predecessor(source);
            }
            if let OpKind::MatMul {
                trans_a, trans_b, ..
            } = op.kind_mut()
            {
                if index == 0 {
                    *trans_a = !*trans_a;
                } else {
                    *trans_b = !*trans_b;
                }
            }
        }
        if let Some(source) = base_source {
            graph.require_operator_mut(source)?.add_successor(guid);
        }

        push_unique(remove_ops, pred_guid);
        push_unique(remove_tensors, stale);
    }
    Ok(())
}

/// `first` applied before `second`: `out[i] = first[second[i]]`.
fn compose_permutes(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    let mut composed = Vec::with_capacity(first.len());
    for &axis in second {
        if axis >= first.len() {
            return None;
        }
        composed.push(first[axis]);
    }
    Some(composed)
}

fn is_identity(permute: &[usize]) -> bool {
    permute.iter().copied().eq(0..permute.len())
}

/// True when the permutation swaps the last two axes and fixes the rest.
fn swaps_last_two(permute: &[usize]) -> bool {
    let rank = permute.len();
    if rank < 2 {
        return false;
    }
    permute[rank - 1] == rank - 2
        && permute[rank - 2] == rank - 1
        && permute[..rank - 2].iter().copied().eq(0..rank - 2)
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) {
    if !list.contains(&value) {
        list.push(value);
    }
}
