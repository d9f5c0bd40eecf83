use std::sync::Arc;

use anyhow::Result;
use weft::{DType, Graph, OpKind, Shape};
use weft_runtime_cpu::CpuRuntime;

fn graph() -> Graph {
    Graph::new(Arc::new(CpuRuntime::new()))
}

#[test]
fn connecting_an_operator_wires_both_directions() -> Result<()> {
    let mut g = graph();
    let x = g.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let y = g.add_tensor(Shape::new([1]), DType::F32);
    let t = g.add_transpose(x, y, vec![0, 2, 1])?;

    assert_eq!(g.tensor(x).unwrap().targets(), [t]);
    assert_eq!(g.tensor(y).unwrap().source(), Some(t));
    assert_eq!(g.tensor(y).unwrap().shape(), &Shape::new([2, 4, 3]));

    let z = g.add_tensor(Shape::new([1]), DType::F32);
    let mm = g.add_matmul(y, y, z, false, true)?;
    assert_eq!(g.operator(mm).unwrap().predecessors(), [t]);
    assert_eq!(g.operator(t).unwrap().successors(), [mm]);

    g.check_valid()
}

#[test]
fn topo_sort_places_producers_before_consumers() -> Result<()> {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([2, 2]), DType::F32);
    let t1 = g.add_tensor(Shape::new([2, 2]), DType::F32);
    let t2 = g.add_tensor(Shape::new([2, 2]), DType::F32);

    // Insert the consumer first; the sweep must reorder it after its
    // producer while keeping ties in insertion order.
    let late = g.add_transpose(t1, t2, vec![0, 1])?;
    let early = g.add_transpose(a, t1, vec![1, 0])?;
    assert_eq!(g.operators()[0].guid(), late);

    assert!(g.topo_sort());
    let order: Vec<_> = g.operators().iter().map(|op| op.guid()).collect();
    assert_eq!(order, vec![early, late]);
    g.check_valid()
}

#[test]
fn cyclic_graph_is_rejected() -> Result<()> {
    let mut g = graph();
    let t1 = g.add_tensor(Shape::new([2, 2]), DType::F32);
    let t2 = g.add_tensor(Shape::new([2, 2]), DType::F32);
    g.add_transpose(t1, t2, vec![0, 1])?;
    g.add_transpose(t2, t1, vec![0, 1])?;

    assert!(!g.topo_sort(), "a cycle must fail the sort");
    let err = g.data_malloc().unwrap_err();
    assert!(err.to_string().contains("cycle"), "got: {err}");
    Ok(())
}

#[test]
fn orphan_tensor_fails_validation() {
    let mut g = graph();
    g.add_tensor(Shape::new([4]), DType::F32);
    let err = g.check_valid().unwrap_err();
    assert!(
        err.to_string().contains("neither a producer nor consumers"),
        "got: {err}"
    );
}

#[test]
fn matmul_inner_dimension_mismatch_is_fatal() {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([1, 4, 3]), DType::F32);
    let b = g.add_tensor(Shape::new([1, 4, 5]), DType::F32);
    let c = g.add_tensor(Shape::new([1]), DType::F32);
    let err = g.add_matmul(a, b, c, false, false).unwrap_err();
    assert!(err.to_string().contains("inner dimensions"), "got: {err}");
}

#[test]
fn matmul_batch_prefixes_must_broadcast() {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([2, 4, 3]), DType::F32);
    let b = g.add_tensor(Shape::new([3, 3, 5]), DType::F32);
    let c = g.add_tensor(Shape::new([1]), DType::F32);
    let err = g.add_matmul(a, b, c, false, false).unwrap_err();
    assert!(err.to_string().contains("broadcast"), "got: {err}");
}

#[test]
fn matmul_broadcasts_singleton_batch_axes() -> Result<()> {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([2, 1, 4, 3]), DType::F32);
    let b = g.add_tensor(Shape::new([5, 3, 6]), DType::F32);
    let c = g.add_tensor(Shape::new([1]), DType::F32);
    g.add_matmul(a, b, c, false, false)?;
    assert_eq!(g.tensor(c).unwrap().shape(), &Shape::new([2, 5, 4, 6]));
    Ok(())
}

#[test]
fn invalid_permute_is_fatal() {
    let mut g = graph();
    let x = g.add_tensor(Shape::new([2, 3]), DType::F32);
    let y = g.add_tensor(Shape::new([1]), DType::F32);
    let err = g.add_transpose(x, y, vec![0, 2]).unwrap_err();
    assert!(err.to_string().contains("out of range"), "got: {err}");

    let z = g.add_tensor(Shape::new([1]), DType::F32);
    let err = g.add_transpose(x, z, vec![0]).unwrap_err();
    assert!(err.to_string().contains("permute length"), "got: {err}");
}

#[test]
fn shape_infer_rederives_outputs_and_matmul_dims() -> Result<()> {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([1, 3, 4]), DType::F32);
    let b = g.add_tensor(Shape::new([1, 3, 5]), DType::F32);
    let at = g.add_tensor(Shape::new([1]), DType::F32);
    let c = g.add_tensor(Shape::new([1]), DType::F32);
    g.add_transpose(a, at, vec![0, 2, 1])?;
    let mm = g.add_matmul(at, b, c, false, false)?;

    g.shape_infer()?;
    assert_eq!(g.tensor(c).unwrap().shape(), &Shape::new([1, 4, 5]));
    match g.operator(mm).unwrap().kind() {
        OpKind::MatMul { m, n, k, .. } => {
            assert_eq!((*m, *n, *k), (4, 5, 3));
        }
        other => panic!("expected matmul, got {other:?}"),
    }
    Ok(())
}

#[test]
fn graph_boundary_tensors_are_reported() -> Result<()> {
    let mut g = graph();
    let a = g.add_tensor(Shape::new([1, 3, 4]), DType::F32);
    let b = g.add_tensor(Shape::new([1, 4, 5]), DType::F32);
    let c = g.add_tensor(Shape::new([1]), DType::F32);
    g.add_matmul(a, b, c, false, false)?;

    assert_eq!(g.inputs(), vec![a, b]);
    assert_eq!(g.outputs(), vec![c]);
    Ok(())
}

#[test]
fn removing_a_connected_tensor_is_rejected() -> Result<()> {
    let mut g = graph();
    let x = g.add_tensor(Shape::new([2, 2]), DType::F32);
    let y = g.add_tensor(Shape::new([1]), DType::F32);
    g.add_transpose(x, y, vec![1, 0])?;

    let err = g.remove_tensor(x).unwrap_err();
    assert!(err.to_string().contains("still connected"), "got: {err}");
    Ok(())
}
