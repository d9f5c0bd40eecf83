use std::sync::Arc;

use weft::runtime::Runtime;
use weft::Allocator;
use weft_runtime_cpu::CpuRuntime;

fn planner() -> Allocator {
    let runtime: Arc<dyn Runtime> = Arc::new(CpuRuntime::new());
    Allocator::new(runtime)
}

#[test]
fn offsets_are_aligned_and_disjoint() {
    let mut allocator = planner();
    let a = allocator.alloc(1);
    let b = allocator.alloc(13);
    let c = allocator.alloc(24);
    assert_eq!(a, 0);
    assert_eq!(b, 8, "1 byte rounds up to one alignment unit");
    assert_eq!(c, 24, "13 bytes round up to 16");
    let (used, peak) = allocator.info();
    assert_eq!(used, 48);
    assert_eq!(peak, 48);
}

#[test]
fn first_fit_reuses_freed_span() {
    let mut allocator = planner();
    let a = allocator.alloc(16);
    let b = allocator.alloc(32);
    let c = allocator.alloc(16);
    assert_eq!((a, b, c), (0, 16, 48));

    allocator.free(b, 32);
    let d = allocator.alloc(24);
    assert_eq!(d, 16, "24 bytes fit first into the freed 32-byte span");
    let e = allocator.alloc(8);
    assert_eq!(e, 40, "the 8-byte remainder of that span is reused next");

    let (used, peak) = allocator.info();
    assert_eq!(used, 64);
    assert_eq!(peak, 64, "reuse must not grow the buffer");
}

#[test]
fn tail_span_absorbs_oversized_request() {
    let mut allocator = planner();
    let a = allocator.alloc(16);
    let b = allocator.alloc(16);
    assert_eq!((a, b), (0, 16));

    allocator.free(b, 16);
    let c = allocator.alloc(40);
    assert_eq!(c, 16, "a free span ending at peak is extended in place");
    let (_, peak) = allocator.info();
    assert_eq!(peak, 56);
}

#[test]
fn freeing_everything_collapses_to_one_span() {
    let mut allocator = planner();
    let a = allocator.alloc(16);
    let b = allocator.alloc(16);
    let c = allocator.alloc(16);

    allocator.free(a, 16);
    allocator.free(c, 16);
    assert_eq!(allocator.free_spans(), vec![(0, 16), (32, 16)]);

    allocator.free(b, 16);
    assert_eq!(
        allocator.free_spans(),
        vec![(0, 48)],
        "adjacent spans must coalesce into one"
    );
    let (used, peak) = allocator.info();
    assert_eq!(used, 0);
    assert_eq!(peak, 48);
}

#[test]
fn live_allocations_never_overlap() {
    let mut allocator = planner();
    let mut live: Vec<(usize, usize)> = Vec::new();
    for &request in &[24usize, 8, 40, 16, 8] {
        let offset = allocator.alloc(request);
        let len = request.div_ceil(8) * 8;
        for &(other_off, other_len) in &live {
            assert!(
                offset + len <= other_off || other_off + other_len <= offset,
                "span {offset}+{len} overlaps {other_off}+{other_len}"
            );
        }
        live.push((offset, len));
    }
    allocator.free(live[1].0, 8);
    allocator.free(live[3].0, 16);
    let reused = allocator.alloc(8);
    assert_eq!(reused % 8, 0);
}

#[test]
fn materialization_returns_cached_pointer() {
    let mut allocator = planner();
    allocator.alloc(32);
    let first = allocator.get_ptr().expect("cpu allocation succeeds");
    let second = allocator.get_ptr().expect("cached pointer");
    assert_eq!(first, second);
}

#[test]
#[should_panic(expected = "frozen")]
fn alloc_after_materialization_panics() {
    let mut allocator = planner();
    allocator.alloc(8);
    allocator.get_ptr().expect("cpu allocation succeeds");
    allocator.alloc(8);
}

#[test]
#[should_panic(expected = "frozen")]
fn free_after_materialization_panics() {
    let mut allocator = planner();
    let offset = allocator.alloc(8);
    allocator.get_ptr().expect("cpu allocation succeeds");
    allocator.free(offset, 8);
}
