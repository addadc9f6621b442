mod common;
use common::*;

fn tight_config() -> BridgeConfig {
    BridgeConfig {
        stack_size: 2048,
        heap_size: 8192,
        redzone: 512,
        heap_headroom: 2048,
        ..BridgeConfig::default()
    }
}

#[test]
fn nested_scopes_restore_both_marks() {
    let arena = CallArena::new(&tight_config()).expect("arena");
    let start = arena.watermark();
    {
        let outer = arena.scope();
        outer.stack_alloc(64, 16).expect("outer stack");
        outer.heap_alloc(100, 8).expect("outer heap");
        let after_outer = arena.watermark();
        {
            let inner = arena.scope();
            inner.stack_alloc(128, 16).expect("inner stack");
            inner.heap_alloc(12, 4).expect("inner heap");
            assert_eq!(arena.depth(), 2);
            assert!(arena.watermark().stack > after_outer.stack);
        }
        assert_eq!(arena.watermark(), after_outer);
        assert_eq!(arena.depth(), 1);
    }
    assert_eq!(arena.watermark(), start);
    assert_eq!(arena.depth(), 0);
}

#[test]
fn exhaustion_reports_region_and_sizes() {
    let arena = CallArena::new(&tight_config()).expect("arena");
    let scope = arena.scope();
    scope.heap_alloc(8000, 16).expect("most of the heap");
    let err = scope.heap_alloc(500, 16).expect_err("heap is full");
    match err {
        BridgeError::ArenaExhausted {
            region,
            requested,
            available,
        } => {
            assert_eq!(region, ArenaRegion::Heap);
            assert_eq!(requested, 500);
            assert_eq!(available, 192);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(arena.stack_capacity(), 1536);
}

#[test]
fn outer_scope_cannot_allocate_under_an_inner_one() {
    let arena = CallArena::new(&tight_config()).expect("arena");
    let outer = arena.scope();
    let inner = arena.scope();
    assert_eq!(
        outer.heap_alloc(8, 8).expect_err("outer is shadowed"),
        BridgeError::ArenaScopeViolation
    );
    inner.heap_alloc(8, 8).expect("innermost allocates");
    drop(inner);
    outer.heap_alloc(8, 8).expect("outer is innermost again");
}

#[test]
fn strings_beyond_the_headroom_leave_the_heap_alone() {
    let arena = CallArena::new(&tight_config()).expect("arena");
    let scope = arena.scope();
    let small = scope.string_alloc(32, 1).expect("small string");
    assert!(arena.watermark().heap >= 32);
    small.write_at(0, b"fits in the arena\0").expect("write");

    let before = arena.watermark();
    let large = scope.string_alloc(7000, 2).expect("large string");
    assert_eq!(large.addr() % 2, 0);
    assert_eq!(arena.watermark(), before);
    large.write_at(6990, &[1; 10]).expect("whole buffer is writable");
}

#[test]
fn fresh_allocations_are_zeroed() {
    let arena = CallArena::new(&tight_config()).expect("arena");
    {
        let scope = arena.scope();
        let slice = scope.heap_alloc(16, 16).expect("slice");
        slice.write_at(0, &[0xaa; 16]).expect("dirty it");
    }
    let scope = arena.scope();
    let slice = scope.heap_alloc(16, 16).expect("same bytes again");
    assert_eq!(slice.to_vec(), vec![0; 16]);
}
