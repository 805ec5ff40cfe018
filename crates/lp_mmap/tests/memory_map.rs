//! Range algebra of the slice map: registration, partial unmaps and their
//! splits, double unmaps, holes.

use lp_mmap::{MemoryMap, MmapAllocation};

fn map_with(ranges: &[(usize, usize)]) -> MemoryMap {
    let mut map = MemoryMap::default();
    for &(start, size) in ranges {
        map.register_map(MmapAllocation::new(start, size));
    }
    map
}

#[test]
fn ranges_are_stored() {
    let map = map_with(&[(10, 20)]);
    assert_eq!(map.len(), 1);
    let slice = map.get(10).unwrap();
    assert_eq!(slice.start, 10);
    assert_eq!(slice.size, 20);
    assert_eq!(slice.end(), 30);
}

#[test]
fn simple_deallocation() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(10, 20));
    assert!(map.is_empty());
}

#[test]
fn unmap_of_unknown_memory_reports_nothing() {
    let mut map = map_with(&[(10, 20)]);
    assert!(!map.register_unmap(100, 50));
    assert_eq!(map.len(), 1);
}

#[test]
fn double_unmap_is_a_no_op_the_second_time() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(10, 20));
    assert!(!map.register_unmap(10, 20));
    assert!(map.is_empty());
}

#[test]
fn partial_deallocation_middle() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(15, 5));
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(10).unwrap().end(), 15);
    assert_eq!(map.get(20).unwrap().end(), 30);
}

#[test]
fn partial_deallocation_start() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(10, 5));
    assert_eq!(map.len(), 1);
    let remaining = map.get(15).unwrap();
    assert_eq!(remaining.start, 15);
    assert_eq!(remaining.end(), 30);
}

#[test]
fn partial_deallocation_end() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(25, 5));
    assert_eq!(map.len(), 1);
    let remaining = map.get(10).unwrap();
    assert_eq!(remaining.start, 10);
    assert_eq!(remaining.end(), 25);
}

#[test]
fn outer_deallocation() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(5, 30));
    assert!(map.is_empty());
}

#[test]
fn outer_deallocation_exact_cover() {
    let mut map = map_with(&[(10, 20)]);
    assert!(map.register_unmap(0, 35));
    assert!(map.is_empty());
}

#[test]
fn double_deallocation() {
    let mut map = map_with(&[(10, 20), (0, 10)]);
    assert_eq!(map.len(), 2);
    assert!(map.register_unmap(0, 30));
    assert!(map.is_empty());
}

#[test]
fn outer_double_deallocation_leaves_the_head() {
    let mut map = map_with(&[(20, 20), (10, 10), (1, 5)]);
    assert_eq!(map.len(), 3);
    assert!(map.register_unmap(7, 50));
    assert_eq!(map.len(), 1);
    let remaining = map.get(1).unwrap();
    assert_eq!(remaining.start, 1);
    assert_eq!(remaining.end(), 6);
}

#[test]
fn double_deallocation_partial_start() {
    let mut map = map_with(&[(10, 20), (0, 10)]);
    assert!(map.register_unmap(0, 15));
    assert_eq!(map.len(), 1);
    let remaining = map.get(15).unwrap();
    assert_eq!(remaining.start, 15);
    assert_eq!(remaining.end(), 30);
}

#[test]
fn double_deallocation_with_hole_partial_start() {
    let mut map = map_with(&[(10, 20), (0, 5)]);
    assert!(map.register_unmap(0, 15));
    assert_eq!(map.len(), 1);
    let remaining = map.get(15).unwrap();
    assert_eq!(remaining.start, 15);
    assert_eq!(remaining.end(), 30);
}

#[test]
fn double_deallocation_partial_end() {
    let mut map = map_with(&[(10, 20), (0, 10)]);
    assert!(map.register_unmap(0, 25));
    assert_eq!(map.len(), 1);
    let remaining = map.get(25).unwrap();
    assert_eq!(remaining.start, 25);
    assert_eq!(remaining.end(), 30);
}

#[test]
fn double_deallocation_with_hole_partial_end() {
    let mut map = map_with(&[(10, 20), (0, 5)]);
    assert!(map.register_unmap(0, 25));
    assert_eq!(map.len(), 1);
    let remaining = map.get(25).unwrap();
    assert_eq!(remaining.start, 25);
    assert_eq!(remaining.end(), 30);
}

#[test]
fn slices_from_one_mapping_share_the_allocation_record() {
    let mut map = map_with(&[(0, 100)]);
    assert!(map.register_unmap(40, 20));
    assert_eq!(map.len(), 2);
    let head = map.get(0).unwrap().allocation.clone();
    let tail = map.get(60).unwrap().allocation.clone();
    assert!(std::sync::Arc::ptr_eq(&head, &tail));
    assert_eq!(head.original_start, 0);
    assert_eq!(head.original_size, 100);
    assert_eq!(head.original_end(), 100);
}
