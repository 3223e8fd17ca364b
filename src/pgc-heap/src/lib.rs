//! Generic chunked-storage binary min-heap.
//!
//! Mirrors the resident keeper's own ranking structure: elements are compared
//! by a caller-supplied ordering and the heap never needs to know what they
//! mean. Storage is carved into fixed-size chunks that are never reallocated
//! in place (so a `&T` handed out between operations stays valid for the
//! lifetime of the chunk), which matters for callers that want to peek at
//! [`Heap::min`] and then decide whether to push before popping.
//!
//! The original C ancestor of this tool embedded an intrusive tree node in
//! every heap slot and had to patch that node's pointers whenever a sift
//! moved the slot (see `resident_mapping_move` in the upstream sources).
//! Here elements are required to be `Copy` and the ordered map stores the
//! element itself (an arena handle) rather than a pointer into the heap, so
//! moving a slot during a sift never invalidates anything external and no
//! relocation callback is needed.

use std::cmp::Ordering;

/// Number of elements per storage chunk. Kept a plain constant (rather than a
/// generic parameter) since the heap's capacity is always small multiples of
/// this in practice — the resident keeper tracks at most a few thousand
/// mappings.
const CHUNK_LEN: usize = 64;

/// A chunked min-heap over `T`, ordered by a caller-supplied comparator.
///
/// `T` is required to be `Copy`: every element stored here is expected to be
/// a small handle (an array index, a pointer, an id), never the payload
/// itself.
pub struct Heap<T, F>
where
    T: Copy,
    F: Fn(&T, &T) -> Ordering,
{
    chunks: Vec<Box<[Option<T>; CHUNK_LEN]>>,
    len: usize,
    compare: F,
}

impl<T, F> Heap<T, F>
where
    T: Copy,
    F: Fn(&T, &T) -> Ordering,
{
    pub fn new(compare: F) -> Self {
        Heap {
            chunks: Vec::new(),
            len: 0,
            compare,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn get(&self, i: usize) -> T {
        self.chunks[i / CHUNK_LEN][i % CHUNK_LEN].expect("heap slot in bounds is occupied")
    }

    fn set(&mut self, i: usize, v: T) {
        self.chunks[i / CHUNK_LEN][i % CHUNK_LEN] = Some(v);
    }

    fn ensure_chunk_for(&mut self, i: usize) {
        let chunk_idx = i / CHUNK_LEN;
        while self.chunks.len() <= chunk_idx {
            self.chunks.push(Box::new([None; CHUNK_LEN]));
        }
    }

    /// Releases trailing chunks once at least two full chunks past the
    /// current length sit empty, so long-lived heaps that shrank back down
    /// don't keep their peak memory footprint forever.
    fn shrink_tail(&mut self) {
        let occupied_chunks = self.len.div_ceil(CHUNK_LEN).max(1);
        while self.chunks.len() >= occupied_chunks + 2 {
            self.chunks.pop();
        }
    }

    fn le(&self, a: T, b: T) -> bool {
        (self.compare)(&a, &b) != Ordering::Greater
    }

    fn swap(&mut self, i: usize, j: usize) {
        let a = self.get(i);
        let b = self.get(j);
        self.set(i, b);
        self.set(j, a);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.le(self.get(parent), self.get(i)) {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;

            if left < self.len && self.le(self.get(left), self.get(smallest)) {
                smallest = left;
            }
            if right < self.len && self.le(self.get(right), self.get(smallest)) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    /// Inserts `v`, restoring heap order.
    pub fn push(&mut self, v: T) {
        let i = self.len;
        self.ensure_chunk_for(i);
        self.set(i, v);
        self.len += 1;
        self.sift_up(i);
    }

    /// Returns the minimum element without removing it.
    pub fn min(&self) -> Option<T> {
        if self.len == 0 {
            None
        } else {
            Some(self.get(0))
        }
    }

    /// Removes and returns the minimum element.
    pub fn pop_min(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let root = self.get(0);
        let tail = self.len - 1;
        if tail > 0 {
            let last = self.get(tail);
            self.set(0, last);
        }
        self.chunks[tail / CHUNK_LEN][tail % CHUNK_LEN] = None;
        self.len = tail;
        if self.len > 0 {
            self.sift_down(0);
        }
        self.shrink_tail();
        Some(root)
    }

    /// Overwrites the root with `v` and restores heap order. Equivalent to
    /// `pop_min` followed by `push`, but avoids moving the tail element up
    /// only to immediately sift it back down.
    pub fn replace_min(&mut self, v: T) -> Option<T> {
        if self.len == 0 {
            self.push(v);
            return None;
        }
        let old = self.get(0);
        self.set(0, v);
        self.sift_down(0);
        Some(old)
    }

    /// Visits every element in heap (array) order, i.e. not sorted order.
    /// Stops early if `f` returns `false`.
    pub fn for_each(&self, mut f: impl FnMut(T) -> bool) {
        for i in 0..self.len {
            if !f(self.get(i)) {
                return;
            }
        }
    }

    /// Checks the heap-order invariant: every non-root element compares
    /// `>=` its parent under the comparator. Exposed for property tests.
    pub fn check_invariant(&self) -> bool {
        for i in 1..self.len {
            let parent = (i - 1) / 2;
            if !self.le(self.get(parent), self.get(i)) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq};

    fn int_heap() -> Heap<i64, impl Fn(&i64, &i64) -> Ordering> {
        Heap::new(|a: &i64, b: &i64| a.cmp(b))
    }

    #[test]
    fn empty_heap_has_no_min() {
        let h = int_heap();
        assert!(h.is_empty());
        assert_eq!(h.min(), None);
    }

    #[test]
    fn push_pop_sorts() {
        let mut h = int_heap();
        for v in [5, 1, 9, 3, 3, 7, -2] {
            h.push(v);
            assert!(h.check_invariant());
        }
        let mut out = Vec::new();
        while let Some(v) = h.pop_min() {
            assert!(h.check_invariant());
            out.push(v);
        }
        assert_eq!(out, vec![-2, 1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn replace_min_keeps_invariant() {
        let mut h = int_heap();
        for v in [10, 20, 5, 30] {
            h.push(v);
        }
        let old = h.replace_min(100);
        assert_eq!(old, Some(5));
        assert!(h.check_invariant());
        assert_eq!(h.min(), Some(10));
    }

    #[test]
    fn for_each_visits_every_element_once() {
        let mut h = int_heap();
        let input = [4, 8, 15, 16, 23, 42];
        for v in input {
            h.push(v);
        }
        let mut seen = Vec::new();
        h.for_each(|v| {
            seen.push(v);
            true
        });
        seen.sort();
        let mut expected = input.to_vec();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn for_each_stops_early() {
        let mut h = int_heap();
        for v in [1, 2, 3, 4, 5] {
            h.push(v);
        }
        let mut count = 0;
        h.for_each(|_| {
            count += 1;
            count < 2
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn shrinks_after_large_drain() {
        let mut h = int_heap();
        for v in 0..1000 {
            h.push(v);
        }
        let peak_chunks = h.chunks.len();
        for _ in 0..990 {
            h.pop_min();
        }
        assert!(h.chunks.len() < peak_chunks);
    }

    proptest::proptest! {
        #[test]
        fn heap_sort_matches_std_sort(mut values: Vec<i32>) {
            let mut h = Heap::new(|a: &i32, b: &i32| a.cmp(b));
            for &v in &values {
                h.push(v);
                prop_assert!(h.check_invariant());
            }
            let mut out = Vec::new();
            while let Some(v) = h.pop_min() {
                prop_assert!(h.check_invariant());
                out.push(v);
            }
            values.sort();
            prop_assert_eq!(out, values);
        }
    }
}
