//! Ranking used by the admission heap: which resident mapping is the best
//! eviction candidate when the working set needs to shrink.
//!
//! A mapping is "worse" (sorts first, i.e. towards the heap minimum) than
//! another when it is non-executable and the other is executable, or, with
//! that tied, when it holds fewer resident pages. Executable mappings are
//! kept around preferentially because losing their residency costs a
//! program a page fault on its own text, not just on data it reads.

use std::cmp::Ordering;

use generational_arena::Index;

/// Snapshot of the fields the comparator needs, copied out of a
/// [`crate::record::ResidentMapping`] at admission time. `n_pages` does not
/// change after a mapping is admitted, so the heap never needs to re-rank an
/// entry already inside it.
#[derive(Debug, Clone, Copy)]
pub struct HeapKey {
    pub index: Index,
    pub executable: bool,
    pub n_pages: usize,
}

pub fn worse_first(a: &HeapKey, b: &HeapKey) -> Ordering {
    worse(a.executable, a.n_pages, b.executable, b.n_pages)
}

/// The comparator in its raw form, for callers ranking a not-yet-admitted
/// candidate against the current heap minimum without an arena handle.
pub fn worse(a_executable: bool, a_n_pages: usize, b_executable: bool, b_n_pages: usize) -> Ordering {
    match (a_executable, b_executable) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => a_n_pages.cmp(&b_n_pages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn key(arena: &mut Arena<()>, executable: bool, n_pages: usize) -> HeapKey {
        HeapKey {
            index: arena.insert(()),
            executable,
            n_pages,
        }
    }

    #[test]
    fn executable_outranks_non_executable_regardless_of_size() {
        let mut arena = Arena::new();
        let small_exec = key(&mut arena, true, 1);
        let huge_data = key(&mut arena, false, 1_000_000);
        assert_eq!(worse_first(&huge_data, &small_exec), Ordering::Less);
        assert_eq!(worse_first(&small_exec, &huge_data), Ordering::Greater);
    }

    #[test]
    fn fewer_pages_is_worse_among_equally_executable() {
        let mut arena = Arena::new();
        let small = key(&mut arena, false, 3);
        let big = key(&mut arena, false, 30);
        assert_eq!(worse_first(&small, &big), Ordering::Less);
        assert_eq!(worse_first(&big, &small), Ordering::Greater);
        assert_eq!(worse_first(&small, &small), Ordering::Equal);
    }
}
