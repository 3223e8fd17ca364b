//! The resident mapping record and its range list.

use smallvec::SmallVec;

use crate::identity::MappingId;
use crate::mmap::MappedFile;

/// A maximal contiguous run of resident pages found at scan time, as a
/// page-aligned byte window `[offset, offset + n_pages*page_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentRange {
    pub offset: usize,
    pub n_pages: usize,
}

/// Most files contribute a single contiguous resident range; `SmallVec`
/// keeps that common case inline and only spills to the heap for files with
/// a fragmented cache footprint.
pub type ResidentRanges = SmallVec<[ResidentRange; 1]>;

pub struct ResidentMapping {
    pub id: MappingId,
    pub map: MappedFile,
    pub ranges: ResidentRanges,
    pub n_pages: usize,
    pub dead: bool,
}

impl ResidentMapping {
    pub fn new(id: MappingId, map: MappedFile) -> Self {
        ResidentMapping {
            id,
            map,
            ranges: SmallVec::new(),
            n_pages: 0,
            dead: false,
        }
    }

    pub fn executable(&self) -> bool {
        self.map.executable()
    }

    #[cfg(debug_assertions)]
    pub fn check_invariants(&self, page_size: usize) -> bool {
        if self.map.size() % page_size != 0 {
            return false;
        }
        let sum: usize = self.ranges.iter().map(|r| r.n_pages).sum();
        if sum != self.n_pages {
            return false;
        }
        self.ranges
            .iter()
            .all(|r| r.offset + r.n_pages * page_size <= self.map.size())
    }
}
