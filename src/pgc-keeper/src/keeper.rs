//! The resident keeper: scans candidate files, ranks them, keeps a target
//! number of their pages warm in the page cache, and cyclically re-touches
//! them from a dedicated thread.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use generational_arena::{Arena, Index};
use tracing::{debug, info};

use pgc_heap::Heap;
use pgc_rbtree::OrderedMap;

use crate::comparator::{worse, worse_first, HeapKey};
use crate::config::KeeperConfig;
use crate::error::{Error, Result};
use crate::identity::MappingId;
use crate::mmap::MappedFile;
use crate::record::{ResidentMapping, ResidentRange};
use crate::rewarm::{PageAddr, RewarmRing};
use crate::walk::walk_dir;

/// Pages queried per `mincore(2)` call during a refresh, per spec: larger
/// batches leave the residency snapshot more stale by the time it's acted
/// on.
const REFRESH_MINCORE_BATCH_PAGES: usize = 128;
const STATUS_INTERVAL: Duration = Duration::from_millis(500);

type MappingHeap = Heap<HeapKey, fn(&HeapKey, &HeapKey) -> std::cmp::Ordering>;

/// Everything the refresher thread needs to own once it starts running.
/// Held by [`Keeper`] before `start`, moved into the refresher thread for
/// the duration of the run, and handed back on `stop` so the caller can
/// unmap everything on a single thread.
struct Core {
    arena: Arena<ResidentMapping>,
    heap: MappingHeap,
    fillup: Option<ResidentMapping>,
    fillup_id: Option<MappingId>,
    mincore_buf: Vec<u8>,
    page_size: usize,
    target_n_pages: usize,
    refresh_only_resident: bool,
}

pub struct Keeper {
    id_map: OrderedMap<MappingId, Index>,
    core: Core,
    n_pages: usize,
    n_pages_executable: usize,
    config: KeeperConfig,
    page_size: usize,
}

/// A keeper with its refresher (and optional rewarmer) thread running.
/// Dropping `core` fields after [`RunningKeeper::stop`] hands ownership back
/// unmaps every mapping via `MappedFile`'s own `Drop`; there is no separate
/// teardown step to remember to call.
pub struct RunningKeeper {
    active_n_pages: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    rewarm: Option<Arc<RewarmRing>>,
    refresher: JoinHandle<Core>,
    rewarmer: Option<JoinHandle<()>>,
    id_map: OrderedMap<MappingId, Index>,
    n_pages: usize,
    n_pages_executable: usize,
    config: KeeperConfig,
    page_size: usize,
}

/// Scan-time totals. Frozen once the directory scan and any fillup file are
/// in place; neither field changes once the refresher is running (a
/// mapping's contribution to `n_pages` is not revised if it later faults —
/// only its own `dead` flag changes, matching the upstream tool's own
/// bookkeeping).
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub n_pages: usize,
    pub n_pages_executable: usize,
}

impl Keeper {
    pub fn new(config: &KeeperConfig) -> Result<Self> {
        let page_size = page_size()?;
        Ok(Keeper {
            id_map: OrderedMap::new(),
            core: Core {
                arena: Arena::new(),
                heap: Heap::new(worse_first),
                fillup: None,
                fillup_id: None,
                mincore_buf: vec![0u8; REFRESH_MINCORE_BATCH_PAGES],
                page_size,
                target_n_pages: config.target_n_pages,
                refresh_only_resident: config.refresh_only_resident,
            },
            n_pages: 0,
            n_pages_executable: 0,
            config: config.clone(),
            page_size,
        })
    }

    pub fn stats(&self) -> Stats {
        Stats {
            n_pages: self.n_pages,
            n_pages_executable: self.n_pages_executable,
        }
    }

    /// Recursively scans `path` for regular, non-empty files and admits the
    /// best `target_n_pages` worth of them into the working set.
    pub fn scan_directory(&mut self, path: &Path) -> Result<()> {
        let page_size = self.page_size;
        let map_executable = self.config.map_executable;
        walk_dir(path, |entry| {
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => return,
            };
            if !meta.is_file() || meta.len() == 0 {
                return;
            }
            let id = MappingId::from_metadata(&meta);
            if self.id_map.get(&id).is_some() || self.core.fillup_id == Some(id) {
                return;
            }
            let file = match File::open(entry.path()) {
                Ok(f) => f,
                Err(_) => return,
            };
            let map = match MappedFile::open(&file, meta.len(), page_size, map_executable) {
                Ok(m) => m,
                Err(_) => return,
            };
            let mut mapping = ResidentMapping::new(id, map);
            find_resident_ranges(&mut mapping, &mut self.core.mincore_buf, page_size);
            if mapping.n_pages == 0 {
                return;
            }
            self.admit(mapping);
        })
        .map_err(|source| Error::Host {
            what: "directory walk",
            source,
        })
    }

    fn admit(&mut self, mapping: ResidentMapping) {
        if let Some(worst) = self.core.heap.min() {
            if self.n_pages >= self.core.target_n_pages
                && worse(mapping.executable(), mapping.n_pages, worst.executable, worst.n_pages)
                    != std::cmp::Ordering::Greater
            {
                // Not better than the current worst admitted mapping;
                // `mapping` drops here, unmapping it.
                return;
            }
        }

        let executable = mapping.executable();
        let n_pages = mapping.n_pages;
        let id = mapping.id;
        let index = self.core.arena.insert(mapping);
        self.id_map.insert(id, index);
        self.core.heap.push(HeapKey {
            index,
            executable,
            n_pages,
        });
        self.n_pages += n_pages;
        if executable {
            self.n_pages_executable += n_pages;
        }

        self.evict_down_to_target();
    }

    fn evict_down_to_target(&mut self) {
        while let Some(worst) = self.core.heap.min() {
            if self.n_pages.saturating_sub(worst.n_pages) < self.core.target_n_pages {
                break;
            }
            self.core.heap.pop_min();
            if let Some(mapping) = self.core.arena.remove(worst.index) {
                self.n_pages -= mapping.n_pages;
                if mapping.executable() {
                    self.n_pages_executable -= mapping.n_pages;
                }
                self.id_map.remove(&mapping.id);
                // `mapping` drops here, unmapping it.
            }
        }
    }

    /// Registers a single file whose entire span is treated as one
    /// always-resident range, used to pad toward target when directory
    /// scans alone fall short.
    pub fn set_fillup_file(&mut self, path: &Path) -> Result<()> {
        if self.core.fillup.is_some() {
            return Err(Error::Config("fillup file already set".into()));
        }
        let file = File::open(path).map_err(|source| Error::FillupFile {
            path: path.to_path_buf(),
            source,
        })?;
        let meta = file.metadata().map_err(|source| Error::FillupFile {
            path: path.to_path_buf(),
            source,
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(Error::Config(format!(
                "fillup file {} is not a non-empty regular file",
                path.display()
            )));
        }
        let id = MappingId::from_metadata(&meta);
        if self.id_map.get(&id).is_some() {
            return Err(Error::Config(
                "fillup file is already part of the scanned set".into(),
            ));
        }
        let map = MappedFile::open(&file, meta.len(), self.page_size, self.config.map_executable)
            .map_err(|source| Error::FillupFile {
                path: path.to_path_buf(),
                source,
            })?;
        let mut mapping = ResidentMapping::new(id, map);
        let n_pages = mapping.map.size() / self.page_size;
        mapping.ranges.push(ResidentRange {
            offset: 0,
            n_pages,
        });
        mapping.n_pages = n_pages;
        self.core.fillup_id = Some(id);
        self.core.fillup = Some(mapping);
        Ok(())
    }

    /// Touches pages of admitted mappings, in heap storage order, until
    /// `active_n_pages` reaches target or every candidate has been visited.
    /// Must run before [`Keeper::start`]; nothing else may mutate mapping
    /// state concurrently with warmup.
    pub fn warmup(&mut self, active_n_pages: &AtomicUsize) {
        let start = Instant::now();
        let target = self.core.target_n_pages;
        let page_size = self.core.page_size;
        let mut warmed = 0usize;

        let arena = &mut self.core.arena;
        self.core.heap.for_each(|key| {
            if warmed >= target {
                return false;
            }
            if let Some(mapping) = arena.get_mut(key.index) {
                warm_one(mapping, target - warmed, page_size, &mut warmed, active_n_pages);
            }
            warmed < target
        });

        if warmed < target {
            if let Some(mapping) = self.core.fillup.as_mut() {
                warm_one(mapping, target - warmed, page_size, &mut warmed, active_n_pages);
            }
        }

        info!(duration_ms = start.elapsed().as_millis() as u64, warmed, "resident keeper warmup complete");
    }

    /// Spawns the refresher thread (and, if configured, the rewarmer
    /// thread) and begins the refresh cycle. Consumes `self`; call
    /// [`RunningKeeper::stop`] to get a [`Keeper`] back for teardown.
    pub fn start(self, active_n_pages: Arc<AtomicUsize>) -> RunningKeeper {
        let stop = Arc::new(AtomicBool::new(false));
        let rewarm = if self.config.launch_rewarmer {
            Some(RewarmRing::new(self.config.rewarm_ring_capacity))
        } else {
            None
        };

        let rewarmer = rewarm.clone().map(|ring| {
            std::thread::Builder::new()
                .name("pgc-rewarmer".into())
                .spawn(move || rewarmer_loop(ring))
                .expect("spawn rewarmer thread")
        });

        let refresher_active = Arc::clone(&active_n_pages);
        let refresher_stop = Arc::clone(&stop);
        let refresher_rewarm = rewarm.clone();
        let rt_sched = self.config.rt_sched_refresher;
        let core = self.core;

        let refresher = std::thread::Builder::new()
            .name("pgc-refresher".into())
            .spawn(move || {
                if rt_sched {
                    apply_realtime_scheduling();
                }
                refresh_loop(core, refresher_active, refresher_stop, refresher_rewarm)
            })
            .expect("spawn refresher thread");

        RunningKeeper {
            active_n_pages,
            stop,
            rewarm,
            refresher,
            rewarmer,
            id_map: self.id_map,
            n_pages: self.n_pages,
            n_pages_executable: self.n_pages_executable,
            config: self.config,
            page_size: self.page_size,
        }
    }
}

impl RunningKeeper {
    pub fn active_n_pages(&self) -> usize {
        self.active_n_pages.load(Ordering::Acquire)
    }

    /// Requests shutdown and blocks until both workers have joined,
    /// returning a [`Keeper`] whose fields, once dropped, unmap everything.
    pub fn stop(self) -> Keeper {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(ring) = &self.rewarm {
            ring.signal_quit();
        }
        if let Some(handle) = self.rewarmer {
            let _ = handle.join();
        }
        let core = self.refresher.join().expect("refresher thread panicked");

        Keeper {
            id_map: self.id_map,
            n_pages: self.n_pages,
            n_pages_executable: self.n_pages_executable,
            config: self.config,
            page_size: self.page_size,
            core,
        }
    }
}

/// The host's page size in bytes, via `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> Result<usize> {
    let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if rc <= 0 {
        return Err(Error::Host {
            what: "sysconf(_SC_PAGESIZE)",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(rc as usize)
}

fn find_resident_ranges(mapping: &mut ResidentMapping, buf: &mut Vec<u8>, page_size: usize) {
    let size = mapping.map.size();
    if size == 0 {
        return;
    }
    let total_pages = size / page_size;
    let mut n_pages = 0usize;
    let mut in_range = false;
    let mut range_begin_page = 0usize;

    mapping
        .map
        .probe_residency(0, total_pages, page_size, buf, |start_page, result| {
            let bytes: &[u8] = match result {
                Ok(b) => b,
                Err(()) => return,
            };
            for (i, &b) in bytes.iter().enumerate() {
                let page = start_page + i;
                let resident = b & 0x01 != 0;
                if resident && !in_range {
                    in_range = true;
                    range_begin_page = page;
                } else if !resident && in_range {
                    in_range = false;
                    let n = page - range_begin_page;
                    mapping.ranges.push(ResidentRange {
                        offset: range_begin_page * page_size,
                        n_pages: n,
                    });
                    n_pages += n;
                }
            }
        });

    if in_range {
        let n = total_pages - range_begin_page;
        mapping.ranges.push(ResidentRange {
            offset: range_begin_page * page_size,
            n_pages: n,
        });
        n_pages += n;
    }

    mapping.n_pages = n_pages;
}

fn warm_one(
    mapping: &mut ResidentMapping,
    budget: usize,
    page_size: usize,
    warmed: &mut usize,
    active_n_pages: &AtomicUsize,
) {
    let n_pages = mapping.n_pages.min(budget);
    if n_pages == 0 {
        return;
    }

    let map = &mapping.map;
    let faulted = pgc_faultshield::guarded(|| {
        let mut touched = 0usize;
        'ranges: for range in mapping.ranges.iter() {
            for i in 0..range.n_pages {
                if touched == n_pages {
                    break 'ranges;
                }
                unsafe { map.touch_page((range.offset / page_size) + i, page_size) };
                touched += 1;
                *warmed += 1;
                active_n_pages.store(*warmed, Ordering::Release);
            }
        }
    });

    if faulted.is_none() {
        debug!(dev = mapping.id.dev, ino = mapping.id.ino, "mapping faulted during warmup");
        mapping.dead = true;
        mapping.n_pages = 0;
    }
}

fn refresh_loop(
    mut core: Core,
    active_n_pages: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    rewarm: Option<Arc<RewarmRing>>,
) -> Core {
    let mut n_acc = 0u64;
    let mut acc_duration = Duration::ZERO;
    let mut acc_n_pages_found_resident = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let cycle_start = Instant::now();
        let active = active_n_pages.load(Ordering::Acquire);
        let mut i_page = 0usize;
        let mut n_pages_found_resident = 0usize;

        let arena = &mut core.arena;
        let page_size = core.page_size;
        let refresh_only_resident = core.refresh_only_resident;
        let mincore_buf = &mut core.mincore_buf;
        let rewarm_ref = rewarm.as_deref();

        core.heap.for_each(|key| {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            let budget = active.saturating_sub(i_page).min(
                arena.get(key.index).map(|m| m.n_pages).unwrap_or(0),
            );
            i_page += budget;

            if let Some(mapping) = arena.get_mut(key.index) {
                if !mapping.dead {
                    let found = refresh_mapping(
                        mapping,
                        budget,
                        page_size,
                        mincore_buf,
                        refresh_only_resident,
                        rewarm_ref,
                    );
                    n_pages_found_resident += found;
                }
            }

            i_page < active
        });

        if let Some(fillup) = core.fillup.as_mut() {
            if i_page < active && !fillup.dead {
                let budget = active - i_page;
                n_pages_found_resident += refresh_mapping(
                    fillup,
                    budget,
                    core.page_size,
                    &mut core.mincore_buf,
                    core.refresh_only_resident,
                    rewarm.as_deref(),
                );
            }
        }

        n_acc += 1;
        acc_duration += cycle_start.elapsed();
        acc_n_pages_found_resident += n_pages_found_resident as u64;

        if acc_duration >= STATUS_INTERVAL {
            let avg_duration_ms = acc_duration.as_millis() as u64 / n_acc.max(1);
            let avg_resident = acc_n_pages_found_resident / n_acc.max(1);
            if let Ok(snapshot) = pgc_meminfo::read(core.page_size as u64) {
                info!(
                    cycle_ms = avg_duration_ms,
                    pool_pages = active,
                    resident_pages = avg_resident,
                    mem_free_pages = snapshot.mem_free_pages,
                    active_file_pages = snapshot.active_file_pages,
                    inactive_file_pages = snapshot.inactive_file_pages,
                    "resident keeper refresh cycle"
                );
            } else {
                info!(cycle_ms = avg_duration_ms, pool_pages = active, resident_pages = avg_resident, "resident keeper refresh cycle");
            }
            n_acc = 0;
            acc_duration = Duration::ZERO;
            acc_n_pages_found_resident = 0;
        }
    }

    core
}

fn refresh_mapping(
    mapping: &mut ResidentMapping,
    mut n_pages: usize,
    page_size: usize,
    mincore_buf: &mut [u8],
    refresh_only_resident: bool,
    rewarm: Option<&RewarmRing>,
) -> usize {
    let mut found_resident = 0usize;
    let map_ptr = mapping.map.base() as usize;

    let faulted = pgc_faultshield::guarded(|| {
        for range in mapping.ranges.iter() {
            if n_pages == 0 {
                break;
            }
            let this_range = range.n_pages.min(n_pages);
            n_pages -= this_range;
            found_resident += refresh_range(
                &mapping.map,
                range.offset,
                this_range,
                page_size,
                mincore_buf,
                refresh_only_resident,
                rewarm,
                map_ptr,
            );
        }
    });

    if faulted.is_none() {
        debug!(dev = mapping.id.dev, ino = mapping.id.ino, "mapping faulted during refresh");
        mapping.dead = true;
    }

    found_resident
}

#[allow(clippy::too_many_arguments)]
fn refresh_range(
    map: &MappedFile,
    range_offset: usize,
    n_pages: usize,
    page_size: usize,
    mincore_buf: &mut [u8],
    refresh_only_resident: bool,
    rewarm: Option<&RewarmRing>,
    map_base: usize,
) -> usize {
    let mut found_resident = 0usize;
    let mut done = 0usize;
    // Fixed-size: `guarded` forbids allocating inside the shielded region
    // (a fault unwinds past this frame without running destructors), and
    // `batch` never exceeds REFRESH_MINCORE_BATCH_PAGES.
    let mut rewarm_batch: [PageAddr; REFRESH_MINCORE_BATCH_PAGES] = [0; REFRESH_MINCORE_BATCH_PAGES];
    let mut rewarm_len = 0usize;

    while done < n_pages {
        let batch = (n_pages - done).min(REFRESH_MINCORE_BATCH_PAGES);
        let mut probed = false;
        rewarm_len = 0;

        map.probe_residency(
            range_offset + done * page_size,
            batch,
            page_size,
            mincore_buf,
            |_, result| {
                probed = result.is_ok();
                if let Ok(bytes) = result {
                    for (i, &b) in bytes.iter().enumerate() {
                        let page_index = (range_offset / page_size) + done + i;
                        let resident = b & 0x01 != 0;
                        if refresh_only_resident {
                            if resident {
                                unsafe { map.touch_page(page_index, page_size) };
                                found_resident += 1;
                            } else {
                                rewarm_batch[rewarm_len] = map_base + page_index * page_size;
                                rewarm_len += 1;
                            }
                        } else {
                            unsafe { map.touch_page(page_index, page_size) };
                            if resident {
                                found_resident += 1;
                            }
                        }
                    }
                }
            },
        );

        if refresh_only_resident && !probed {
            // Host residency-probe failure: treat the batch as nothing
            // resident, matching default-mode handling.
            for i in 0..batch {
                let page_index = (range_offset / page_size) + done + i;
                unsafe { map.touch_page(page_index, page_size) };
            }
        }

        if rewarm_len > 0 {
            if let Some(ring) = rewarm {
                ring.offer(&rewarm_batch[..rewarm_len]);
            }
        }

        done += batch;
    }

    found_resident
}

fn rewarmer_loop(ring: Arc<RewarmRing>) {
    pgc_faultshield::install().ok();
    while let Some(addr) = ring.wait_take() {
        pgc_faultshield::guarded(|| unsafe {
            std::ptr::read_volatile(addr as *const u8);
        });
    }
}

fn apply_realtime_scheduling() {
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if priority < 0 {
            return;
        }
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::pthread_setschedparam(
            libc::pthread_self(),
            libc::SCHED_FIFO,
            &param as *const libc::sched_param,
        );
        if rc != 0 {
            tracing::warn!(errno = rc, "failed to apply real-time scheduling to refresher thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapped_mapping(n_pages: usize, page_size: usize) -> ResidentMapping {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![1u8; n_pages * page_size]).unwrap();
        f.flush().unwrap();
        let file = f.reopen().unwrap();
        let size = file.metadata().unwrap().len();
        let map = MappedFile::open(&file, size, page_size, false).unwrap();
        let id = MappingId::from_metadata(&file.metadata().unwrap());
        let mut mapping = ResidentMapping::new(id, map);
        mapping.ranges.push(ResidentRange { offset: 0, n_pages });
        mapping.n_pages = n_pages;
        mapping
    }

    fn test_keeper(target_n_pages: usize) -> Keeper {
        let config = KeeperConfig {
            target_n_pages,
            ..KeeperConfig::default()
        };
        Keeper::new(&config).unwrap()
    }

    #[test]
    fn evicts_smallest_non_executable_mapping_first() {
        let page_size = page_size().unwrap();
        let mut keeper = test_keeper(3);

        keeper.admit(mapped_mapping(1, page_size));
        keeper.admit(mapped_mapping(2, page_size));
        assert_eq!(keeper.n_pages, 3);

        keeper.admit(mapped_mapping(4, page_size));
        assert_eq!(keeper.n_pages, 4);
        assert_eq!(keeper.id_map.len(), 1);
    }

    #[test]
    fn discards_candidate_no_better_than_current_worst_once_at_target() {
        let page_size = page_size().unwrap();
        let mut keeper = test_keeper(2);

        keeper.admit(mapped_mapping(2, page_size));
        assert_eq!(keeper.n_pages, 2);

        keeper.admit(mapped_mapping(1, page_size));
        assert_eq!(keeper.n_pages, 2);
        assert_eq!(keeper.id_map.len(), 1);
    }

    #[test]
    fn fillup_file_pads_a_single_full_span_range() {
        let page_size = page_size().unwrap();
        let mut keeper = test_keeper(10);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![9u8; page_size * 3]).unwrap();
        f.flush().unwrap();

        keeper.set_fillup_file(f.path()).unwrap();
        let fillup = keeper.core.fillup.as_ref().unwrap();
        assert_eq!(fillup.n_pages, 3);
        assert_eq!(fillup.ranges.len(), 1);
        assert_eq!(
            fillup.ranges[0],
            ResidentRange {
                offset: 0,
                n_pages: 3
            }
        );
    }

    #[test]
    fn set_fillup_file_rejects_a_second_call() {
        let page_size = page_size().unwrap();
        let mut keeper = test_keeper(10);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![9u8; page_size]).unwrap();
        f.flush().unwrap();

        keeper.set_fillup_file(f.path()).unwrap();
        assert!(keeper.set_fillup_file(f.path()).is_err());
    }

    #[test]
    fn warmup_stops_at_target_and_publishes_active_n_pages() {
        pgc_faultshield::install().unwrap();
        let page_size = page_size().unwrap();
        let mut keeper = test_keeper(3);
        keeper.admit(mapped_mapping(5, page_size));

        let active = AtomicUsize::new(0);
        keeper.warmup(&active);

        assert_eq!(active.load(Ordering::Acquire), 3);
    }
}
