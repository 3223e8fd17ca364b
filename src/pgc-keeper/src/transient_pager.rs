//! Transient cold pagein generator.
//!
//! Cycles through a pool file touching a fixed-size batch of pages at a
//! target rate, producing page cache churn that competes with the resident
//! keeper's own working set. Shares only the mapping primitive and fault
//! shield with the keeper; otherwise a plain single-threaded periodic loop.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mmap::MappedFile;

const PAGEIN_BATCH_SIZE: usize = 32;

/// A mapped pool file plus the cursor and rate target the pager loop needs.
/// Built on the main thread, handed off to the pager thread by [`start`].
#[derive(Debug)]
pub struct TransientPager {
    map: MappedFile,
    n_pages: usize,
    page_size: usize,
    period: Duration,
    i_page: usize,
}

pub struct RunningTransientPager {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<TransientPager>,
}

impl TransientPager {
    /// Opens `pool_file` private-read (optionally execute), rounding up to a
    /// whole number of pages. `period` is the target interval between
    /// individual page touches; the loop sleeps once per batch of
    /// [`PAGEIN_BATCH_SIZE`] pages rather than once per page.
    pub fn open(
        pool_file: &Path,
        page_size: usize,
        period: Duration,
        map_executable: bool,
    ) -> io::Result<Self> {
        let file = File::open(pool_file)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pool file is not a regular file",
            ));
        }
        if meta.size() == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pool file is empty"));
        }

        let map = MappedFile::open(&file, meta.size(), page_size, map_executable)?;
        let n_pages = map.size() / page_size;
        Ok(TransientPager {
            map,
            n_pages,
            page_size,
            period,
            i_page: 0,
        })
    }

    /// Spawns the pager thread, taking ownership of `self` for the run's
    /// duration. Returns a handle to stop it and recover the mapping.
    pub fn start(self) -> RunningTransientPager {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("pgc-transient-pager".into())
            .spawn(move || pager_loop(self, thread_stop))
            .expect("spawn transient pager thread");
        RunningTransientPager { stop, handle }
    }
}

impl RunningTransientPager {
    pub fn stop(self) -> TransientPager {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().expect("transient pager thread panicked")
    }
}

fn pagein_batch(s: &mut TransientPager) {
    pgc_faultshield::guarded(|| {
        for _ in 0..PAGEIN_BATCH_SIZE {
            if s.i_page == s.n_pages {
                s.i_page = 0;
            }
            unsafe { s.map.touch_page(s.i_page, s.page_size) };
            s.i_page += 1;
        }
    });
}

fn pager_loop(mut s: TransientPager, stop: Arc<AtomicBool>) -> TransientPager {
    let target_period_us = (s.period.as_micros() as i64) * PAGEIN_BATCH_SIZE as i64;
    let mut acc_err_us: i64 = 0;
    let mut last = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        pagein_batch(&mut s);

        if acc_err_us >= 0 || -acc_err_us <= target_period_us {
            let sleep_us = target_period_us + acc_err_us;
            if sleep_us > 0 {
                std::thread::sleep(Duration::from_micros(sleep_us as u64));
            }
        }

        let now = Instant::now();
        let actual_us = now.duration_since(last).as_micros() as i64;
        last = now;
        acc_err_us += target_period_us - actual_us;
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_pool_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let err = TransientPager::open(f.path(), 4096, Duration::from_micros(100), false)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn opens_and_cycles_a_pool_file() {
        pgc_faultshield::install().unwrap();
        let page_size = 4096usize;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        f.write_all(&vec![7u8; page_size * 4]).unwrap();
        f.flush().unwrap();

        let mut pager =
            TransientPager::open(f.path(), page_size, Duration::from_micros(1), false).unwrap();
        assert_eq!(pager.n_pages, 4);
        pagein_batch(&mut pager);
        // A full batch of 32 touches wraps the 4-page file several times.
        assert!(pager.i_page < pager.n_pages);
    }
}
