//! Victim page eviction-latency checker.
//!
//! Maps a single page, touches it, then busy-polls the residency probe until
//! the page falls out of the cache, reporting how long that took. Meant to
//! run concurrently with a resident keeper and transient pager that are
//! competing for the same memory.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::mmap::MappedFile;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("victim file I/O failed")]
    Io(#[from] io::Error),
    #[error("touching the victim page faulted")]
    Faulted,
    #[error("residency probe failed")]
    ProbeFailed,
}

#[derive(Debug)]
pub struct VictimChecker {
    map: MappedFile,
    page_size: usize,
    mincore_buf: [u8; 1],
}

impl VictimChecker {
    pub fn open(victim_file: &Path, page_size: usize, map_executable: bool) -> Result<Self, Error> {
        let file = File::open(victim_file)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "victim file is not a regular file",
            )));
        }
        if meta.size() == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "victim file is empty",
            )));
        }

        let map = MappedFile::open(&file, page_size as u64, page_size, map_executable)?;
        Ok(VictimChecker {
            map,
            page_size,
            mincore_buf: [0u8],
        })
    }

    /// Touches the victim page, then blocks until the host evicts it,
    /// returning the elapsed wall time. Busy-polls `mincore(2)` rather than
    /// sleeping: the measurement is only meaningful at whatever granularity
    /// the host actually reclaims at, and a sleep would only add slop.
    pub fn measure_one(&mut self) -> Result<Duration, Error> {
        let touched = pgc_faultshield::guarded(|| unsafe { self.map.touch_page(0, self.page_size) });
        if touched.is_none() {
            return Err(Error::Faulted);
        }

        let start = Instant::now();
        loop {
            let mut resident = None;
            self.map
                .probe_residency(0, 1, self.page_size, &mut self.mincore_buf, |_, result| {
                    resident = Some(result.map(|buf| buf[0] & 0x01 != 0));
                });
            match resident {
                Some(Ok(true)) => continue,
                Some(Ok(false)) => return Ok(start.elapsed()),
                _ => return Err(Error::ProbeFailed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_victim_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let err = VictimChecker::open(f.path(), 4096, false).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn opens_a_real_file() {
        let page_size = 4096usize;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        f.write_all(&vec![3u8; page_size]).unwrap();
        f.flush().unwrap();

        pgc_faultshield::install().unwrap();
        let checker = VictimChecker::open(f.path(), page_size, false);
        assert!(checker.is_ok());
    }
}
