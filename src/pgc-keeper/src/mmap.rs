//! File-backed private mapping, residency probing, and page touches.
//!
//! The mapping side of this mirrors `MappedFile` from this codebase's own
//! mmap helper crate: a raw base pointer owned by one struct, `Send`/`Sync`
//! asserted by hand because the kernel — not Rust's aliasing rules — is the
//! actual owner of what the pages underneath that pointer contain.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use nix::errno::Errno;

/// Maximum pages queried by a single `mincore(2)` call, per spec: larger
/// batches make the residency snapshot progressively staler as the scan
/// walks across it.
pub const MINCORE_BATCH_PAGES: usize = 128;

#[derive(Debug)]
pub struct MappedFile {
    base: NonNull<u8>,
    size: usize,
    executable: bool,
}

unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Maps `file` (whose size is `file_size` bytes) private-read, rounding
    /// up to a whole number of pages. Tries execute permission first when
    /// `want_exec` is set and falls back to plain read-only if the kernel
    /// denies `PROT_EXEC` (e.g. a `noexec` mount).
    pub fn open(file: &File, file_size: u64, page_size: usize, want_exec: bool) -> io::Result<Self> {
        let size = round_up(file_size as usize, page_size);
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty file"));
        }

        let fd = file.as_raw_fd();
        let mut executable = false;
        let mut addr = libc::MAP_FAILED;

        if want_exec {
            addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_EXEC,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                )
            };
            if addr != libc::MAP_FAILED {
                executable = true;
            } else if Errno::last() != Errno::EACCES && Errno::last() != Errno::EPERM {
                return Err(io::Error::last_os_error());
            }
        }

        if addr == libc::MAP_FAILED {
            addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
        }

        // Suppress read-ahead into currently-non-resident holes and exclude
        // from core dumps: the mapping exists only to probe/influence the
        // page cache, its contents are never meaningfully inspected.
        let advise_rc =
            unsafe { libc::madvise(addr, size, libc::MADV_RANDOM | libc::MADV_DONTDUMP) };
        if advise_rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(addr, size) };
            return Err(err);
        }

        Ok(MappedFile {
            base: NonNull::new(addr as *mut u8).expect("mmap returned non-null on success"),
            size,
            executable,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn executable(&self) -> bool {
        self.executable
    }

    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Queries residency for `[offset, offset + n_pages*page_size)` into
    /// `buf` (one byte per page, bit 0 = resident), batching internally at
    /// [`MINCORE_BATCH_PAGES`] pages. `buf` must be at least
    /// `min(n_pages, MINCORE_BATCH_PAGES)` bytes; this function calls `f`
    /// once per batch with the slice of freshly filled residency bytes and
    /// the page index the batch starts at.
    pub fn probe_residency(
        &self,
        offset: usize,
        n_pages: usize,
        page_size: usize,
        buf: &mut [u8],
        mut f: impl FnMut(usize, Result<&[u8], ()>),
    ) {
        let batch_pages = buf.len().min(MINCORE_BATCH_PAGES).max(1);
        let mut done = 0;
        while done < n_pages {
            let this_batch = batch_pages.min(n_pages - done);
            let addr = unsafe { self.base.as_ptr().add(offset + done * page_size) };
            let rc = unsafe {
                libc::mincore(
                    addr as *mut libc::c_void,
                    this_batch * page_size,
                    buf.as_mut_ptr(),
                )
            };
            if rc == 0 {
                f(done, Ok(&buf[..this_batch]));
            } else {
                // Host residency-probe failure: treated as "nothing resident
                // in this batch" by callers, per spec error handling design.
                f(done, Err(()));
            }
            done += this_batch;
        }
    }

    /// A single volatile load of the first byte of page `page_index`,
    /// sufficient to mark the page as recently accessed without depending
    /// on its contents. Must be called inside [`pgc_faultshield::guarded`].
    ///
    /// # Safety
    /// `page_index * page_size` must lie within `[0, self.size)`.
    #[inline]
    pub unsafe fn touch_page(&self, page_index: usize, page_size: usize) {
        let ptr = self.base.as_ptr().add(page_index * page_size);
        std::ptr::read_volatile(ptr);
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

pub fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_rounds_to_page_multiple() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn open_and_touch_a_real_file() {
        let page_size = 4096usize;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        f.write_all(&vec![1u8; page_size * 3]).unwrap();
        f.flush().unwrap();

        let file = f.reopen().unwrap();
        let size = file.metadata().unwrap().len();
        let mapped = MappedFile::open(&file, size, page_size, false).unwrap();
        assert_eq!(mapped.size(), page_size * 3);
        assert!(!mapped.executable());

        pgc_faultshield::install().unwrap();
        let touched = pgc_faultshield::guarded(|| unsafe { mapped.touch_page(0, page_size) });
        assert!(touched.is_some());
    }
}
