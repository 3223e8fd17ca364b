//! Anonymous memory hogger: a one-shot non-reclaimable memory block that
//! competes with the resident keeper's page-cache-backed pool.
//!
//! Unlike every other component in this crate this isn't a periodic loop or
//! a worker thread; it is allocated once on the main thread before anything
//! else starts competing for memory, and released at teardown.

use std::io;
use std::ptr::NonNull;

use rand::Rng;

pub struct Hog {
    base: NonNull<u8>,
    size: usize,
}

unsafe impl Send for Hog {}

impl Hog {
    /// Anonymously maps `size` bytes (rounded up to a whole number of pages)
    /// and writes a few non-zero words into the start of every page, so the
    /// kernel must back each with a real anonymous page rather than sharing
    /// the zero page copy-on-write.
    pub fn allocate(size: usize, page_size: usize) -> io::Result<Self> {
        let size = crate::mmap::round_up(size, page_size);
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "hog size is zero"));
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let hog = Hog {
            base: NonNull::new(addr as *mut u8).expect("mmap returned non-null on success"),
            size,
        };
        hog.fill(page_size);
        Ok(hog)
    }

    fn fill(&self, page_size: usize) {
        let mut rng = rand::thread_rng();
        let mut offset = 0;
        while offset < self.size {
            let word0: u32 = rng.gen();
            let word1: u32 = rng.gen();
            let ptr = unsafe { self.base.as_ptr().add(offset) } as *mut u32;
            unsafe {
                std::ptr::write_volatile(ptr, word0);
                std::ptr::write_volatile(ptr.add(1), word1);
            }
            offset += page_size;
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Hog {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_size() {
        assert!(Hog::allocate(0, 4096).is_err());
    }

    #[test]
    fn rounds_up_to_page_multiple_and_fills_every_page() {
        let page_size = 4096usize;
        let hog = Hog::allocate(page_size + 1, page_size).unwrap();
        assert_eq!(hog.size(), page_size * 2);

        let second_page_word = unsafe { std::ptr::read(hog.base.as_ptr().add(page_size) as *const u32) };
        assert_ne!(second_page_word, 0);
    }
}
