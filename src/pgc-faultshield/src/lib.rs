//! Nonlocal return out of a memory access that SIGBUS/SIGSEGV-faults because
//! the underlying mapped file region became inaccessible (truncated,
//! unreadable block, I/O error on the backing store).
//!
//! Every thread that touches mapped-file memory arms the shield with
//! [`guarded`] around exactly one page access. If the host delivers a fault
//! while armed, control resumes at the `guarded` call and `None` comes back
//! instead of the closure's result; the caller's job is then to mark
//! whatever it was touching dead and move on. Outside an armed region the
//! same signal is fatal, matching the process-wide handler installed by
//! [`install`].

use std::sync::OnceLock;

mod ffi {
    extern "C" {
        pub fn pgc_fault_shield_install_handler() -> i32;
        pub fn pgc_fault_shield_arm() -> i32;
        pub fn pgc_fault_shield_disarm();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to install fault handler")]
    Install(#[source] std::io::Error),
}

static HANDLER: OnceLock<Result<(), ()>> = OnceLock::new();

/// Installs the process-wide SIGBUS/SIGSEGV handler. Idempotent and safe to
/// call from every thread that's about to use [`guarded`] — only the first
/// call does anything.
pub fn install() -> Result<(), Error> {
    let outcome = HANDLER.get_or_init(|| {
        let r = unsafe { ffi::pgc_fault_shield_install_handler() };
        if r == 0 {
            Ok(())
        } else {
            Err(())
        }
    });
    outcome.map_err(|_| Error::Install(std::io::Error::last_os_error()))
}

/// Runs `f` with the fault shield armed for the current thread.
///
/// `f` may touch any number of pages of a single mapping — a fault partway
/// through abandons the rest of `f` via nonlocal return, so `f` must not
/// allocate, lock, or otherwise acquire a resource that skipping its
/// remainder would leak. Callers arm once per mapping, not once per page, so
/// that a single dead mapping costs one signal instead of one per page.
///
/// Returns `None` if a fault interrupted `f`; the underlying mapping should
/// be treated as permanently dead.
#[inline]
pub fn guarded<R>(f: impl FnOnce() -> R) -> Option<R> {
    let faulted = unsafe { ffi::pgc_fault_shield_arm() } != 0;
    if faulted {
        return None;
    }
    let r = f();
    unsafe { ffi::pgc_fault_shield_disarm() };
    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_runs_closure_when_nothing_faults() {
        install().expect("handler install");
        let result = guarded(|| 2 + 2);
        assert_eq!(result, Some(4));
    }
}
