//! Iterative (non-recursive) directory walk, mirroring the original tool's
//! explicit directory stack rather than relying on call-stack recursion,
//! which would bound scan depth by the thread's stack size.

use std::fs::{self, DirEntry, ReadDir};
use std::io;
use std::path::Path;

pub struct Walk {
    stack: Vec<ReadDir>,
}

impl Walk {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let first = fs::read_dir(root.as_ref())?;
        Ok(Walk { stack: vec![first] })
    }
}

impl Iterator for Walk {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                None => {
                    self.stack.pop();
                }
                Some(Err(_)) => {
                    // Unreadable entry: skip, keep walking the rest of the
                    // directory.
                    continue;
                }
                Some(Ok(entry)) => {
                    let file_type = match entry.file_type() {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if file_type.is_dir() {
                        if let Ok(sub) = fs::read_dir(entry.path()) {
                            self.stack.push(sub);
                        }
                    }
                    return Some(entry);
                }
            }
        }
    }
}

/// Recursively visits every directory entry under `root`, calling `f` with
/// each. Returns an error only if `root` itself cannot be opened; failures
/// on individual entries are skipped by [`Walk`] itself.
pub fn walk_dir(root: &Path, mut f: impl FnMut(&DirEntry)) -> io::Result<()> {
    for entry in Walk::new(root)? {
        f(&entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn visits_nested_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let mut seen = BTreeSet::new();
        walk_dir(dir.path(), |entry| {
            seen.insert(entry.file_name().to_string_lossy().into_owned());
        })
        .unwrap();

        assert!(seen.contains("a.txt"));
        assert!(seen.contains("b.txt"));
        assert!(seen.contains("sub"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Walk::new(dir.path().join("does-not-exist")).is_err());
    }
}
