//! Filesystem-object identity used to deduplicate candidates reached via
//! different paths (hard links, repeated directory roots).

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId {
    pub dev: u64,
    pub ino: u64,
}

impl MappingId {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        MappingId {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}
