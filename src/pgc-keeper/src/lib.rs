//! Resident keeper and its auxiliary collaborators: the transient pager,
//! victim checker, and anonymous memory hogger. The meminfo reporter itself
//! lives in the separate `pgc-meminfo` crate since the resident keeper's own
//! refresh loop consults it too.

pub mod comparator;
pub mod config;
pub mod error;
pub mod hog;
pub mod identity;
pub mod keeper;
pub mod mmap;
pub mod record;
pub mod rewarm;
pub mod transient_pager;
pub mod victim;
pub mod walk;

pub use config::KeeperConfig;
pub use error::{Error, Result};
pub use keeper::{page_size, Keeper, RunningKeeper, Stats};
