use std::path::PathBuf;

/// Plain configuration for a [`crate::keeper::Keeper`]. Built by the binary
/// crate's CLI layer; this crate never sees `clap` types.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub target_n_pages: usize,
    pub directories: Vec<PathBuf>,
    pub fillup_file: Option<PathBuf>,
    pub map_executable: bool,
    pub refresh_only_resident: bool,
    pub launch_rewarmer: bool,
    pub rt_sched_refresher: bool,
    pub rewarm_ring_capacity: usize,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        KeeperConfig {
            target_n_pages: 0,
            directories: Vec::new(),
            fillup_file: None,
            map_executable: false,
            refresh_only_resident: false,
            launch_rewarmer: false,
            rt_sched_refresher: false,
            rewarm_ring_capacity: 512,
        }
    }
}
