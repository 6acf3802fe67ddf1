//! Heavier scenario tests exercising the registry, the segments, and both
//! event protocols end to end within one process.

mod end_to_end;

use std::path::Path;
use std::sync::Arc;

use crate::config::RepoConfig;
use crate::registry::{MemoryDirectory, SubscriptionHandle};

/// Config rooted inside a test-owned temporary directory.
pub(crate) fn test_cfg(tmp: &Path) -> RepoConfig {
    let cfg = RepoConfig {
        shm_dir: tmp.join("shm"),
        repo_dir: tmp.join("repo"),
        running_dir: None,
        startup_dir: None,
        notif_dir: None,
    };
    std::fs::create_dir_all(&cfg.shm_dir).unwrap();
    std::fs::create_dir_all(&cfg.repo_dir).unwrap();
    cfg
}

pub(crate) fn test_handle(
    cfg: &RepoConfig,
    dir: &Arc<MemoryDirectory>,
    evpipe_num: u32,
) -> SubscriptionHandle {
    SubscriptionHandle::new(cfg.clone(), Arc::<MemoryDirectory>::clone(dir), evpipe_num).unwrap()
}
