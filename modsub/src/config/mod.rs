//! Repository configuration and the deterministic naming scheme.
//!
//! Every file this subsystem touches is addressed through here: shared
//! segments under the shm root, event pipes under the repository root, and
//! the persisted per-module data files (whose content is owned by the
//! external file store, not this crate). The naming is part of the IPC
//! surface and must stay stable across versions.

use std::env;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Environment override for the shared-memory root.
pub const ENV_SHM_DIR: &str = "MODSUB_SHM_DIR";
/// Environment override for the repository root.
pub const ENV_REPO_DIR: &str = "MODSUB_REPO_DIR";
/// Environment override for the running datastore directory.
pub const ENV_RUNNING_DIR: &str = "MODSUB_RUNNING_DIR";
/// Environment override for the startup datastore directory.
pub const ENV_STARTUP_DIR: &str = "MODSUB_STARTUP_DIR";
/// Environment override for the stored-notification directory.
pub const ENV_NOTIF_DIR: &str = "MODSUB_NOTIF_DIR";

/// A distinguishable configuration store a config-change subscription
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Running,
    Startup,
    Operational,
}

impl Datastore {
    /// The datastore name as used in segment suffixes and file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Datastore::Running => "running",
            Datastore::Startup => "startup",
            Datastore::Operational => "operational",
        }
    }
}

/// Root directories for every file category, with optional per-category
/// overrides for the persisted data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub shm_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub running_dir: Option<PathBuf>,
    pub startup_dir: Option<PathBuf>,
    pub notif_dir: Option<PathBuf>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            shm_dir: PathBuf::from("/dev/shm"),
            repo_dir: PathBuf::from("/etc/modsub"),
            running_dir: None,
            startup_dir: None,
            notif_dir: None,
        }
    }
}

impl RepoConfig {
    /// Default configuration with any `MODSUB_*` environment overrides
    /// applied.
    pub fn from_env() -> Self {
        let mut cfg = RepoConfig::default();
        if let Some(dir) = env::var_os(ENV_SHM_DIR) {
            cfg.shm_dir = dir.into();
        }
        if let Some(dir) = env::var_os(ENV_REPO_DIR) {
            cfg.repo_dir = dir.into();
        }
        cfg.running_dir = env::var_os(ENV_RUNNING_DIR).map(Into::into);
        cfg.startup_dir = env::var_os(ENV_STARTUP_DIR).map(Into::into);
        cfg.notif_dir = env::var_os(ENV_NOTIF_DIR).map(Into::into);
        cfg
    }

    /// Path of the shared segment for `module` and a kind suffix, with an
    /// optional per-path discriminator:
    /// `<shm_dir>/sr_<module>.<suffix>[.<8-hex-digit-discriminator>]`.
    pub fn sub_shm_path(&self, module: &str, suffix: &str, discriminator: Option<u32>) -> PathBuf {
        let name = match discriminator {
            Some(hash) => format!("sr_{module}.{suffix}.{hash:08x}"),
            None => format!("sr_{module}.{suffix}"),
        };
        self.shm_dir.join(name)
    }

    /// Path of an event pipe: `<repo_dir>/sr_evpipe<N>`.
    pub fn evpipe_path(&self, evpipe_num: u32) -> PathBuf {
        self.repo_dir.join(format!("sr_evpipe{evpipe_num}"))
    }

    /// Directory holding running datastore files.
    pub fn running_dir(&self) -> PathBuf {
        match &self.running_dir {
            Some(dir) => dir.clone(),
            None => self.repo_dir.join("data"),
        }
    }

    /// Directory holding startup datastore files.
    pub fn startup_dir(&self) -> PathBuf {
        match &self.startup_dir {
            Some(dir) => dir.clone(),
            None => self.repo_dir.join("data"),
        }
    }

    /// Directory holding stored notifications.
    pub fn notif_dir(&self) -> PathBuf {
        match &self.notif_dir {
            Some(dir) => dir.clone(),
            None => self.repo_dir.join("data").join("notif"),
        }
    }

    /// Persisted running data file for a module.
    pub fn running_file(&self, module: &str) -> PathBuf {
        self.running_dir().join(format!("{module}.running"))
    }

    /// Persisted startup data file for a module.
    pub fn startup_file(&self, module: &str) -> PathBuf {
        self.startup_dir().join(format!("{module}.startup"))
    }

    /// Stored notification file for a module covering `[from_ts, to_ts]`.
    pub fn notif_file(&self, module: &str, from_ts: i64, to_ts: i64) -> PathBuf {
        self.notif_dir().join(format!("{module}.notif.{from_ts}-{to_ts}"))
    }
}

/// Bob Jenkins's one-at-a-time hash, no seed. Used as the per-path segment
/// discriminator; the value is part of the on-disk naming and must stay
/// bit-for-bit stable.
pub fn str_hash(s: &str) -> u32 {
    let mut hash: u32 = 0;
    for &b in s.as_bytes() {
        hash = hash.wrapping_add(u32::from(b));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

/// Module name of the first node of an absolute path expression, e.g.
/// `"/mod:container/leaf"` yields `Some("mod")`. `None` when the expression
/// does not start with a prefixed node.
pub fn first_node_module(expr: &str) -> Option<&str> {
    let rest = expr.strip_prefix("//").or_else(|| expr.strip_prefix('/'))?;
    let bytes = rest.as_bytes();
    let first = *bytes.first()?;
    if !first.is_ascii_alphabetic() && first != b'_' {
        return None;
    }
    let mut i = 1;
    while i < bytes.len()
        && (bytes[i].is_ascii_alphanumeric()
            || bytes[i] == b'_'
            || bytes[i] == b'-'
            || bytes[i] == b'.')
    {
        i += 1;
    }
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    Some(&rest[..i])
}

/// Check effective access to a module's persisted data. The startup file
/// stands in for the module: every datastore file of a module carries the
/// same ownership and mode.
pub fn perm_check(cfg: &RepoConfig, module: &str, write: bool) -> Result<()> {
    let path = cfg.startup_file(module);
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Internal(format!("NUL byte in path {}", path.display())))?;

    let mode = if write { libc::W_OK } else { libc::R_OK };
    let ret = unsafe { libc::faccessat(libc::AT_FDCWD, cpath.as_ptr(), mode, libc::AT_EACCESS) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EACCES) {
        Err(Error::PermissionDenied { module: module.to_string(), write })
    } else {
        Err(err.into())
    }
}
