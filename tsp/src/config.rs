//! Plain per-subsystem config records, mapped from CLI flags by `main`.
//! No dynamic "map of name to value" layer: each subsystem gets a record
//! with a fixed, enumerated set of options.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SpoolerConfig {
    pub tmp_dir: PathBuf,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub idle_timeout: Duration,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(7200),
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemProfConfig {
    pub poll_interval: Duration,
}

impl Default for MemProfConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Resolve `<tmp>` per the filesystem contract: `$TMPDIR`, else
/// `$PBS_JOBFS`, else `/tmp`.
pub fn resolve_tmp_dir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .or_else(|| std::env::var_os("PBS_JOBFS"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
