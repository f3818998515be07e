//! Discovers the physical CPU core ids the current process is permitted to
//! use, and pins the process to a specific subset of them.
//!
//! The discovery path restricts itself to the cgroup the process belongs to
//! (`/proc/self/cgroup` + the matching `cpuset.cpus`/`cpuset.cpus.effective`
//! file) rather than the full machine topology, since that cgroup is the
//! ceiling TSP's slot pool must respect on a shared node.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cpuset range {0:?}")]
    Parse(String),
    #[error("no cpuset controller found for this process")]
    NoCpuset,
    #[error("failed to bind CPU affinity: {0}")]
    Affinity(String),
    #[error("requested {requested} slots but only {available} cores are available")]
    InsufficientCores { requested: u32, available: u32 },
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// Parse a cpuset-style range list: `"0-2,5,7-8" -> [0,1,2,5,7,8]`.
///
/// Empty input yields an empty set. Ranges are inclusive on both ends.
/// Output is a sorted, deduplicated, ordered set of core ids.
pub fn parse_cpu_range(spec: &str) -> TopologyResult<Vec<u32>> {
    let spec = spec.trim();
    let mut cores = BTreeSet::new();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    for segment in spec.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| TopologyError::Parse(spec.to_string()))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| TopologyError::Parse(spec.to_string()))?;
                if lo > hi {
                    return Err(TopologyError::Parse(spec.to_string()));
                }
                cores.extend(lo..=hi);
            }
            None => {
                let core: u32 = segment
                    .parse()
                    .map_err(|_| TopologyError::Parse(spec.to_string()))?;
                cores.insert(core);
            }
        }
    }
    Ok(cores.into_iter().collect())
}

/// One line of `/proc/self/cgroup`: `hierarchy-id:controllers:path`.
struct CgroupLine {
    controllers: String,
    path: String,
}

fn parse_cgroup_lines(contents: &str) -> Vec<CgroupLine> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ':');
            let _hierarchy = fields.next()?;
            let controllers = fields.next()?.to_string();
            let path = fields.next()?.to_string();
            Some(CgroupLine { controllers, path })
        })
        .collect()
}

/// Candidate `cpuset.cpus`/`cpuset.cpus.effective` paths for this process,
/// most specific first, given the roots where `/proc` and `/sys/fs/cgroup`
/// are mounted (parameterized for testability).
fn candidate_cpuset_paths(proc_root: &Path, sys_cgroup_root: &Path) -> TopologyResult<Vec<PathBuf>> {
    let cgroup_file = proc_root.join("self/cgroup");
    let contents = fs::read_to_string(&cgroup_file).map_err(|source| TopologyError::Io {
        path: cgroup_file,
        source,
    })?;

    let mut candidates = Vec::new();
    for line in parse_cgroup_lines(&contents) {
        if line.controllers == "cpuset" {
            // cgroup v1: /sys/fs/cgroup/cpuset/<path>/cpuset.cpus
            candidates.push(
                sys_cgroup_root
                    .join("cpuset")
                    .join(line.path.trim_start_matches('/'))
                    .join("cpuset.cpus"),
            );
        } else if line.controllers.is_empty() {
            // cgroup v2 unified hierarchy:
            // /sys/fs/cgroup/<path>/cpuset.cpus.effective
            candidates.push(
                sys_cgroup_root
                    .join(line.path.trim_start_matches('/'))
                    .join("cpuset.cpus.effective"),
            );
        }
    }
    // Last-resort fallback regardless of what /proc/self/cgroup said.
    candidates.push(sys_cgroup_root.join("cpuset/cpuset.cpus"));
    Ok(candidates)
}

fn discover_cores_under(proc_root: &Path, sys_cgroup_root: &Path) -> TopologyResult<Vec<u32>> {
    let candidates = candidate_cpuset_paths(proc_root, sys_cgroup_root)?;
    for path in &candidates {
        if let Ok(contents) = fs::read_to_string(path) {
            let cores = parse_cpu_range(&contents)?;
            tracing::debug!(?path, ?cores, "discovered cpuset");
            return Ok(cores);
        }
    }
    Err(TopologyError::NoCpuset)
}

/// Discover the set of core ids this process may occupy, reading the real
/// `/proc` and `/sys/fs/cgroup`.
pub fn discover_cores() -> TopologyResult<Vec<u32>> {
    discover_cores_under(Path::new("/proc"), Path::new("/sys/fs/cgroup"))
}

/// Set the calling process's CPU affinity mask to exactly `cores`, for
/// every thread of the process (not just the calling one).
///
/// On failure, returns a human-readable error; threads already rebound
/// before the failing one keep their new mask; TSP always treats an
/// `Affinity` error as fatal for the job so this partial-application case
/// never becomes user-visible as a silently mis-pinned job.
pub fn bind(cores: &[u32]) -> TopologyResult<()> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { libc::CPU_ZERO(&mut set) };
    for &core in cores {
        unsafe { libc::CPU_SET(core as usize, &mut set) };
    }

    for tid in process_thread_ids()? {
        let rc = unsafe {
            libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            return Err(TopologyError::Affinity(format!(
                "sched_setaffinity(tid={tid}) failed: {errno}"
            )));
        }
    }
    tracing::debug!(?cores, "bound process to cores");
    Ok(())
}

fn process_thread_ids() -> TopologyResult<Vec<libc::pid_t>> {
    let task_dir = Path::new("/proc/self/task");
    let entries = fs::read_dir(task_dir).map_err(|source| TopologyError::Io {
        path: task_dir.to_path_buf(),
        source,
    })?;
    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TopologyError::Io {
            path: task_dir.to_path_buf(),
            source,
        })?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_mixed_ranges() {
        assert_eq!(parse_cpu_range("0-2,5,7-8").unwrap(), vec![0, 1, 2, 5, 7, 8]);
        assert_eq!(parse_cpu_range("3").unwrap(), vec![3]);
        assert_eq!(parse_cpu_range("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn dedupes_and_sorts() {
        assert_eq!(parse_cpu_range("3,1-2,2").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(parse_cpu_range("a-2").is_err());
        assert!(parse_cpu_range("2-a").is_err());
        assert!(parse_cpu_range("5-2").is_err());
    }

    #[test]
    fn discovers_v2_unified_cpuset() {
        let proc_root = tempdir().unwrap();
        let sys_root = tempdir().unwrap();

        fs::create_dir_all(proc_root.path().join("self")).unwrap();
        fs::write(proc_root.path().join("self/cgroup"), "0::/user.slice/job-1\n").unwrap();

        let cpuset_dir = sys_root.path().join("user.slice/job-1");
        fs::create_dir_all(&cpuset_dir).unwrap();
        fs::write(cpuset_dir.join("cpuset.cpus.effective"), "0-3\n").unwrap();

        let cores = discover_cores_under(proc_root.path(), sys_root.path()).unwrap();
        assert_eq!(cores, vec![0, 1, 2, 3]);
    }

    #[test]
    fn discovers_v1_cpuset() {
        let proc_root = tempdir().unwrap();
        let sys_root = tempdir().unwrap();

        fs::create_dir_all(proc_root.path().join("self")).unwrap();
        fs::write(
            proc_root.path().join("self/cgroup"),
            "4:cpuset:/slurm/job_42\n7:memory:/slurm/job_42\n",
        )
        .unwrap();

        let cpuset_dir = sys_root.path().join("cpuset/slurm/job_42");
        fs::create_dir_all(&cpuset_dir).unwrap();
        fs::write(cpuset_dir.join("cpuset.cpus"), "2,4-6\n").unwrap();

        let cores = discover_cores_under(proc_root.path(), sys_root.path()).unwrap();
        assert_eq!(cores, vec![2, 4, 5, 6]);
    }

    #[test]
    fn falls_back_when_no_controller_entry_readable() {
        let proc_root = tempdir().unwrap();
        let sys_root = tempdir().unwrap();

        fs::create_dir_all(proc_root.path().join("self")).unwrap();
        fs::write(proc_root.path().join("self/cgroup"), "4:cpuset:/missing\n").unwrap();
        fs::create_dir_all(sys_root.path().join("cpuset")).unwrap();
        fs::write(sys_root.path().join("cpuset/cpuset.cpus"), "0-1\n").unwrap();

        let cores = discover_cores_under(proc_root.path(), sys_root.path()).unwrap();
        assert_eq!(cores, vec![0, 1]);
    }
}
