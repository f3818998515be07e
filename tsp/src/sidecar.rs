//! Optional collaborators that watch a submitted job from the outside:
//! a memory-sampling thread and an idle/runtime watchdog. Neither touches
//! Store's write path directly; both only read job_details and, for the
//! watchdog, send a signal to the worker's own pid (which the worker's
//! installed handlers already know how to translate into a clean shutdown).

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tsp_store::JobDetails;

use crate::config::{MemProfConfig, WatchdogConfig};

/// Parse `VmRSS:` out of `/proc/<pid>/status`, in kilobytes.
fn read_vm_rss_kb(pid: i32) -> Option<u64> {
    let contents = fs::read_to_string(PathBuf::from(format!("/proc/{pid}/status"))).ok()?;
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        rest.trim().split_whitespace().next()?.parse().ok()
    })
}

fn job_finished(job: &Option<JobDetails>) -> bool {
    matches!(job, Some(j) if j.etime.is_some())
}

/// Sample the worker process's RSS until its job records ETime, then print
/// the observed peak. Runs on a dedicated thread with its own read-only
/// database handle (rusqlite's `Connection` is not `Sync`, so sidecars never
/// share a `Store` with the submitting thread); the caller joins it after
/// the foreground submission returns.
pub fn spawn_memprof(
    db_path: PathBuf,
    job_id: i64,
    cfg: MemProfConfig,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let Ok(store) = tsp_store::Store::open(&db_path, false, true) else {
            return;
        };
        let mut peak_kb: u64 = 0;
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if let Ok(Some(job)) = store.job_details_by_id(job_id) {
                if let Some(rss) = read_vm_rss_kb(job.pid) {
                    peak_kb = peak_kb.max(rss);
                }
                if job_finished(&Some(job)) {
                    break;
                }
            }
            std::thread::sleep(cfg.poll_interval);
        }
        if peak_kb > 0 {
            eprintln!("tsp: job {job_id} peak resident memory: {peak_kb} KiB");
        }
    })
}

/// Kill the job's worker if it never starts within `idle_timeout` of being
/// queued, or if it runs longer than `job_timeout` once started.
pub fn spawn_watchdog(
    db_path: PathBuf,
    job_id: i64,
    cfg: WatchdogConfig,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let Ok(store) = tsp_store::Store::open(&db_path, false, true) else {
            return;
        };
        loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(cfg.poll_interval);

        let Ok(Some(job)) = store.job_details_by_id(job_id) else {
            continue;
        };
        if job.etime.is_some() {
            break;
        }

        let now = tsp_store::now_micros();
        let idle_for = job.qtime.map(|q| now - q).unwrap_or(0);
        let idle_budget_us = cfg.idle_timeout.as_micros() as i64;
        let run_budget_us = cfg.job_timeout.as_micros() as i64;

        let overrun = match job.stime {
            None => idle_for > idle_budget_us,
            Some(s) => (now - s) > run_budget_us,
        };

        if overrun {
            unsafe {
                libc::kill(job.pid, libc::SIGTERM);
            }
            eprintln!("tsp: watchdog sent SIGTERM to job {job_id} (pid {})", job.pid);
            break;
        }
        }
    })
}
