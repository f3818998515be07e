//! `tsp` - a serverless, topology-aware task spooler for shared HPC nodes.
//!
//! Independent invocations cooperate through a single shared SQLite database
//! plus an advisory file lock; there is no daemon and no process to start up
//! ahead of time. This binary is the external collaborator named throughout
//! the core crates: it owns argument parsing, dispatch, help text, the
//! stored-output pretty-printers, the GitHub-Markdown summariser, and the
//! optional memory-sampling/watchdog sidecars.

mod cli;
mod config;
mod output;
mod sidecar;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use cli::{Cli, JobRef};
use config::{MemProfConfig, SpoolerConfig, WatchdogConfig};
use tsp_store::{JobCategory, Store};
use tsp_supervisor::{Command, SubmitRequest, Supervisor};

fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();
    init_logging(cli.verbose);

    let code = run(cli)?;
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Dispatch `cli` and return the process exit code: the user command's exit
/// status on a successful foreground submission, 0 for a detached submission
/// or a successful query, non-zero for internal failure.
fn run(cli: Cli) -> Result<i32> {
    let tmp_dir = config::resolve_tmp_dir();
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| tmp_dir.join("tsp_db.sqlite3"));
    let config = SpoolerConfig { tmp_dir, db_path };

    if cli.wants_write() {
        submit_or_rerun(cli, config)
    } else {
        query(cli, config).map(|()| 0)
    }
}

fn submit_or_rerun(cli: Cli, config: SpoolerConfig) -> Result<i32> {
    let SpoolerConfig { tmp_dir, db_path } = config;
    let command = if let Some(job_id) = cli.rerun {
        Command::Rerun { job_id }
    } else {
        if cli.command.is_empty() {
            bail!("no command given to submit (pass one after `--`, or use -r to rerun)");
        }
        Command::Fresh {
            argv: cli.command.clone(),
        }
    };

    let detach = !cli.no_detach;
    let req = SubmitRequest {
        command,
        slots: cli.slots,
        discard_output: cli.discard_output,
        detach,
        separate_stderr: cli.separate_stderr,
        category: cli.category.clone(),
        verbose: cli.verbose,
    };

    let wants_sidecars = !detach && (cli.memprof || cli.watchdog);
    if (cli.memprof || cli.watchdog) && detach {
        tracing::warn!("--memprof/--watchdog have no effect on a detached submission; pass -f");
    }

    if !wants_sidecars {
        let store = Store::open(&db_path, true, false).with_context(|| format!("opening {db_path:?}"))?;
        let sup = Supervisor::new(&store, tmp_dir);
        let job_id = sup.submit(req)?;
        return Ok(exit_code_for(&store, job_id, detach));
    }

    // Sidecars need the external job id before the foreground submission
    // returns (it only returns once the job has finished). Snapshot the
    // last-known id on a throwaway read-only handle, run the submission on
    // its own thread (rusqlite's `Connection` is `!Sync`, so the write
    // `Store` stays owned by that one thread), and poll a second read-only
    // handle for a newly assigned id to hand to the sidecars.
    let poll_store =
        Store::open(&db_path, false, true).with_context(|| format!("opening {db_path:?}"))?;
    let before = poll_store.last_job_id()?;

    let submit_db_path = db_path.clone();
    let submit_tmp_dir = tmp_dir.clone();
    let submit_handle = std::thread::spawn(move || -> Result<i64> {
        let store = Store::open(&submit_db_path, true, false)
            .with_context(|| format!("opening {submit_db_path:?}"))?;
        let sup = Supervisor::new(&store, submit_tmp_dir);
        Ok(sup.submit(req)?)
    });

    let job_id = loop {
        if submit_handle.is_finished() {
            break None;
        }
        if let Ok(Some(last)) = poll_store.last_job_id() {
            if Some(last) != before {
                break Some(last);
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut sidecar_handles = Vec::new();
    if let Some(job_id) = job_id {
        if cli.memprof {
            sidecar_handles.push(sidecar::spawn_memprof(
                db_path.clone(),
                job_id,
                MemProfConfig::default(),
                Arc::clone(&stop),
            ));
        }
        if cli.watchdog {
            let cfg = WatchdogConfig {
                idle_timeout: std::time::Duration::from_secs(cli.idle_timeout_secs),
                job_timeout: std::time::Duration::from_secs(cli.job_timeout_secs),
                poll_interval: std::time::Duration::from_secs(cli.watchdog_interval_secs),
            };
            sidecar_handles.push(sidecar::spawn_watchdog(
                db_path.clone(),
                job_id,
                cfg,
                Arc::clone(&stop),
            ));
        }
    }

    let job_id = submit_handle
        .join()
        .map_err(|_| anyhow::anyhow!("submission thread panicked"))??;
    stop.store(true, Ordering::SeqCst);
    for handle in sidecar_handles {
        let _ = handle.join();
    }

    Ok(exit_code_for(&poll_store, job_id, detach))
}

/// For a detached submission the spooler's own exit status reports whether
/// submission itself succeeded, not the eventual result of the job. For a
/// foreground submission it mirrors the user command's recorded exit status.
fn exit_code_for(store: &Store, job_id: i64, detach: bool) -> i32 {
    println!("{job_id}");
    if detach {
        return 0;
    }
    match store.job_details_by_id(job_id) {
        Ok(Some(details)) => details.exit_status.unwrap_or(-1),
        _ => -1,
    }
}

fn query(cli: Cli, config: SpoolerConfig) -> Result<()> {
    let store = Store::open(&config.db_path, false, true)
        .with_context(|| format!("opening {:?}", config.db_path))?;

    if cli.gh_summary {
        print!("{}", output::gh_summary(&store)?);
        return Ok(());
    }
    if let Some(raw) = &cli.info {
        return print_info(&store, raw);
    }
    if let Some(raw) = &cli.show_stdout {
        return print_output(&store, raw, true);
    }
    if let Some(raw) = &cli.show_stderr {
        return print_output(&store, raw, false);
    }
    if let Some(raw) = &cli.print_queue_time {
        return print_duration(&store, raw, DurationKind::Queue);
    }
    if let Some(raw) = &cli.print_run_time {
        return print_duration(&store, raw, DurationKind::Run);
    }
    if let Some(raw) = &cli.print_total_time {
        return print_duration(&store, raw, DurationKind::Total);
    }

    let category = if cli.list_failed {
        JobCategory::Failed
    } else if cli.list_queued {
        JobCategory::Queued
    } else if cli.list_running {
        JobCategory::Running
    } else if cli.list_finished {
        JobCategory::Finished
    } else {
        JobCategory::All
    };
    output::print_listing(&store.jobs_by_category(category)?);
    Ok(())
}

fn resolve_id(store: &Store, raw: &str) -> Result<i64> {
    match Cli::parse_job_ref(raw) {
        JobRef::Id(id) => Ok(id),
        JobRef::Last => store
            .last_job_id()?
            .context("no jobs have been submitted yet"),
    }
}

fn print_info(store: &Store, raw: &str) -> Result<()> {
    let id = resolve_id(store, raw)?;
    let details = store
        .job_details_by_id(id)?
        .with_context(|| format!("no such job {id}"))?;
    output::print_details(&details);
    Ok(())
}

fn print_output(store: &Store, raw: &str, stdout: bool) -> Result<()> {
    let id = resolve_id(store, raw)?;
    let bytes = if stdout {
        store.stdout_by_id(id)?
    } else {
        store.stderr_by_id(id)?
    };
    output::print_bytes(&bytes.with_context(|| format!("job {id} has no captured output yet"))?);
    Ok(())
}

#[derive(Clone, Copy)]
enum DurationKind {
    Queue,
    Run,
    Total,
}

fn print_duration(store: &Store, raw: &str, kind: DurationKind) -> Result<()> {
    let id = resolve_id(store, raw)?;
    let details = store
        .job_details_by_id(id)?
        .with_context(|| format!("no such job {id}"))?;

    let micros = match kind {
        DurationKind::Queue => match (details.qtime, details.stime) {
            (Some(q), Some(s)) => Some(s - q),
            _ => None,
        },
        DurationKind::Run => match (details.stime, details.etime) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        },
        DurationKind::Total => match (details.qtime, details.etime) {
            (Some(q), Some(e)) => Some(e - q),
            _ => None,
        },
    };

    match micros {
        Some(us) => println!("{:.3}", us as f64 / 1_000_000.0),
        None => println!("-"),
    }
    Ok(())
}
