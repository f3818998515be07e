//! Flag surface. `tsp` is invoked either as a query (`-l`, `-i`, `-o`, ...)
//! or as a submission (`tsp [flags] -- command args...`); with no arguments
//! at all it behaves as `--list`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tsp")]
#[command(version, about = "A serverless, topology-aware task spooler", long_about = None)]
pub struct Cli {
    /// The command to submit, e.g. `tsp -- sleep 10`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Discard the job's stdout/stderr instead of storing them.
    #[arg(short = 'n')]
    pub discard_output: bool,

    /// Do not detach: block in the foreground until the job finishes.
    #[arg(short = 'f')]
    pub no_detach: bool,

    /// Number of physical cores to request.
    #[arg(short = 'N', default_value_t = 1)]
    pub slots: u32,

    /// Capture stderr into a separate file instead of merging with stdout.
    #[arg(short = 'E')]
    pub separate_stderr: bool,

    /// Attach a free-form category label to the job.
    #[arg(short = 'L', long = "label")]
    pub category: Option<String>,

    /// Verbose: log admission and binding decisions as they happen.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Rerun a previously submitted job by its external id.
    #[arg(short = 'r', long = "rerun")]
    pub rerun: Option<i64>,

    /// List all jobs. Default action when no other flag or command is given.
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    #[arg(long = "list-failed")]
    pub list_failed: bool,

    #[arg(long = "list-queued")]
    pub list_queued: bool,

    #[arg(long = "list-running")]
    pub list_running: bool,

    #[arg(long = "list-finished")]
    pub list_finished: bool,

    /// Show full details for a job (defaults to the most recent job).
    #[arg(short = 'i', long = "info", num_args = 0..=1, default_missing_value = "last")]
    pub info: Option<String>,

    /// Print a job's captured stdout.
    #[arg(short = 'o', long = "stdout", num_args = 0..=1, default_missing_value = "last")]
    pub show_stdout: Option<String>,

    /// Print a job's captured stderr.
    #[arg(short = 'e', long = "stderr", num_args = 0..=1, default_missing_value = "last")]
    pub show_stderr: Option<String>,

    #[arg(long = "print-queue-time", num_args = 0..=1, default_missing_value = "last")]
    pub print_queue_time: Option<String>,

    #[arg(long = "print-run-time", num_args = 0..=1, default_missing_value = "last")]
    pub print_run_time: Option<String>,

    #[arg(long = "print-total-time", num_args = 0..=1, default_missing_value = "last")]
    pub print_total_time: Option<String>,

    /// Override the database location instead of `$TMPDIR/tsp_db.sqlite3`.
    #[arg(long = "db-path")]
    pub db_path: Option<PathBuf>,

    /// Emit a GitHub-Markdown table summarising recent jobs instead of the
    /// plain-text listing.
    #[arg(long = "gh-summary")]
    pub gh_summary: bool,

    /// Sample the worker's peak resident memory while the job runs
    /// (requires `-f`; has no effect on a detached submission).
    #[arg(long = "memprof")]
    pub memprof: bool,

    /// Kill the job if it sits idle (never starts) or overruns a budget
    /// (requires `-f`).
    #[arg(long = "watchdog")]
    pub watchdog: bool,

    #[arg(long = "idle-timeout", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    #[arg(long = "job-timeout", default_value_t = 7200)]
    pub job_timeout_secs: u64,

    #[arg(long = "watchdog-interval", default_value_t = 10)]
    pub watchdog_interval_secs: u64,
}

impl Cli {
    /// Whether this invocation needs a writable store (submission or
    /// rerun) as opposed to a pure query.
    pub fn wants_write(&self) -> bool {
        !self.command.is_empty() || self.rerun.is_some()
    }

    /// Parse one of the `-i`/`-o`/`-e`/`--print-*` optional-id arguments:
    /// either an explicit job id, or the sentinel `"last"` meaning "use the
    /// most recently submitted job".
    pub fn parse_job_ref(raw: &str) -> JobRef {
        if raw == "last" {
            JobRef::Last
        } else {
            match raw.parse() {
                Ok(id) => JobRef::Id(id),
                Err(_) => JobRef::Last,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum JobRef {
    Id(i64),
    Last,
}
