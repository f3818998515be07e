//! Pretty-printers for the query side of the CLI: the plain job listing,
//! per-job detail view, and the GitHub-Markdown summariser.

use tsp_store::{JobCategory, JobDetails, Store};

fn state_of(job: &JobDetails) -> &'static str {
    match (job.stime, job.etime, job.exit_status) {
        (_, Some(_), Some(status)) if status != 0 => "failed",
        (_, Some(_), _) => "finished",
        (Some(_), None, _) => "running",
        (None, None, _) => "queued",
    }
}

fn fmt_micros(t: Option<i64>) -> String {
    match t {
        Some(us) => {
            let secs = us.div_euclid(1_000_000);
            let dt = chrono::DateTime::from_timestamp(secs, 0);
            dt.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        }
        None => "-".to_string(),
    }
}

pub fn print_listing(jobs: &[JobDetails]) {
    println!("{:>5} {:<10} {:<8} {:<20} {}", "ID", "STATE", "SLOTS", "QUEUED", "COMMAND");
    for job in jobs {
        println!(
            "{:>5} {:<10} {:<8} {:<20} {}",
            job.id,
            state_of(job),
            job.slots,
            fmt_micros(job.qtime),
            job.command,
        );
    }
}

pub fn print_details(job: &JobDetails) {
    println!("Job id:        {}", job.id);
    println!("Command:       {}", job.command);
    println!("State:         {}", state_of(job));
    println!("Category:      {}", job.category.as_deref().unwrap_or("-"));
    println!("Slots:         {}", job.slots);
    println!("Submitter pid: {}", job.pid);
    println!("Queued at:     {}", fmt_micros(job.qtime));
    println!("Started at:    {}", fmt_micros(job.stime));
    println!("Finished at:   {}", fmt_micros(job.etime));
    if let Some(status) = job.exit_status {
        println!("Exit status:   {status}");
    }
}

/// A GitHub-Flavored-Markdown table of every job, suitable for pasting into
/// a PR description or CI summary.
pub fn gh_summary(store: &Store) -> anyhow::Result<String> {
    let jobs = store.jobs_by_category(JobCategory::All)?;
    let mut out = String::new();
    out.push_str("| id | state | slots | queued | command |\n");
    out.push_str("|---|---|---|---|---|\n");
    for job in &jobs {
        out.push_str(&format!(
            "| {} | {} | {} | {} | `{}` |\n",
            job.id,
            state_of(job),
            job.slots,
            fmt_micros(job.qtime),
            job.command.replace('|', "\\|"),
        ));
    }
    Ok(out)
}

pub fn print_bytes(bytes: &[u8]) {
    use std::io::Write;
    let _ = std::io::stdout().write_all(bytes);
}
