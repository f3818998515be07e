//! Runs the user's command: admits it, binds it to cores, execs it, reaps
//! it, and records the outcome. This is the one component that owns a
//! second process — everything upstream of `setpgid` is single-threaded,
//! synchronous code; no async runtime belongs anywhere near `fork`/`waitpid`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use thiserror::Error;
use tsp_admission::{AdmissionError, Outcome};
use tsp_lock::{Lock, LockError};
use tsp_store::{Store, StoreError};
use tsp_topology::TopologyError;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("codec error: {0}")]
    Codec(#[from] tsp_codec::CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("os error: {0}")]
    Nix(#[from] nix::errno::Errno),
    #[error("the referenced job {0} has no recorded start state to rerun from")]
    NoRerunState(i64),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Signals whose default action would kill the process and so must be
/// intercepted. Before admission they mark `time_to_die`; after the exec
/// fork they are forwarded to the whole process group instead.
const FORWARDED_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGHUP, libc::SIGTERM];

/// The only two pieces of mutable process-global state in this crate.
static TIME_TO_DIE: AtomicBool = AtomicBool::new(false);
static SEEN_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn mark_time_to_die(sig: libc::c_int) {
    SEEN_SIGNAL.store(sig, Ordering::SeqCst);
    TIME_TO_DIE.store(true, Ordering::SeqCst);
}

extern "C" fn forward_to_process_group(sig: libc::c_int) {
    SEEN_SIGNAL.store(sig, Ordering::SeqCst);
    unsafe {
        libc::kill(0, sig);
    }
}

fn install_pre_fork_handlers() {
    for &sig in &FORWARDED_SIGNALS {
        unsafe {
            libc::signal(sig, mark_time_to_die as usize);
        }
    }
}

fn install_post_fork_handlers() {
    for &sig in &FORWARDED_SIGNALS {
        unsafe {
            libc::signal(sig, forward_to_process_group as usize);
        }
    }
}

/// A command to submit: either a fresh argv, or a reference to a prior job
/// whose argv, cwd and environment should be restored faithfully.
pub enum Command {
    Fresh { argv: Vec<String> },
    Rerun { job_id: i64 },
}

pub struct SubmitRequest {
    pub command: Command,
    pub slots: u32,
    pub discard_output: bool,
    pub detach: bool,
    pub separate_stderr: bool,
    pub category: Option<String>,
    pub verbose: bool,
}

/// Outcome of the pre-exec admission/bind/state-write sequence.
enum Prepared {
    Ready(Vec<u32>),
    CancelledBeforeAdmission,
}

pub struct Supervisor<'s> {
    store: &'s Store,
    tmp_dir: PathBuf,
}

impl<'s> Supervisor<'s> {
    pub fn new(store: &'s Store, tmp_dir: PathBuf) -> Self {
        Self { store, tmp_dir }
    }

    /// Submit `req`. When `detach` is set, this process forks; the parent
    /// returns the externally visible job id immediately (read back over a
    /// pipe from the child) without waiting for the command to finish. The
    /// child becomes the worker and never returns to its caller.
    pub fn submit(&self, req: SubmitRequest) -> SupervisorResult<i64> {
        if !req.detach {
            return self.run_worker(&req, None);
        }

        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        match unsafe { fork() }? {
            ForkResult::Parent { .. } => {
                unsafe { libc::close(write_fd) };
                let mut buf = [0u8; 8];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = unsafe {
                        libc::read(
                            read_fd,
                            buf[filled..].as_mut_ptr() as *mut libc::c_void,
                            buf.len() - filled,
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                    filled += n as usize;
                }
                unsafe { libc::close(read_fd) };
                Ok(i64::from_le_bytes(buf))
            }
            ForkResult::Child => {
                unsafe { libc::close(read_fd) };
                let outcome = self.run_worker(&req, Some(write_fd));
                std::process::exit(match outcome {
                    Ok(_) => 0,
                    Err(_) => 1,
                });
            }
        }
    }

    fn run_worker(&self, req: &SubmitRequest, notify_fd: Option<RawFd>) -> SupervisorResult<i64> {
        install_pre_fork_handlers();

        let uuid = Uuid::new_v4().to_string();
        let pid = std::process::id() as i32;

        let (argv, command_raw, printable, restore_cwd, restore_environ) = match &req.command {
            Command::Fresh { argv } => {
                let raw = tsp_codec::encode(argv);
                let printable = argv.join(" ");
                (argv.clone(), raw, printable, None, None)
            }
            Command::Rerun { job_id } => {
                let raw = self
                    .store
                    .raw_cmd_by_id(*job_id)?
                    .ok_or(SupervisorError::NoRerunState(*job_id))?;
                let argv = tsp_codec::decode_utf8(&raw)?;
                let printable = argv.join(" ");
                let state = self
                    .store
                    .start_state_by_id(*job_id)?
                    .ok_or(SupervisorError::NoRerunState(*job_id))?;
                let saved_env = tsp_codec::decode_utf8(&state.environ)?;
                (argv, raw, printable, Some(state.cwd), Some(saved_env))
            }
        };

        let id = self.store.insert_job(
            &uuid,
            &printable,
            &command_raw,
            req.category.as_deref(),
            pid,
            req.slots,
        )?;
        self.store.record_qtime(&uuid, tsp_store::now_micros())?;

        if let Some(fd) = notify_fd {
            let bytes = id.to_le_bytes();
            unsafe {
                libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
                libc::close(fd);
            }
        }

        if let Some(cwd) = &restore_cwd {
            std::env::set_current_dir(cwd)?;
        }
        if let Some(saved_env) = &restore_environ {
            for (key, _) in std::env::vars() {
                std::env::remove_var(key);
            }
            for entry in saved_env {
                if let Some((key, value)) = entry.split_once('=') {
                    std::env::set_var(key, value);
                }
            }
        }

        let cores = match self.admit_and_prepare(&uuid, req) {
            Ok(Prepared::Ready(cores)) => cores,
            Ok(Prepared::CancelledBeforeAdmission) => {
                let status = 128 + SEEN_SIGNAL.load(Ordering::SeqCst);
                self.store.record_etime(&uuid, tsp_store::now_micros(), status)?;
                return Ok(id);
            }
            Err(err) => {
                self.store.record_etime(&uuid, tsp_store::now_micros(), -1)?;
                return Err(err);
            }
        };

        if req.verbose {
            tracing::info!(job_id = id, ?cores, "job started, bound to physical CPU cores");
        }

        if TIME_TO_DIE.load(Ordering::SeqCst) {
            let status = 128 + SEEN_SIGNAL.load(Ordering::SeqCst);
            self.store.record_etime(&uuid, tsp_store::now_micros(), status)?;
            return Ok(id);
        }

        let mut exec_argv = argv.clone();
        let openmpi = is_openmpi(&exec_argv);
        if openmpi {
            let rankfile = self.write_rankfile(&uuid, &cores)?;
            exec_argv.insert(1, "--rankfile".to_string());
            exec_argv.insert(2, rankfile.to_string_lossy().into_owned());
        }

        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

        let stdout_path = self.tmp_dir.join(format!("tsp.o{uuid}"));
        let stderr_path = self.tmp_dir.join(format!("tsp.e{uuid}"));

        match unsafe { fork() }? {
            ForkResult::Child => {
                if openmpi {
                    std::env::set_var("OMPI_MCA_rmaps_base_mapping_policy", "");
                    std::env::set_var("OMPI_MCA_rmaps_rank_file_physical", "true");
                }
                exec_redirected(&exec_argv, &stdout_path, &stderr_path, req.discard_output, req.separate_stderr);
                // exec_redirected only returns on failure.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                install_post_fork_handlers();
                let status = reap_all_descendants(child)?;

                let stdout_bytes = read_and_remove(&stdout_path).unwrap_or_default();
                let stderr_bytes = read_and_remove(&stderr_path).unwrap_or_default();
                self.store.save_output(&uuid, &stdout_bytes, &stderr_bytes)?;
                self.store.record_etime(&uuid, tsp_store::now_micros(), status)?;
                Ok(id)
            }
        }
    }

    /// Runs the admission loop, binds the process to the granted cores and
    /// writes the StartState, all before the exec fork. Any error here means
    /// the job never ran; the caller records ETime = -1 and treats it as
    /// fatal. A pre-admission cancellation is not an error: it returns
    /// `CancelledBeforeAdmission` so the caller can record the signal status
    /// instead.
    fn admit_and_prepare(&self, uuid: &str, req: &SubmitRequest) -> SupervisorResult<Prepared> {
        let total_slots = tsp_topology::discover_cores()?.len() as u32;
        if req.slots > total_slots {
            return Err(TopologyError::InsufficientCores {
                requested: req.slots,
                available: total_slots,
            }
            .into());
        }

        let mut lock = Lock::at(&self.tmp_dir);
        let jitter = tsp_jitter::Jitter::new();
        std::thread::sleep(jitter.initial_delay());
        let cores = loop {
            if TIME_TO_DIE.load(Ordering::SeqCst) {
                return Ok(Prepared::CancelledBeforeAdmission);
            }
            match tsp_admission::try_admit(&mut lock, self.store, uuid, total_slots, req.slots)? {
                Outcome::Admitted(cores) => break cores,
                Outcome::Deferred => {
                    std::thread::sleep(jitter.retry_delay());
                }
            }
        };

        self.store.record_stime(uuid, tsp_store::now_micros())?;
        tsp_topology::bind(&cores)?;

        let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
        let environ_blob = encode_current_environ();
        self.store.store_state(uuid, &cwd, &environ_blob)?;

        Ok(Prepared::Ready(cores))
    }

    fn write_rankfile(&self, uuid: &str, cores: &[u32]) -> SupervisorResult<PathBuf> {
        let path = self.tmp_dir.join(format!("tsp.rankfile.{uuid}"));
        let mut contents = String::new();
        for (rank, core) in cores.iter().enumerate() {
            contents.push_str(&format!("rank {rank}=localhost slot={core}\n"));
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

/// `argv[0]` names an OpenMPI launcher, confirmed by probing `--version` for
/// text that only Open MPI's own build prints.
fn is_openmpi(argv: &[String]) -> bool {
    let Some(exe) = argv.first() else { return false };
    let basename = Path::new(exe)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if basename != "mpirun" && basename != "mpiexec" {
        return false;
    }
    std::process::Command::new(exe)
        .arg("--version")
        .output()
        .map(|out| {
            let text = String::from_utf8_lossy(&out.stdout);
            text.contains("Open MPI") || text.contains("OpenRTE")
        })
        .unwrap_or(false)
}

fn encode_current_environ() -> Vec<u8> {
    let entries: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    tsp_codec::encode(&entries)
}

fn open_output_file(path: &Path, discard: bool) -> std::io::Result<File> {
    if discard {
        OpenOptions::new().write(true).open("/dev/null")
    } else {
        OpenOptions::new().write(true).create(true).truncate(true).open(path)
    }
}

/// Redirect stdout/stderr and exec the user command. Returns only on
/// failure to open a redirect target, exec itself, or translate an argv
/// entry — the caller treats any return as a failed exec.
fn exec_redirected(argv: &[String], stdout_path: &Path, stderr_path: &Path, discard: bool, separate_stderr: bool) {
    let Ok(stdout_file) = open_output_file(stdout_path, discard) else {
        return;
    };
    unsafe {
        libc::dup2(stdout_file.as_raw_fd(), libc::STDOUT_FILENO);
    }

    if separate_stderr {
        let Ok(stderr_file) = open_output_file(stderr_path, discard) else {
            return;
        };
        unsafe {
            libc::dup2(stderr_file.as_raw_fd(), libc::STDERR_FILENO);
        }
    } else {
        unsafe {
            libc::dup2(stdout_file.as_raw_fd(), libc::STDERR_FILENO);
        }
    }

    let Some(cargs) = argv
        .iter()
        .map(|a| CString::new(a.as_str()).ok())
        .collect::<Option<Vec<_>>>()
    else {
        return;
    };
    let mut argv_ptrs: Vec<*const libc::c_char> = cargs.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execvp(cargs[0].as_ptr(), argv_ptrs.as_ptr());
    }
}

/// Wait for every descendant of this process until `ECHILD`, recording the
/// primary exec'd child's own exit status as the job's result. Collateral
/// descendants (e.g. MPI ranks) are reaped but don't override the status.
fn reap_all_descendants(primary: Pid) -> SupervisorResult<i32> {
    let mut primary_status = None;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if pid == primary {
                    primary_status = Some(code);
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                if pid == primary {
                    primary_status = Some(128 + sig as i32);
                }
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(primary_status.unwrap_or(-1))
}

fn read_and_remove(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    std::fs::remove_file(path)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn openmpi_basename_detection_rejects_non_mpi_commands() {
        assert!(!is_openmpi(&["echo".to_string(), "hi".to_string()]));
        assert!(!is_openmpi(&[]));
    }

    #[test]
    fn rankfile_contents_match_bound_cores_in_order() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("tsp_db.sqlite3"), true, false).unwrap();
        let sup = Supervisor::new(&store, dir.path().to_path_buf());
        let path = sup.write_rankfile("job-x", &[2, 5, 7]).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "rank 0=localhost slot=2\nrank 1=localhost slot=5\nrank 2=localhost slot=7\n");
    }
}
