//! The SQLite-backed state store: schema bootstrap, job lifecycle writes,
//! and the read queries every other component needs.
//!
//! Every mutation is a prepared statement; the schema bootstrap is the one
//! place that executes a batch of unparameterised SQL. Rows are never
//! mutated once inserted — a job's lifecycle is witnessed purely by which
//! child tables have gained a row for it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error opening {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database {0:?} does not exist")]
    Missing(PathBuf),
    #[error("store opened read-only, cannot {0}")]
    ReadOnly(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Current wall-clock time in microseconds since the Unix epoch, the unit
/// every timestamp column in this schema is stored in.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// The set a job can be filtered into for `jobs_by_category`. `Failed` is a
/// subset of `Finished` (non-zero exit status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCategory {
    All,
    Queued,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: i64,
    pub uuid: String,
    pub command: String,
    pub category: Option<String>,
    pub pid: i32,
    pub slots: u32,
}

/// One row of the stable `job_details` read contract: a job plus whichever
/// lifecycle timestamps it has accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
    pub id: i64,
    pub uuid: String,
    pub command: String,
    pub category: Option<String>,
    pub pid: i32,
    pub slots: u32,
    pub qtime: Option<i64>,
    pub stime: Option<i64>,
    pub etime: Option<i64>,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartState {
    pub cwd: String,
    pub environ: Vec<u8>,
}

pub struct Store {
    conn: Connection,
    read_write: bool,
}

impl Store {
    /// Open (or create) the database at `path`.
    ///
    /// In read-only mode a missing file is tolerated when `tolerate_missing`
    /// is set: an empty in-memory database is substituted so reads return
    /// empty results instead of erroring. In read-write mode any open
    /// failure is fatal.
    pub fn open(path: &Path, read_write: bool, tolerate_missing: bool) -> StoreResult<Self> {
        let conn = if read_write {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, source),
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn
        } else if path.exists() {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else if tolerate_missing {
            Connection::open_in_memory()?
        } else {
            return Err(StoreError::Missing(path.to_path_buf()));
        };

        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;

        let store = Self { conn, read_write };
        store.bootstrap()?;
        tracing::debug!(?path, read_write, "store opened");
        Ok(store)
    }

    /// Idempotently create the schema and derived views. Safe to call
    /// against an already-bootstrapped database; every statement is
    /// `IF NOT EXISTS` so concurrent bootstrappers never conflict.
    pub fn bootstrap(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs(
              id           INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid         TEXT UNIQUE NOT NULL,
              command      TEXT NOT NULL,
              command_raw  BLOB NOT NULL,
              category     TEXT,
              pid          INTEGER NOT NULL,
              slots        INTEGER NOT NULL CHECK(slots >= 1)
            );

            CREATE TABLE IF NOT EXISTS qtime(
              jobid INTEGER UNIQUE NOT NULL,
              time  INTEGER NOT NULL,
              FOREIGN KEY(jobid) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS stime(
              jobid INTEGER UNIQUE NOT NULL,
              time  INTEGER NOT NULL,
              FOREIGN KEY(jobid) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS etime(
              jobid       INTEGER UNIQUE NOT NULL,
              time        INTEGER NOT NULL,
              exit_status INTEGER NOT NULL,
              FOREIGN KEY(jobid) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS start_state(
              jobid   INTEGER UNIQUE NOT NULL,
              cwd     TEXT NOT NULL,
              environ BLOB NOT NULL,
              FOREIGN KEY(jobid) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS job_output(
              jobid  INTEGER UNIQUE NOT NULL,
              stdout BLOB NOT NULL,
              stderr BLOB NOT NULL,
              FOREIGN KEY(jobid) REFERENCES jobs(id) ON DELETE CASCADE
            );

            -- One row per bound core per running job. References jobs(uuid)
            -- rather than jobs(id) since that is the key Admission works in.
            CREATE TABLE IF NOT EXISTS slot_reservation(
              uuid TEXT NOT NULL,
              slot INTEGER NOT NULL,
              FOREIGN KEY(uuid) REFERENCES jobs(uuid) ON DELETE CASCADE,
              UNIQUE(uuid, slot)
            );

            -- Materialised on demand: one row per physical core id known to
            -- Admission at the time it first ran in this database's lifetime.
            CREATE TABLE IF NOT EXISTS integer_sequence(
              slot INTEGER UNIQUE NOT NULL PRIMARY KEY
            );

            CREATE VIEW IF NOT EXISTS live_reservations AS
            SELECT sr.uuid AS uuid, sr.slot AS slot
            FROM slot_reservation sr
            JOIN jobs j ON j.uuid = sr.uuid
            LEFT JOIN etime e ON e.jobid = j.id
            WHERE e.jobid IS NULL;

            CREATE VIEW IF NOT EXISTS sibling_pids AS
            SELECT j.id AS id, j.uuid AS uuid, j.pid AS pid
            FROM jobs j
            JOIN stime s ON s.jobid = j.id
            LEFT JOIN etime e ON e.jobid = j.id
            WHERE e.jobid IS NULL;

            CREATE VIEW IF NOT EXISTS job_details AS
            SELECT
              j.id AS id,
              j.uuid AS uuid,
              j.command AS command,
              j.category AS category,
              j.pid AS pid,
              j.slots AS slots,
              q.time AS qtime,
              s.time AS stime,
              e.time AS etime,
              e.exit_status AS exit_status
            FROM jobs j
            LEFT JOIN qtime q ON q.jobid = j.id
            LEFT JOIN stime s ON s.jobid = j.id
            LEFT JOIN etime e ON e.jobid = j.id;
            "#,
        )?;
        Ok(())
    }

    fn require_write(&self, op: &'static str) -> StoreResult<()> {
        if self.read_write {
            Ok(())
        } else {
            Err(StoreError::ReadOnly(op))
        }
    }

    // Writes
    // ------------------------------------------------------------------

    pub fn insert_job(
        &self,
        uuid: &str,
        command: &str,
        command_raw: &[u8],
        category: Option<&str>,
        pid: i32,
        slots: u32,
    ) -> StoreResult<i64> {
        self.require_write("insert_job")?;
        self.conn.execute(
            "INSERT INTO jobs(uuid, command, command_raw, category, pid, slots) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![uuid, command, command_raw, category, pid, slots],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(%uuid, id, slots, "insert_job");
        Ok(id)
    }

    fn jobid_of(&self, uuid: &str) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT id FROM jobs WHERE uuid = ?1", params![uuid], |r| {
                r.get(0)
            })?)
    }

    pub fn record_qtime(&self, uuid: &str, time_us: i64) -> StoreResult<()> {
        self.require_write("record_qtime")?;
        let jobid = self.jobid_of(uuid)?;
        self.conn.execute(
            "INSERT INTO qtime(jobid, time) VALUES (?1, ?2)",
            params![jobid, time_us],
        )?;
        tracing::debug!(%uuid, time_us, "record_qtime");
        Ok(())
    }

    pub fn record_stime(&self, uuid: &str, time_us: i64) -> StoreResult<()> {
        self.require_write("record_stime")?;
        let jobid = self.jobid_of(uuid)?;
        self.conn.execute(
            "INSERT INTO stime(jobid, time) VALUES (?1, ?2)",
            params![jobid, time_us],
        )?;
        tracing::debug!(%uuid, time_us, "record_stime");
        Ok(())
    }

    pub fn record_etime(&self, uuid: &str, time_us: i64, exit_status: i32) -> StoreResult<()> {
        self.require_write("record_etime")?;
        let jobid = self.jobid_of(uuid)?;
        self.conn.execute(
            "INSERT INTO etime(jobid, time, exit_status) VALUES (?1, ?2, ?3)",
            params![jobid, time_us, exit_status],
        )?;
        tracing::debug!(%uuid, time_us, exit_status, "record_etime");
        Ok(())
    }

    pub fn store_state(&self, uuid: &str, cwd: &str, environ: &[u8]) -> StoreResult<()> {
        self.require_write("store_state")?;
        let jobid = self.jobid_of(uuid)?;
        self.conn.execute(
            "INSERT INTO start_state(jobid, cwd, environ) VALUES (?1, ?2, ?3)",
            params![jobid, cwd, environ],
        )?;
        tracing::debug!(%uuid, %cwd, "store_state");
        Ok(())
    }

    pub fn save_output(&self, uuid: &str, stdout: &[u8], stderr: &[u8]) -> StoreResult<()> {
        self.require_write("save_output")?;
        let jobid = self.jobid_of(uuid)?;
        self.conn.execute(
            "INSERT INTO job_output(jobid, stdout, stderr) VALUES (?1, ?2, ?3)",
            params![jobid, stdout, stderr],
        )?;
        tracing::debug!(%uuid, stdout_len = stdout.len(), stderr_len = stderr.len(), "save_output");
        Ok(())
    }

    /// Atomic admission step: materialise the core pool if needed, compute
    /// the free cores under `live_reservations`, and either reserve
    /// `requested_slots` of the lowest-numbered free cores for `uuid` or
    /// return `None` without any side effect. The whole step runs inside one
    /// `BEGIN IMMEDIATE` transaction so no two concurrent callers can ever
    /// observe and claim the same core.
    pub fn allocate_slots(
        &self,
        uuid: &str,
        total_slots: u32,
        requested_slots: u32,
    ) -> StoreResult<Option<Vec<u32>>> {
        self.require_write("allocate_slots")?;
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match self.allocate_slots_locked(uuid, total_slots, requested_slots) {
            Ok(outcome) => {
                self.conn.execute_batch("COMMIT")?;
                tracing::trace!(%uuid, requested_slots, granted = ?outcome, "allocate_slots");
                Ok(outcome)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    fn allocate_slots_locked(
        &self,
        uuid: &str,
        total_slots: u32,
        requested_slots: u32,
    ) -> StoreResult<Option<Vec<u32>>> {
        let populated: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM integer_sequence", [], |r| r.get(0))?;
        if populated == 0 {
            let mut insert = self
                .conn
                .prepare("INSERT INTO integer_sequence(slot) VALUES (?1)")?;
            for slot in 0..total_slots {
                insert.execute(params![slot])?;
            }
        }

        let mut avail_stmt = self.conn.prepare(
            "SELECT slot FROM integer_sequence \
             WHERE slot NOT IN (SELECT slot FROM live_reservations) \
             ORDER BY slot ASC",
        )?;
        let avail: Vec<u32> = avail_stmt
            .query_map([], |r| r.get::<_, i64>(0).map(|v| v as u32))?
            .collect::<Result<_, _>>()?;

        if (avail.len() as u32) < requested_slots {
            return Ok(None);
        }

        let chosen: Vec<u32> = avail.into_iter().take(requested_slots as usize).collect();
        let mut insert = self
            .conn
            .prepare("INSERT INTO slot_reservation(uuid, slot) VALUES (?1, ?2)")?;
        for &slot in &chosen {
            insert.execute(params![uuid, slot as i64])?;
        }
        Ok(Some(chosen))
    }

    /// Idempotent: recording ETime already removes a job's rows from
    /// `live_reservations`, so this exists only for cancellation before exec.
    pub fn release_slots(&self, uuid: &str) -> StoreResult<()> {
        self.require_write("release_slots")?;
        self.conn
            .execute("DELETE FROM slot_reservation WHERE uuid = ?1", params![uuid])?;
        tracing::debug!(%uuid, "release_slots");
        Ok(())
    }

    // Reads
    // ------------------------------------------------------------------

    pub fn last_job_id(&self) -> StoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(id) FROM jobs", [], |r| r.get(0))?)
    }

    pub fn job_by_id(&self, id: i64) -> StoreResult<Option<JobRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, uuid, command, category, pid, slots FROM jobs WHERE id = ?1",
                params![id],
                |r| {
                    Ok(JobRecord {
                        id: r.get(0)?,
                        uuid: r.get(1)?,
                        command: r.get(2)?,
                        category: r.get(3)?,
                        pid: r.get(4)?,
                        slots: r.get::<_, i64>(5)? as u32,
                    })
                },
            )
            .optional()?)
    }

    fn details_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobDetails> {
        Ok(JobDetails {
            id: row.get(0)?,
            uuid: row.get(1)?,
            command: row.get(2)?,
            category: row.get(3)?,
            pid: row.get(4)?,
            slots: row.get::<_, i64>(5)? as u32,
            qtime: row.get(6)?,
            stime: row.get(7)?,
            etime: row.get(8)?,
            exit_status: row.get(9)?,
        })
    }

    pub fn job_details_by_id(&self, id: i64) -> StoreResult<Option<JobDetails>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, uuid, command, category, pid, slots, qtime, stime, etime, exit_status \
                 FROM job_details WHERE id = ?1",
                params![id],
                |row| Self::details_from_row(row),
            )
            .optional()?)
    }

    pub fn jobs_by_category(&self, category: JobCategory) -> StoreResult<Vec<JobDetails>> {
        let base = "SELECT id, uuid, command, category, pid, slots, qtime, stime, etime, exit_status \
                     FROM job_details";
        let sql = match category {
            JobCategory::All => format!("{base} ORDER BY id"),
            JobCategory::Queued => format!("{base} WHERE stime IS NULL ORDER BY id"),
            JobCategory::Running => {
                format!("{base} WHERE stime IS NOT NULL AND etime IS NULL ORDER BY id")
            }
            JobCategory::Finished => format!("{base} WHERE etime IS NOT NULL ORDER BY id"),
            JobCategory::Failed => {
                format!("{base} WHERE etime IS NOT NULL AND exit_status != 0 ORDER BY id")
            }
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Self::details_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stdout_by_id(&self, id: i64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT stdout FROM job_output WHERE jobid = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn stderr_by_id(&self, id: i64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT stderr FROM job_output WHERE jobid = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn raw_cmd_by_id(&self, id: i64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT command_raw FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn start_state_by_id(&self, id: i64) -> StoreResult<Option<StartState>> {
        Ok(self
            .conn
            .query_row(
                "SELECT cwd, environ FROM start_state WHERE jobid = ?1",
                params![id],
                |r| {
                    Ok(StartState {
                        cwd: r.get(0)?,
                        environ: r.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// The pids of every other spooler worker still running on this host,
    /// deduplicated.
    pub fn sibling_pids_excluding(&self, pid: i32) -> StoreResult<Vec<i32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT pid FROM sibling_pids WHERE pid != ?1 ORDER BY pid")?;
        let rows = stmt
            .query_map(params![pid], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn extern_id_by_uuid(&self, uuid: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM jobs WHERE uuid = ?1", params![uuid], |r| {
                r.get(0)
            })
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn store(dir: &Path) -> Store {
        Store::open(&dir.join("tsp_db.sqlite3"), true, false).unwrap()
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.bootstrap().unwrap();
        s.bootstrap().unwrap();
    }

    #[test]
    fn readonly_missing_db_tolerated() {
        let dir = tempdir().unwrap();
        let s = Store::open(&dir.join("nope.sqlite3"), false, true).unwrap();
        assert_eq!(s.last_job_id().unwrap(), None);
        assert!(s.jobs_by_category(JobCategory::All).unwrap().is_empty());
    }

    #[test]
    fn readonly_missing_db_errors_without_tolerance() {
        let dir = tempdir().unwrap();
        assert!(Store::open(&dir.join("nope.sqlite3"), false, false).is_err());
    }

    #[test]
    fn readonly_store_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tsp_db.sqlite3");
        {
            store_at(&path);
        }
        let ro = Store::open(&path, false, false).unwrap();
        assert!(matches!(
            ro.insert_job("x", "echo hi", b"echo\0hi\0\0", None, 1, 1),
            Err(StoreError::ReadOnly("insert_job"))
        ));
    }

    fn store_at(path: &Path) -> Store {
        Store::open(path, true, false).unwrap()
    }

    #[test]
    fn single_job_lifecycle() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let uuid = Uuid::new_v4().to_string();
        let id = s
            .insert_job(&uuid, "echo hi", b"echo\0hi\0\0", None, 4242, 1)
            .unwrap();
        s.record_qtime(&uuid, 100).unwrap();

        let admitted = s.allocate_slots(&uuid, 4, 1).unwrap();
        assert_eq!(admitted, Some(vec![0]));

        s.record_stime(&uuid, 200).unwrap();
        s.store_state(&uuid, "/tmp", b"FOO=1\0\0").unwrap();
        s.save_output(&uuid, b"hi\n", b"").unwrap();
        s.record_etime(&uuid, 300, 0).unwrap();

        let details = s.job_details_by_id(id).unwrap().unwrap();
        assert_eq!(details.qtime, Some(100));
        assert_eq!(details.stime, Some(200));
        assert_eq!(details.etime, Some(300));
        assert_eq!(details.exit_status, Some(0));

        assert_eq!(s.stdout_by_id(id).unwrap().unwrap(), b"hi\n");
        // ETime recorded => reservation no longer live.
        let reclaimed = s.allocate_slots("other-job-placeholder", 4, 4).unwrap();
        assert_eq!(reclaimed, Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn admission_monotonicity_four_cores_six_requests() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let mut admitted_count = 0;
        let mut deferred_count = 0;
        for i in 0..6 {
            let uuid = format!("job-{i}");
            s.insert_job(&uuid, "sleep 1", b"sleep\x001\0\0", None, 1000 + i, 1)
                .unwrap();
            match s.allocate_slots(&uuid, 4, 1).unwrap() {
                Some(_) => admitted_count += 1,
                None => deferred_count += 1,
            }
        }
        assert_eq!(admitted_count, 4);
        assert_eq!(deferred_count, 2);
    }

    #[test]
    fn over_subscribed_request_is_deferred_without_side_effects() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let uuid = "too-big";
        s.insert_job(uuid, "sleep 1", b"sleep\x001\0\0", None, 1, 4)
            .unwrap();
        let outcome = s.allocate_slots(uuid, 2, 4).unwrap();
        assert_eq!(outcome, None);
        let live: i64 = s
            .conn
            .query_row(
                "SELECT COUNT(*) FROM live_reservations WHERE uuid = ?1",
                params![uuid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(live, 0);
    }

    #[test]
    fn jobs_by_category_filters() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());

        s.insert_job("queued", "sleep 9", b"sleep\x009\0\0", None, 1, 1)
            .unwrap();

        s.insert_job("running", "sleep 9", b"sleep\x009\0\0", None, 2, 1)
            .unwrap();
        s.record_stime("running", 1).unwrap();

        s.insert_job("ok", "true", b"true\0\0", None, 3, 1).unwrap();
        s.record_stime("ok", 1).unwrap();
        s.record_etime("ok", 2, 0).unwrap();

        s.insert_job("bad", "false", b"false\0\0", None, 4, 1)
            .unwrap();
        s.record_stime("bad", 1).unwrap();
        s.record_etime("bad", 2, 1).unwrap();

        assert_eq!(s.jobs_by_category(JobCategory::All).unwrap().len(), 4);
        assert_eq!(s.jobs_by_category(JobCategory::Queued).unwrap().len(), 1);
        assert_eq!(s.jobs_by_category(JobCategory::Running).unwrap().len(), 1);
        assert_eq!(s.jobs_by_category(JobCategory::Finished).unwrap().len(), 2);
        assert_eq!(s.jobs_by_category(JobCategory::Failed).unwrap().len(), 1);
    }

    #[test]
    fn sibling_pids_excludes_self_and_finished_jobs() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());

        s.insert_job("a", "sleep 9", b"sleep\x009\0\0", None, 10, 1)
            .unwrap();
        s.record_stime("a", 1).unwrap();

        s.insert_job("b", "sleep 9", b"sleep\x009\0\0", None, 20, 1)
            .unwrap();
        s.record_stime("b", 1).unwrap();
        s.record_etime("b", 2, 0).unwrap();

        s.insert_job("c", "sleep 9", b"sleep\x009\0\0", None, 30, 1)
            .unwrap();
        s.record_stime("c", 1).unwrap();

        let siblings = s.sibling_pids_excluding(10).unwrap();
        assert_eq!(siblings, vec![30]);
    }

    #[test]
    fn release_slots_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.insert_job("z", "sleep 9", b"sleep\x009\0\0", None, 1, 1)
            .unwrap();
        s.allocate_slots("z", 2, 1).unwrap();
        s.release_slots("z").unwrap();
        s.release_slots("z").unwrap();
    }
}
