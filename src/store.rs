use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::QuoremError;
use crate::ingest::IngestReport;

const DATABASE_FILE: &str = "database.json";
const DATABASE_LOCK: &str = "database.lock";

/// How long to wait for the database lock, and when a leftover lock file may
/// be taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub wait: Duration,
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(120),
            stale_after: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
    lock_policy: LockPolicy,
}

impl Store {
    pub fn new() -> Result<Self, QuoremError> {
        let cwd = std::env::current_dir().map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".quorem"))
            .map_err(|_| QuoremError::Filesystem("invalid store path".to_string()))?;
        Ok(Self::new_with_root(root))
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn database_path(&self) -> Utf8PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn reports_dir(&self) -> Utf8PathBuf {
        self.root.join("reports")
    }

    pub fn report_path(&self, job_id: &str) -> Utf8PathBuf {
        self.reports_dir().join(format!("{job_id}.json"))
    }

    pub fn locks_dir(&self) -> Utf8PathBuf {
        self.root.join("locks")
    }

    pub fn ensure_root(&self) -> Result<(), QuoremError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| QuoremError::Filesystem(err.to_string()))
    }

    /// Loads the snapshot, or an empty database when none was saved yet.
    pub fn load_database(&self) -> Result<Database, QuoremError> {
        let path = self.database_path();
        if !path.as_std_path().exists() {
            debug!(path = %path, "no snapshot yet");
            return Ok(Database::new());
        }
        let content =
            fs::read(path.as_std_path()).map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        let mut db: Database = serde_json::from_slice(&content)
            .map_err(|err| QuoremError::CorruptState(format!("{path}: {err}")))?;
        db.reindex()?;
        Ok(db)
    }

    pub fn save_database(&self, db: &Database) -> Result<(), QuoremError> {
        let content =
            serde_json::to_vec(db).map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(&self.database_path(), &content)
    }

    pub fn write_report(&self, job_id: &str, report: &IngestReport) -> Result<Utf8PathBuf, QuoremError> {
        let path = self.report_path(job_id);
        let content = serde_json::to_vec_pretty(report)
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(&path, &content)?;
        Ok(path)
    }

    pub fn read_report(&self, job_id: &str) -> Result<IngestReport, QuoremError> {
        let path = self.report_path(job_id);
        let content =
            fs::read(path.as_std_path()).map_err(|err| QuoremError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_slice(&content).map_err(|err| QuoremError::Filesystem(format!("{path}: {err}")))
    }

    /// Job ids of the stored reports, sorted.
    pub fn list_reports(&self) -> Result<Vec<String>, QuoremError> {
        let dir = self.reports_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir.as_std_path()).map_err(|err| QuoremError::Filesystem(err.to_string()))? {
            let path = entry
                .map_err(|err| QuoremError::Filesystem(err.to_string()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), QuoremError> {
        let parent = path
            .parent()
            .ok_or_else(|| QuoremError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("quorem-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Takes the exclusive lock for ingesting `upload`. The lock is released
    /// when the returned guard is dropped.
    pub fn lock_upload(&self, upload: &Path) -> Result<StoreLock, QuoremError> {
        let path = self.locks_dir().join(format!("{}.lock", lock_name(upload)));
        self.try_lock(&path)?
            .ok_or_else(|| QuoremError::UploadLocked(upload.display().to_string()))
    }

    /// Takes the store-wide lock held from loading the snapshot until it is
    /// saved. Waits up to `lock_policy.wait` for another holder to finish.
    pub fn lock_database(&self) -> Result<StoreLock, QuoremError> {
        let path = self.locks_dir().join(DATABASE_LOCK);
        let started = Instant::now();
        let mut pause = Duration::from_millis(5);
        loop {
            if let Some(lock) = self.try_lock(&path)? {
                return Ok(lock);
            }
            if started.elapsed() >= self.lock_policy.wait {
                return Err(QuoremError::StoreBusy(self.root.to_string()));
            }
            thread::sleep(pause);
            pause = (pause * 2).min(Duration::from_millis(200));
        }
    }

    fn try_lock(&self, path: &Utf8Path) -> Result<Option<StoreLock>, QuoremError> {
        fs::create_dir_all(self.locks_dir().as_std_path())
            .map_err(|err| QuoremError::Filesystem(err.to_string()))?;
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path.as_std_path())
            {
                Ok(mut file) => {
                    let lock = StoreLock {
                        path: path.to_path_buf(),
                    };
                    writeln!(file, "{}", std::process::id())
                        .and_then(|()| file.sync_all())
                        .map_err(|err| QuoremError::Filesystem(format!("{path}: {err}")))?;
                    debug!(lock = %path, "lock taken");
                    return Ok(Some(lock));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.is_stale(path)? {
                        warn!(lock = %path, "reclaiming stale lock");
                        match fs::remove_file(path.as_std_path()) {
                            Ok(()) => {}
                            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                            Err(err) => return Err(QuoremError::Filesystem(err.to_string())),
                        }
                        continue;
                    }
                    return Ok(None);
                }
                Err(err) => return Err(QuoremError::Filesystem(err.to_string())),
            }
        }
        Ok(None)
    }

    /// A lock is stale when the process that wrote it is gone, or, when that
    /// cannot be told, once it is older than `lock_policy.stale_after`.
    fn is_stale(&self, path: &Utf8Path) -> Result<bool, QuoremError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(QuoremError::Filesystem(err.to_string())),
        };
        if let Some(alive) = content.trim().parse::<u32>().ok().and_then(process_alive) {
            return Ok(!alive);
        }
        let age = fs::metadata(path.as_std_path())
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        Ok(age.is_some_and(|age| age >= self.lock_policy.stale_after))
    }
}

/// Whether `pid` is a running process, where the platform lets us tell.
fn process_alive(pid: u32) -> Option<bool> {
    let proc = Path::new("/proc");
    if cfg!(target_os = "linux") && proc.join("self").exists() {
        return Some(proc.join(pid.to_string()).exists());
    }
    None
}

fn lock_name(upload: &Path) -> String {
    let absolute = fs::canonicalize(upload).unwrap_or_else(|_| upload.to_path_buf());
    absolute
        .to_string_lossy()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' { ch } else { '_' })
        .collect()
}

#[derive(Debug)]
pub struct StoreLock {
    path: Utf8PathBuf,
}

impl StoreLock {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            debug!(lock = %self.path, error = %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("store")).unwrap();
        (temp, Store::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let store = Store::new().unwrap();
        assert!(store.database_path().ends_with(".quorem/database.json"));
        assert!(store.report_path("job").ends_with("reports/job.json"));
    }

    #[test]
    fn second_lock_is_refused_until_release() {
        let (temp, store) = temp_store();
        let upload = temp.path().join("upload.qza");
        fs::write(&upload, b"zip").unwrap();

        let lock = store.lock_upload(&upload).unwrap();
        assert!(lock.path().as_std_path().exists());
        assert_matches!(store.lock_upload(&upload), Err(QuoremError::UploadLocked(_)));
        drop(lock);
        assert!(store.lock_upload(&upload).is_ok());
    }

    #[test]
    fn old_lock_without_owner_is_reclaimed() {
        let (temp, store) = temp_store();
        let store = store.with_lock_policy(LockPolicy {
            wait: Duration::ZERO,
            stale_after: Duration::ZERO,
        });
        let upload = temp.path().join("upload.qza");
        fs::write(&upload, b"zip").unwrap();
        let leftover = store.locks_dir().join(format!("{}.lock", lock_name(&upload)));
        fs::create_dir_all(store.locks_dir().as_std_path()).unwrap();
        fs::write(leftover.as_std_path(), b"").unwrap();

        let lock = store.lock_upload(&upload).unwrap();
        assert_eq!(lock.path(), leftover.as_path());
        let owner = fs::read_to_string(leftover.as_std_path()).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn fresh_lock_without_owner_is_kept() {
        let (temp, store) = temp_store();
        let upload = temp.path().join("upload.qza");
        fs::write(&upload, b"zip").unwrap();
        fs::create_dir_all(store.locks_dir().as_std_path()).unwrap();
        let leftover = store.locks_dir().join(format!("{}.lock", lock_name(&upload)));
        fs::write(leftover.as_std_path(), b"").unwrap();
        assert_matches!(store.lock_upload(&upload), Err(QuoremError::UploadLocked(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_of_dead_process_is_reclaimed() {
        let (_temp, store) = temp_store();
        fs::create_dir_all(store.locks_dir().as_std_path()).unwrap();
        let leftover = store.locks_dir().join(DATABASE_LOCK);
        // Above the largest pid Linux hands out.
        fs::write(leftover.as_std_path(), b"4294967\n").unwrap();
        assert!(store.lock_database().is_ok());
    }

    #[test]
    fn busy_database_times_out() {
        let (_temp, store) = temp_store();
        let store = store.with_lock_policy(LockPolicy {
            wait: Duration::from_millis(20),
            ..LockPolicy::default()
        });
        let held = store.lock_database().unwrap();
        assert_matches!(store.lock_database(), Err(QuoremError::StoreBusy(_)));
        drop(held);
        assert!(store.lock_database().is_ok());
    }
}
