//! Session Store (C1, spec §4.1): the on-disk directory layout under
//! `$CONTROL_DIR/<id>/` and the atomic read/write/list/delete operations
//! every other component goes through instead of touching files directly.
//!
//! The write-temp-then-rename idiom is the donor's own
//! (`create_session_info`/`update_session_status` in the now-retired
//! `tty_spawn.rs`), generalized here with an explicit `fsync` before the
//! rename and a per-session lock so concurrent writers (PTY Host exit
//! handler, Activity Monitor, HTTP resize handler) can't interleave.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::protocol::{Session, SessionStatus};

const SESSION_FILE: &str = "session.json";
const ACTIVITY_FILE: &str = "activity.json";

/// Owns `CONTROL_DIR` and a per-session lock table. Cheap to clone (it's an
/// `Arc` internally) so every component can hold its own handle.
#[derive(Clone)]
pub struct SessionStore {
    control_dir: PathBuf,
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(control_dir: PathBuf) -> Self {
        Self {
            control_dir,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    #[must_use]
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.control_dir.join(id)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().unwrap().get(id) {
            return lock.clone();
        }
        self.locks
            .write()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates `$CONTROL_DIR/<id>/` and writes the initial `session.json`.
    /// Fails with `AlreadyExists` if the directory is already there.
    ///
    /// Builds the directory and its `session.json` in a sibling temp
    /// directory, then `rename`s it into place — the same
    /// temp-then-rename discipline `write_atomic` uses for individual
    /// files, applied to the whole directory so a `list_sessions` or
    /// `read_session` racing this call never observes the directory
    /// before `session.json` exists in it.
    pub fn create_session_dir(&self, session: &Session) -> AppResult<PathBuf> {
        let dir = self.session_dir(&session.id);
        if dir.exists() {
            return Err(AppError::AlreadyExists(session.id.clone()));
        }
        fs::create_dir_all(&self.control_dir)?;

        let temp_dir = tempfile::Builder::new()
            .prefix(".tmp-session-")
            .tempdir_in(&self.control_dir)?;
        self.write_session_file(temp_dir.path(), session)?;

        let temp_path = temp_dir.keep();
        if let Err(err) = fs::rename(&temp_path, &dir) {
            let _ = fs::remove_dir_all(&temp_path);
            return Err(AppError::IoError(err));
        }
        Ok(dir)
    }

    /// Reads `<id>/session.json`. A missing file is `NotFound`; a present
    /// but unparseable file is `Corrupt` rather than silently defaulted —
    /// callers that want list-and-skip-corrupt semantics use `list_sessions`.
    pub fn read_session(&self, id: &str) -> AppResult<Session> {
        let path = self.session_dir(id).join(SESSION_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(id.to_string())
            } else {
                AppError::IoError(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reads, mutates, and durably rewrites a session's `session.json` under
    /// the session's lock, so concurrent callers never observe a torn write.
    pub fn update_session(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> AppResult<Session> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();

        let mut session = self.read_session(id)?;
        let previous_status = session.status;
        mutate(&mut session);
        enforce_status_monotonicity(previous_status, session.status)?;

        let dir = self.session_dir(id);
        self.write_session_file(&dir, &session)?;
        Ok(session)
    }

    /// Enumerates every session directory, skipping (and logging) entries
    /// whose `session.json` is missing or unparseable rather than failing
    /// the whole listing — matches the donor's `list_sessions` behavior.
    pub fn list_sessions(&self) -> AppResult<Vec<Session>> {
        if !self.control_dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.control_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            match self.read_session(&id) {
                Ok(session) => sessions.push(session),
                Err(AppError::NotFound(_)) => {}
                Err(err) => warn!(session_id = %id, error = %err, "skipping corrupt session entry"),
            }
        }
        Ok(sessions)
    }

    /// Removes a session directory. Refuses to delete a `Running` or
    /// `Starting` session (the caller must kill it first via the Session
    /// Manager, per §4.8).
    pub fn delete_session(&self, id: &str) -> AppResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();

        let session = self.read_session(id)?;
        if session.status != SessionStatus::Exited {
            return Err(AppError::InvalidInput(format!(
                "session {id} is not exited"
            )));
        }
        fs::remove_dir_all(self.session_dir(id))?;
        self.locks.write().unwrap().remove(id);
        Ok(())
    }

    /// Reads `<id>/activity.json`, returning `None` if it hasn't been
    /// written yet (a session that hasn't produced any output since start).
    pub fn read_activity_timestamp(&self, id: &str) -> AppResult<Option<jiff::Timestamp>> {
        let path = self.session_dir(id).join(ACTIVITY_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let value: serde_json::Value = serde_json::from_str(&content)?;
                Ok(value
                    .get("timestamp")
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| s.parse().ok()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically overwrites `<id>/activity.json`. Called by the Activity
    /// Monitor only when the active/inactive state actually changes.
    pub fn write_activity(&self, id: &str, body: &serde_json::Value) -> AppResult<()> {
        let dir = self.session_dir(id);
        write_atomic(&dir, ACTIVITY_FILE, &serde_json::to_vec(body)?)
    }

    /// Reads `<id>/activity.json` in full, for `GET /api/sessions/activity`.
    /// `None` means the Activity Monitor hasn't written one yet.
    pub fn read_activity(&self, id: &str) -> AppResult<Option<serde_json::Value>> {
        let path = self.session_dir(id).join(ACTIVITY_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_session_file(&self, dir: &Path, session: &Session) -> AppResult<()> {
        write_atomic(dir, SESSION_FILE, &serde_json::to_vec(session)?)
    }
}

fn enforce_status_monotonicity(previous: SessionStatus, next: SessionStatus) -> AppResult<()> {
    use SessionStatus::{Exited, Running, Starting};
    let allowed = matches!(
        (previous, next),
        (Starting, Starting)
            | (Starting, Running)
            | (Starting, Exited)
            | (Running, Running)
            | (Running, Exited)
            | (Exited, Exited)
    );
    if allowed {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "illegal session status transition {previous:?} -> {next:?}"
        )))
    }
}

/// Write-temp-then-fsync-then-rename into `dir/name`, durable across a crash
/// between the write and the rename landing.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> AppResult<()> {
    fs::create_dir_all(dir)?;
    let temp = NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), bytes)?;
    File::open(temp.path())?.sync_all()?;
    temp.persist(dir.join(name))
        .map_err(|e| AppError::IoError(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionSource;

    fn sample(id: &str) -> Session {
        Session::new_starting(
            id.to_string(),
            vec!["bash".to_string()],
            "/tmp".to_string(),
            "xterm-256color".to_string(),
            80,
            24,
        )
    }

    #[test]
    fn create_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        let session = sample("abc");
        store.create_session_dir(&session).unwrap();

        let read_back = store.read_session("abc").unwrap();
        assert_eq!(read_back.id, "abc");
        assert_eq!(read_back.status, SessionStatus::Starting);
        assert_eq!(read_back.source, SessionSource::Local);
    }

    #[test]
    fn create_twice_is_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("dup")).unwrap();
        let err = store.create_session_dir(&sample("dup")).unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[test]
    fn update_session_enforces_monotonic_status() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("mono")).unwrap();

        store
            .update_session("mono", |s| s.status = SessionStatus::Running)
            .unwrap();
        store
            .update_session("mono", |s| s.status = SessionStatus::Exited)
            .unwrap();

        let err = store
            .update_session("mono", |s| s.status = SessionStatus::Running)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn delete_refuses_running_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("run")).unwrap();
        store
            .update_session("run", |s| s.status = SessionStatus::Running)
            .unwrap();

        let err = store.delete_session("run").unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn delete_exited_session_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("done")).unwrap();
        store
            .update_session("done", |s| s.status = SessionStatus::Exited)
            .unwrap();
        store.delete_session("done").unwrap();

        assert!(matches!(
            store.read_session("done").unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[test]
    fn list_sessions_skips_corrupt_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("good")).unwrap();

        let bad_dir = tmp.path().join("bad");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join(SESSION_FILE), b"not json").unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "good");
    }

    #[test]
    fn activity_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("act")).unwrap();

        assert!(store.read_activity_timestamp("act").unwrap().is_none());
        store
            .write_activity("act", &serde_json::json!({"timestamp": "2024-01-01T00:00:00Z"}))
            .unwrap();
        assert!(store.read_activity_timestamp("act").unwrap().is_some());
    }

    #[test]
    fn read_activity_returns_full_object() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        store.create_session_dir(&sample("act2")).unwrap();

        assert!(store.read_activity("act2").unwrap().is_none());
        store
            .write_activity("act2", &serde_json::json!({"isActive": true, "timestamp": "2024-01-01T00:00:00Z"}))
            .unwrap();
        let value = store.read_activity("act2").unwrap().unwrap();
        assert_eq!(value["isActive"], serde_json::json!(true));
    }
}
