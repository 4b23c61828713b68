//! Session Manager (C8, spec §4.8): the only component the HTTP surface
//! talks to for session lifecycle. Creation goes through `pty::spawn`
//! directly, but everything else — input, resize, kill — is dispatched by
//! writing into the session's `stdin`/`control` FIFOs, never by holding onto
//! a `PtyHandle` past the moment the PTY Host hands one back. That keeps the
//! rule in spec §4.8 ("the Manager never talks to the PTY fd directly")
//! structurally true rather than merely documented.
//!
//! Zombie reaping is grounded on the donor's own periodic `cleanup_exited`
//! sweep in `api_server.rs`, extended with a liveness check (`kill(pid, 0)`)
//! since a session whose owning process died without this server noticing
//! (e.g. `vibetunneld` itself restarted) would otherwise sit forever in
//! `running` with no exit record.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::kill as signal_kill;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::cast::CastWriter;
use crate::emulator::Emulator;
use crate::error::{AppError, AppResult};
use crate::protocol::{AsciinemaHeader, BufferSnapshot, Session, SessionStatus};
use crate::pty;
use crate::store::SessionStore;

const ZOMBIE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Exit code recorded for a session whose process is gone but left no `exit`
/// record (spec §9: the zombie convention).
const ZOMBIE_EXIT_CODE: i32 = -1;

/// What the caller wants spawned. Unset dimensions/term fall back to the
/// defaults spec §3 gives a freshly `Starting` session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub term: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Extra environment variables the child should see, on top of (and
    /// overriding, on collision) the inherited process environment — spec
    /// §4.3's creation contract names `env` alongside `command`/`args`.
    pub env: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct SessionManager {
    store: SessionStore,
    emulators: Arc<Mutex<HashMap<String, Arc<Emulator>>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            emulators: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Resolves a session id to its live `Emulator`, if the session is still
    /// running in this process. Used by the Buffer Aggregator's fan-out loop
    /// and by the direct-snapshot HTTP endpoint.
    #[must_use]
    pub fn emulator(&self, session_id: &str) -> Option<Arc<Emulator>> {
        self.emulators.lock().unwrap().get(session_id).cloned()
    }

    pub fn snapshot(&self, session_id: &str) -> AppResult<BufferSnapshot> {
        self.emulator(session_id)
            .map(|e| e.snapshot())
            .ok_or_else(|| AppError::NotFound(session_id.to_string()))
    }

    #[must_use]
    pub fn list(&self) -> AppResult<Vec<Session>> {
        self.store.list_sessions()
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> AppResult<Session> {
        self.store.read_session(session_id)
    }

    /// Spawns a new PTY-backed session (spec §4.8 "create"). Returns once the
    /// session is durably recorded as `running`; the PTY's own output pump
    /// continues on a background thread owned by `pty::spawn`.
    pub fn create(&self, request: CreateSessionRequest) -> AppResult<Session> {
        if request.command.is_empty() {
            return Err(AppError::InvalidInput("command must not be empty".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let cols = request.cols.unwrap_or(80);
        let rows = request.rows.unwrap_or(24);
        let term = request.term.unwrap_or_else(|| "xterm-256color".to_string());
        let working_dir = request
            .working_dir
            .or_else(|| std::env::current_dir().ok().map(|p| p.to_string_lossy().to_string()))
            .unwrap_or_else(|| "/".to_string());

        let mut session = Session::new_starting(
            id.clone(),
            request.command.clone(),
            working_dir.clone(),
            term.clone(),
            cols,
            rows,
        );
        session.name = request.name;

        let dir = self.store.create_session_dir(&session)?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let header = AsciinemaHeader::new(cols, rows, &term, &shell);
        let cast = CastWriter::create(&dir, &header)?;

        let emulator = Arc::new(Emulator::new(cols, rows));
        self.emulators.lock().unwrap().insert(id.clone(), emulator.clone());

        let stdin_fifo = dir.join("stdin");
        let control_fifo = dir.join("control");

        let store_for_exit = self.store.clone();
        let emulators_for_exit = self.emulators.clone();
        let id_for_exit = id.clone();
        let handle = pty::spawn(
            &id,
            &request.command,
            Path::new(&working_dir),
            cols,
            rows,
            &term,
            &request.env,
            &stdin_fifo,
            &control_fifo,
            cast,
            Some(emulator),
            move |code| {
                emulators_for_exit.lock().unwrap().remove(&id_for_exit);
                let result = store_for_exit.update_session(&id_for_exit, |s| {
                    s.status = SessionStatus::Exited;
                    s.exit_code = Some(crate::protocol::clamp_exit_code_for_display(code));
                });
                if let Err(err) = result {
                    warn!(session_id = %id_for_exit, error = %err, "failed to record session exit");
                }
                info!(session_id = %id_for_exit, exit_code = code, "session exited");
            },
        );

        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.emulators.lock().unwrap().remove(&id);
                return Err(err);
            }
        };

        let pid = handle.pid().as_raw() as u32;
        handle.wait_until_running(pty::RUNNING_GRACE);
        drop(handle);

        session = self.store.update_session(&id, |s| {
            s.pid = Some(pid);
            s.status = SessionStatus::Running;
        })?;

        Ok(session)
    }

    /// Writes raw bytes into the session's `stdin` FIFO (spec §4.8 "input").
    pub fn input(&self, session_id: &str, data: &[u8]) -> AppResult<()> {
        let session = self.store.read_session(session_id)?;
        if session.status == SessionStatus::Exited {
            return Err(AppError::SessionExited);
        }
        let path = self.store.session_dir(session_id).join("stdin");
        let mut file = open_fifo_writer(&path).map_err(map_fifo_error)?;
        file.write_all(data)?;
        Ok(())
    }

    /// Sends `{"cmd":"resize",...}` over the control FIFO and durably updates
    /// the recorded dimensions (spec §4.8 "resize"; the PTY Host applies the
    /// ioctl and feeds the Terminal Emulator, but has no access to the
    /// session store to persist the new size itself).
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> AppResult<()> {
        let session = self.store.read_session(session_id)?;
        if session.status == SessionStatus::Exited {
            return Err(AppError::SessionExited);
        }
        let path = self.store.session_dir(session_id).join("control");
        let mut file = open_fifo_writer(&path).map_err(map_fifo_error)?;
        writeln!(file, r#"{{"cmd":"resize","cols":{cols},"rows":{rows}}}"#)?;
        self.store.update_session(session_id, |s| {
            s.cols = cols;
            s.rows = rows;
        })?;
        Ok(())
    }

    /// Sends `{"cmd":"kill",...}` over the control FIFO (spec §4.8 "kill").
    /// The actual SIGTERM→SIGKILL escalation happens inside the PTY Host's
    /// own control pump; this call only asks for it.
    pub fn kill(&self, session_id: &str, force: bool) -> AppResult<()> {
        let session = self.store.read_session(session_id)?;
        if session.status == SessionStatus::Exited {
            return Ok(());
        }
        let path = self.store.session_dir(session_id).join("control");
        let mut file = open_fifo_writer(&path).map_err(map_fifo_error)?;
        let signal = if force { "KILL" } else { "TERM" };
        writeln!(file, r#"{{"cmd":"kill","signal":"{signal}"}}"#)?;
        Ok(())
    }

    /// Deletes one exited session's directory (spec §4.8 "cleanup").
    pub fn cleanup(&self, session_id: &str) -> AppResult<()> {
        self.emulators.lock().unwrap().remove(session_id);
        self.store.delete_session(session_id)
    }

    /// Deletes every exited session's directory, returning the ids removed.
    pub fn cleanup_all_exited(&self) -> AppResult<Vec<String>> {
        let mut removed = Vec::new();
        for session in self.store.list_sessions()? {
            if session.status == SessionStatus::Exited {
                self.cleanup(&session.id)?;
                removed.push(session.id);
            }
        }
        Ok(removed)
    }

    /// Spawns the background zombie-reaping sweep (spec §4.8, §9). Runs once
    /// immediately, then every `ZOMBIE_SWEEP_INTERVAL`.
    #[must_use]
    pub fn spawn_zombie_reaper(&self) -> ZombieReaperHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let manager = self.clone();
        let handle = std::thread::spawn(move || {
            manager.reap_zombies();
            while !stop_clone.load(Ordering::Relaxed) {
                std::thread::sleep(ZOMBIE_SWEEP_INTERVAL);
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                manager.reap_zombies();
            }
        });
        ZombieReaperHandle { stop, handle: Some(handle) }
    }

    fn reap_zombies(&self) {
        let sessions = match self.store.list_sessions() {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "zombie reaper failed to list sessions");
                return;
            }
        };

        for session in sessions {
            if session.status == SessionStatus::Exited {
                continue;
            }
            let Some(pid) = session.pid else { continue };
            if process_is_alive(pid) {
                continue;
            }
            warn!(session_id = %session.id, pid, "reaping zombie session with no live process");
            self.emulators.lock().unwrap().remove(&session.id);
            let result = self.store.update_session(&session.id, |s| {
                s.status = SessionStatus::Exited;
                s.exit_code = Some(ZOMBIE_EXIT_CODE);
            });
            if let Err(err) = result {
                warn!(session_id = %session.id, error = %err, "failed to mark zombie session exited");
            }
        }
    }
}

pub struct ZombieReaperHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ZombieReaperHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn process_is_alive(pid: u32) -> bool {
    signal_kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Opens a FIFO for writing without blocking when no reader is attached
/// (a session whose PTY Host thread has already exited).
fn open_fifo_writer(path: &Path) -> io::Result<std::fs::File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

fn map_fifo_error(err: io::Error) -> AppError {
    if err.raw_os_error() == Some(libc::ENXIO) {
        AppError::SessionExited
    } else {
        AppError::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_empty_command() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(SessionStore::new(tmp.path().to_path_buf()));
        let err = manager
            .create(CreateSessionRequest {
                command: Vec::new(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn create_spawns_a_running_session_and_input_reaches_it() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(SessionStore::new(tmp.path().to_path_buf()));
        let session = manager
            .create(CreateSessionRequest {
                command: vec!["cat".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.pid.is_some());

        manager.input(&session.id, b"hello\n").unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let snapshot = manager.snapshot(&session.id).unwrap();
        let text: String = snapshot.grid[0]
            .iter()
            .map(|c| c.codepoint)
            .collect::<String>();
        assert!(text.contains("hello"));

        manager.kill(&session.id, true).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let after = manager.get(&session.id).unwrap();
        assert_eq!(after.status, SessionStatus::Exited);

        manager.cleanup(&session.id).unwrap();
        assert!(matches!(manager.get(&session.id).unwrap_err(), AppError::NotFound(_)));
    }

    #[test]
    fn create_threads_caller_supplied_env_into_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(SessionStore::new(tmp.path().to_path_buf()));
        let session = manager
            .create(CreateSessionRequest {
                command: vec!["sh".to_string(), "-c".to_string(), "echo $VIBETUNNEL_TEST_VAR".to_string()],
                env: vec![("VIBETUNNEL_TEST_VAR".to_string(), "injected".to_string())],
                ..Default::default()
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));

        let snapshot = manager.snapshot(&session.id);
        if let Ok(snapshot) = snapshot {
            let text: String = snapshot.grid[0].iter().map(|c| c.codepoint).collect();
            assert!(text.contains("injected"));
        }

        let _ = manager.kill(&session.id, true);
    }

    #[test]
    fn cleanup_all_exited_only_removes_exited_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(SessionStore::new(tmp.path().to_path_buf()));
        let session = manager
            .create(CreateSessionRequest {
                command: vec!["sleep".to_string(), "30".to_string()],
                ..Default::default()
            })
            .unwrap();

        let removed = manager.cleanup_all_exited().unwrap();
        assert!(removed.is_empty());
        assert!(manager.get(&session.id).is_ok());

        manager.kill(&session.id, true).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let removed = manager.cleanup_all_exited().unwrap();
        assert_eq!(removed, vec![session.id]);
    }
}
