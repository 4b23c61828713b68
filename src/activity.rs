//! Activity Monitor (C7, spec §4.7): one global poller that derives
//! `isActive` purely from `stream-out` file-size growth, so it works for
//! sessions created by other processes too (e.g. `fwd`, spec §4.7 rationale).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use tracing::warn;

use crate::protocol::{ActivityStatus, SessionInfo};
use crate::store::SessionStore;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUIESCENCE_WINDOW: Duration = Duration::from_millis(500);

struct Tracked {
    last_size: u64,
    last_growth: Instant,
    is_active: bool,
}

/// Runs on a dedicated background thread for the lifetime of the process
/// (spec §9: "one activity monitor", constructed once at startup).
pub struct ActivityMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActivityMonitor {
    #[must_use]
    pub fn spawn(store: SessionStore) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || run(&store, &stop_clone));
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(store: &SessionStore, stop: &AtomicBool) {
    let mut tracked: HashMap<String, Tracked> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(POLL_INTERVAL);
        tick(store, &mut tracked);
    }
}

fn tick(store: &SessionStore, tracked: &mut HashMap<String, Tracked>) {
    let sessions = match store.list_sessions() {
        Ok(sessions) => sessions,
        Err(err) => {
            warn!(error = %err, "activity monitor failed to list sessions");
            return;
        }
    };

    let now = Instant::now();
    let seen: std::collections::HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();
    tracked.retain(|id, _| seen.contains(id));

    for session in sessions {
        let stream_out = store.session_dir(&session.id).join("stream-out");
        let Ok(metadata) = std::fs::metadata(&stream_out) else {
            continue;
        };
        let size = metadata.len();

        let entry = tracked.entry(session.id.clone()).or_insert_with(|| Tracked {
            last_size: size,
            last_growth: now,
            is_active: false,
        });

        let grew = size > entry.last_size;
        if grew {
            entry.last_size = size;
            entry.last_growth = now;
        }

        let should_be_active = now.duration_since(entry.last_growth) < QUIESCENCE_WINDOW;
        let changed = should_be_active != entry.is_active;
        if changed || grew {
            entry.is_active = should_be_active;
            let status = ActivityStatus {
                is_active: should_be_active,
                timestamp: Timestamp::now(),
                session: SessionInfo {
                    id: session.id.clone(),
                    name: session.name.clone(),
                    status: session.status,
                },
            };
            if let Ok(value) = serde_json::to_value(&status) {
                if let Err(err) = store.write_activity(&session.id, &value) {
                    warn!(session_id = %session.id, error = %err, "failed to write activity.json");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Session;
    use std::io::Write;

    #[test]
    fn marks_active_on_growth_and_inactive_after_quiescence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        let session = Session::new_starting(
            "s1".to_string(),
            vec!["bash".to_string()],
            "/tmp".to_string(),
            "xterm-256color".to_string(),
            80,
            24,
        );
        store.create_session_dir(&session).unwrap();
        let stream_out = store.session_dir("s1").join("stream-out");
        std::fs::File::create(&stream_out).unwrap();

        let mut tracked = HashMap::new();
        tick(&store, &mut tracked);
        assert!(!tracked.get("s1").unwrap().is_active);

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&stream_out).unwrap();
            writeln!(f, "data").unwrap();
        }
        tick(&store, &mut tracked);
        assert!(tracked.get("s1").unwrap().is_active);
    }

    #[test]
    fn removes_tracking_for_deleted_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        let mut tracked = HashMap::new();
        tracked.insert(
            "ghost".to_string(),
            Tracked {
                last_size: 0,
                last_growth: Instant::now(),
                is_active: true,
            },
        );
        tick(&store, &mut tracked);
        assert!(tracked.is_empty());
    }
}
