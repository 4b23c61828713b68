//! Stream Watcher (C5, spec §4.5): one tailer per session, fanning parsed
//! `CastRecord`s out to however many SSE subscribers are attached.
//!
//! Tailing is pure size-polling (spec: "platform-agnostic polling (~50ms)
//! ... inotify/kqueue is permissible but MUST NOT be required") — this
//! crate does not depend on `notify` at all, so there's exactly one tailing
//! strategy instead of two code paths.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::protocol::CastRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One message delivered to an SSE subscriber's send loop.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Header(String),
    Record(CastRecord),
    Heartbeat,
}

/// Identifies one subscriber within a session's tailer, used by
/// `unsubscribe` to name exactly which entry to remove.
pub type SubscriberId = u64;

struct Tailer {
    subscribers: Vec<(SubscriberId, Sender<WatchEvent>)>,
}

/// An active SSE subscription. Wraps the `Receiver<WatchEvent>` the caller's
/// send loop reads from; dropping it synchronously deregisters the
/// subscriber (spec §5: "subscriber unregistration is synchronous"), the
/// same Drop-based cleanup discipline `pty::RawModeGuard` and the zombie
/// reaper/health-check handles already use in this crate.
pub struct Subscription {
    watcher: StreamWatcher,
    session_id: String,
    id: SubscriberId,
    rx: Receiver<WatchEvent>,
}

impl Subscription {
    #[must_use]
    pub fn receiver(&self) -> &Receiver<WatchEvent> {
        &self.rx
    }
}

impl Iterator for Subscription {
    type Item = WatchEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.watcher.unsubscribe(&self.session_id, self.id);
    }
}

/// Holds one tailer thread per actively-watched session, refcounted by
/// subscriber count (spec: "on subscriber disconnect ... refcount-drop the
/// tailer, stopping file watching when zero").
#[derive(Clone)]
pub struct StreamWatcher {
    tailers: Arc<Mutex<HashMap<String, Tailer>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for StreamWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tailers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribes to `session_id`'s `stream-out`, replaying existing
    /// content with timestamps rewritten to 0 before switching to live
    /// tailing. Returns a `Subscription` the caller's SSE handler iterates
    /// for events; dropping it deregisters the subscriber.
    pub fn subscribe(&self, session_id: &str, stream_out: PathBuf) -> AppResult<Subscription> {
        let (tx, rx) = std::sync::mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let is_first = {
            let mut tailers = self.tailers.lock().unwrap();
            match tailers.get_mut(session_id) {
                Some(tailer) => {
                    tailer.subscribers.push((id, tx.clone()));
                    false
                }
                None => {
                    tailers.insert(
                        session_id.to_string(),
                        Tailer {
                            subscribers: vec![(id, tx.clone())],
                        },
                    );
                    true
                }
            }
        };

        replay_from_start(&stream_out, &tx)?;

        if is_first {
            let tailers = self.tailers.clone();
            let session_id = session_id.to_string();
            std::thread::spawn(move || tail_loop(&session_id, &stream_out, &tailers));
        }

        Ok(Subscription {
            watcher: self.clone(),
            session_id: session_id.to_string(),
            id,
            rx,
        })
    }

    /// Removes one subscriber by id; when a session's subscriber list
    /// becomes empty the background tailer notices on its next poll and
    /// exits. Called synchronously from `Subscription`'s `Drop` impl
    /// (spec §5: "subscriber unregistration is synchronous").
    fn unsubscribe(&self, session_id: &str, id: SubscriberId) {
        let mut tailers = self.tailers.lock().unwrap();
        if let Some(tailer) = tailers.get_mut(session_id) {
            tailer.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

fn replay_from_start(path: &std::path::Path, tx: &Sender<WatchEvent>) -> AppResult<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(AppError::IoError(e)),
    };
    let mut reader = BufReader::new(file);

    let mut header_line = String::new();
    let header_len = reader.read_line(&mut header_line)?;
    if header_len > 0 {
        let _ = tx.send(WatchEvent::Header(header_line.trim_end().to_string()));
    }

    let mut offset = header_len as u64;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        offset += n as u64;
        if let Some(record) = CastRecord::parse_line(line.trim_end()) {
            let rewritten = record.with_time(0.0);
            if tx.send(WatchEvent::Record(rewritten)).is_err() {
                break;
            }
            if record.is_exit() {
                break;
            }
        }
    }
    Ok(offset)
}

fn tail_loop(session_id: &str, path: &std::path::Path, tailers: &Arc<Mutex<HashMap<String, Tailer>>>) {
    let mut offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut last_heartbeat = Instant::now();
    let mut exited = false;

    while !exited {
        std::thread::sleep(POLL_INTERVAL);

        {
            let tailers_guard = tailers.lock().unwrap();
            match tailers_guard.get(session_id) {
                Some(tailer) if !tailer.subscribers.is_empty() => {}
                _ => {
                    debug!(session_id, "stream watcher tailer stopping, no subscribers left");
                    break;
                }
            }
        }

        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        let len = metadata.len();
        if len > offset {
            if let Ok(mut file) = File::open(path) {
                if file.seek(SeekFrom::Start(offset)).is_ok() {
                    let mut buf = String::new();
                    if std::io::Read::by_ref(&mut file)
                        .take(len - offset)
                        .read_to_string(&mut buf)
                        .is_ok()
                    {
                        for line in buf.lines() {
                            if let Some(record) = CastRecord::parse_line(line) {
                                let is_exit = record.is_exit();
                                broadcast(tailers, session_id, WatchEvent::Record(record));
                                if is_exit {
                                    exited = true;
                                }
                            }
                        }
                    }
                }
            }
            offset = len;
            last_heartbeat = Instant::now();
        } else if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            broadcast(tailers, session_id, WatchEvent::Heartbeat);
            last_heartbeat = Instant::now();
        }
    }

    tailers.lock().unwrap().remove(session_id);
}

fn broadcast(tailers: &Arc<Mutex<HashMap<String, Tailer>>>, session_id: &str, event: WatchEvent) {
    let mut tailers_guard = tailers.lock().unwrap();
    if let Some(tailer) = tailers_guard.get_mut(session_id) {
        tailer
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn subscribe_replays_header_and_rewrites_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stream-out");
        {
            let mut file = File::create(&path).unwrap();
            writeln!(file, r#"{{"version":2,"width":80,"height":24,"timestamp":0,"env":{{}}}}"#).unwrap();
            writeln!(file, r#"[5.0,"o","hi"]"#).unwrap();
        }

        let watcher = StreamWatcher::new();
        let sub = watcher.subscribe("s1", path).unwrap();
        let rx = sub.receiver();

        let header = rx.recv().unwrap();
        assert!(matches!(header, WatchEvent::Header(_)));

        let record = rx.recv().unwrap();
        match record {
            WatchEvent::Record(CastRecord::Output { time, .. }) => assert_eq!(time, 0.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn subscribe_to_missing_file_yields_no_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing-stream-out");
        let watcher = StreamWatcher::new();
        let sub = watcher.subscribe("s2", path).unwrap();
        assert!(sub.receiver().try_recv().is_err());
    }

    #[test]
    fn dropping_a_subscription_removes_only_that_subscriber() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stream-out");
        File::create(&path).unwrap();

        let watcher = StreamWatcher::new();
        let sub_a = watcher.subscribe("s3", path.clone()).unwrap();
        let id_a = sub_a.id;
        let sub_b = watcher.subscribe("s3", path).unwrap();

        drop(sub_a);

        {
            let tailers = watcher.tailers.lock().unwrap();
            let tailer = tailers.get("s3").unwrap();
            assert_eq!(tailer.subscribers.len(), 1);
            assert!(tailer.subscribers.iter().all(|(id, _)| *id != id_a));
        }

        drop(sub_b);
    }
}
