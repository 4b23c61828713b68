//! Buffer Aggregator (C6, spec §4.6): debounced binary viewport fan-out to
//! WebSocket clients subscribed to one or more sessions.
//!
//! One global instance (spec §9 "global state"). A single background thread
//! ticks roughly every 16ms, re-encoding the snapshot for every session that
//! has at least one subscriber and `Emulator::should_emit()` returns true,
//! then pushes the framed payload to each subscriber's bounded channel.
//! `try_send` on a full channel drops the frame rather than queuing it
//! (spec: "never queued unboundedly; the next tick will carry a fresher
//! snapshot") — that bound is this crate's high-water mark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer;
use crate::emulator::Emulator;

const TICK: Duration = Duration::from_millis(16);
/// Per-client outbound queue depth before frames start dropping.
const HIGH_WATER_MARK: usize = 4;

pub type ClientId = u64;

struct Inner {
    /// sessionId -> clientId -> outbound channel.
    subscriptions: Mutex<HashMap<String, HashMap<ClientId, SyncSender<Vec<u8>>>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct BufferAggregator {
    inner: Arc<Inner>,
}

impl Default for BufferAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Allocates a fresh client id for a newly-accepted WebSocket connection.
    /// The connection's outbound channels are created per-subscription by
    /// `subscribe`.
    #[must_use]
    pub fn new_client_id(&self) -> ClientId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribes `client` to `session_id`'s buffer updates.
    pub fn subscribe(&self, client: ClientId, session_id: &str) -> Receiver<Vec<u8>> {
        let (tx, rx) = sync_channel(HIGH_WATER_MARK);
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .insert(client, tx);
        rx
    }

    pub fn unsubscribe(&self, client: ClientId, session_id: &str) {
        let mut subs = self.inner.subscriptions.lock().unwrap();
        if let Some(clients) = subs.get_mut(session_id) {
            clients.remove(&client);
            if clients.is_empty() {
                subs.remove(session_id);
            }
        }
    }

    /// Removes `client` from every session it was subscribed to (spec §5:
    /// "subscriber unregistration is synchronous").
    pub fn unsubscribe_all(&self, client: ClientId) {
        let mut subs = self.inner.subscriptions.lock().unwrap();
        subs.retain(|_, clients| {
            clients.remove(&client);
            !clients.is_empty()
        });
    }

    fn subscribed_sessions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().unwrap().keys().cloned().collect()
    }

    fn push_frame(&self, session_id: &str, frame: &[u8]) {
        let subs = self.inner.subscriptions.lock().unwrap();
        if let Some(clients) = subs.get(session_id) {
            for tx in clients.values() {
                // Backpressure policy: drop rather than block or queue.
                let _ = tx.try_send(frame.to_vec());
            }
        }
    }

    /// Spawns the debounce-and-fan-out thread. `lookup` resolves a session id
    /// to its live `Emulator`, normally backed by the Session Manager.
    pub fn spawn_fanout<F>(&self, lookup: F) -> FanoutHandle
    where
        F: Fn(&str) -> Option<Arc<Emulator>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let aggregator = self.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                std::thread::sleep(TICK);
                for session_id in aggregator.subscribed_sessions() {
                    let Some(emulator) = lookup(&session_id) else {
                        continue;
                    };
                    if !emulator.should_emit() {
                        continue;
                    }
                    emulator.take_dirty();
                    let snapshot = emulator.snapshot();
                    let payload = buffer::encode(&snapshot);
                    let frame = buffer::wrap_frame(&session_id, &payload);
                    aggregator.push_frame(&session_id, &frame);
                }
            }
        });
        FanoutHandle { stop, handle: Some(handle) }
    }
}

pub struct FanoutHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for FanoutHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BufferSnapshot;

    #[test]
    fn subscribe_then_unsubscribe_removes_empty_session_entry() {
        let aggregator = BufferAggregator::new();
        let _rx = aggregator.subscribe(1, "s1");
        assert_eq!(aggregator.subscribed_sessions(), vec!["s1".to_string()]);
        aggregator.unsubscribe(1, "s1");
        assert!(aggregator.subscribed_sessions().is_empty());
    }

    #[test]
    fn unsubscribe_all_clears_every_session() {
        let aggregator = BufferAggregator::new();
        let _a = aggregator.subscribe(1, "s1");
        let _b = aggregator.subscribe(1, "s2");
        aggregator.unsubscribe_all(1);
        assert!(aggregator.subscribed_sessions().is_empty());
    }

    #[test]
    fn push_frame_drops_when_receiver_is_full() {
        let aggregator = BufferAggregator::new();
        let rx = aggregator.subscribe(1, "s1");
        for _ in 0..(HIGH_WATER_MARK + 2) {
            aggregator.push_frame("s1", b"frame");
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= HIGH_WATER_MARK);
    }

    #[test]
    fn emulator_snapshot_encodes_without_panicking() {
        let emulator = Emulator::new(10, 2);
        emulator.feed(b"hi");
        let snap: BufferSnapshot = emulator.snapshot();
        let _ = buffer::encode(&snap);
    }
}
