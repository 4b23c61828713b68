//! HQ/Remote Federation (C9, spec §4.9): one codebase, two roles.
//!
//! `RemoteRegistry` is the HQ-side state — registrations, health checks, and
//! the `/api/sessions` fan-out/merge and session-owner lookup the HTTP
//! surface uses to proxy session-scoped routes. `RemoteClient` is the
//! remote-side lifecycle: register on startup, deregister on shutdown, retry
//! registration with backoff while it hasn't succeeded.
//!
//! Grounded on the donor's `reqwest` (`json`, `blocking`) dependency, already
//! present in its `Cargo.toml` even though `tty-fwd` itself never federates —
//! this module is the first real consumer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use jiff::Timestamp;
use reqwest::blocking::Client;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::protocol::{RemoteRegistration, RemoteRegistrationPublic, Session, SessionSource};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const EVICT_AFTER_FAILURES: u32 = 3;
const FAN_OUT_TIMEOUT: Duration = Duration::from_secs(2);
const REGISTRATION_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// HQ-side registry of remotes (spec §3 `RemoteRegistration`, §4.9 HQ role).
#[derive(Clone)]
pub struct RemoteRegistry {
    inner: Arc<RwLock<HashMap<String, RemoteRegistration>>>,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A re-registration under the same id replaces the old entry, dropping
    /// whatever state it carried (the Open Question resolution spec §9
    /// leaves to the implementer).
    pub fn register(&self, registration: RemoteRegistration) {
        info!(remote_id = %registration.id, remote_name = %registration.name, "remote registered");
        self.inner
            .write()
            .unwrap()
            .insert(registration.id.clone(), registration);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.write().unwrap().remove(id).is_some();
        if removed {
            info!(remote_id = %id, "remote unregistered");
        }
        removed
    }

    #[must_use]
    pub fn list_public(&self) -> Vec<RemoteRegistrationPublic> {
        self.inner.read().unwrap().values().map(Into::into).collect()
    }

    fn snapshot(&self) -> Vec<RemoteRegistration> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Finds which remote (if any) owns `session_id`, from the cache of
    /// `ownedSessionIds` last populated by a fan-out or health check.
    #[must_use]
    pub fn find_owner(&self, session_id: &str) -> Option<RemoteRegistration> {
        self.inner
            .read()
            .unwrap()
            .values()
            .find(|r| r.owned_session_ids.iter().any(|id| id == session_id))
            .cloned()
    }

    /// Looks up a registered remote by its own id, used to route
    /// `POST /api/sessions {"remoteId":...}` to the remote that should own
    /// the new session (spec §4.8 "create").
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<RemoteRegistration> {
        self.inner.read().unwrap().get(id).cloned()
    }

    fn record_health_success(&self, id: &str, owned_session_ids: Vec<String>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(remote) = inner.get_mut(id) {
            remote.consecutive_failures = 0;
            remote.last_healthy = Timestamp::now();
            remote.owned_session_ids = owned_session_ids;
        }
    }

    /// Returns `true` if the remote should be evicted.
    fn record_health_failure(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(remote) = inner.get_mut(id) else {
            return false;
        };
        remote.consecutive_failures += 1;
        let evict = remote.consecutive_failures >= EVICT_AFTER_FAILURES;
        if evict {
            inner.remove(id);
        }
        evict
    }

    /// Spawns the HQ health-check loop (spec §4.9: every 15s, 3 consecutive
    /// failures evict). Each check also refreshes `ownedSessionIds` via
    /// `GET /api/sessions`, so `find_owner` stays current between explicit
    /// fan-out calls.
    #[must_use]
    pub fn spawn_health_checks(&self, client: Client) -> HealthCheckHandle {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let registry = self.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(HEALTH_CHECK_INTERVAL);
                for remote in registry.snapshot() {
                    registry.check_one(&client, &remote);
                }
            }
        });
        HealthCheckHandle { stop, handle: Some(handle) }
    }

    fn check_one(&self, client: &Client, remote: &RemoteRegistration) {
        let url = format!("{}/health", remote.base_url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .bearer_auth(&remote.bearer_token)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send();

        match response {
            Ok(resp) if resp.status().is_success() => {
                let owned = self.fetch_owned_sessions(client, remote);
                self.record_health_success(&remote.id, owned);
            }
            Ok(resp) => {
                warn!(remote_id = %remote.id, status = %resp.status(), "remote health check failed");
                if self.record_health_failure(&remote.id) {
                    warn!(remote_id = %remote.id, "remote evicted after repeated health-check failures");
                }
            }
            Err(err) => {
                warn!(remote_id = %remote.id, error = %err, "remote health check errored");
                if self.record_health_failure(&remote.id) {
                    warn!(remote_id = %remote.id, "remote evicted after repeated health-check failures");
                }
            }
        }
    }

    fn fetch_owned_sessions(&self, client: &Client, remote: &RemoteRegistration) -> Vec<String> {
        self.fetch_sessions(client, remote)
            .map(|sessions| sessions.into_iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    fn fetch_sessions(&self, client: &Client, remote: &RemoteRegistration) -> AppResult<Vec<Session>> {
        let url = format!("{}/api/sessions", remote.base_url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .bearer_auth(&remote.bearer_token)
            .timeout(FAN_OUT_TIMEOUT)
            .send()
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "remote {} returned {}",
                remote.id,
                response.status()
            )));
        }
        let sessions: Vec<Session> = response
            .json()
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        Ok(tag_as_remote(sessions, remote))
    }

    /// `GET /api/sessions` fan-out (spec §4.8/§4.9): concurrently queries
    /// every registered remote, tags each returned session with
    /// `source:"remote"` plus the owning remote's id/name/url, and merges
    /// with the caller-supplied local list. A remote that times out or
    /// errors contributes an empty set plus a logged warning rather than
    /// failing the whole call.
    #[must_use]
    pub fn fan_out_sessions(&self, client: &Client, local: Vec<Session>) -> Vec<Session> {
        let remotes = self.snapshot();
        let mut merged = local;

        std::thread::scope(|scope| {
            let handles: Vec<_> = remotes
                .iter()
                .map(|remote| scope.spawn(|| self.fetch_sessions(client, remote)))
                .collect();

            for (remote, handle) in remotes.iter().zip(handles) {
                match handle.join() {
                    Ok(Ok(sessions)) => merged.extend(sessions),
                    Ok(Err(err)) => {
                        warn!(remote_id = %remote.id, error = %err, "remote session fan-out failed");
                    }
                    Err(_) => {
                        warn!(remote_id = %remote.id, "remote session fan-out thread panicked");
                    }
                }
            }
        });

        merged
    }
}

fn tag_as_remote(sessions: Vec<Session>, remote: &RemoteRegistration) -> Vec<Session> {
    sessions
        .into_iter()
        .map(|mut s| {
            s.source = SessionSource::Remote;
            s.remote_id = Some(remote.id.clone());
            s.remote_name = Some(remote.name.clone());
            s.remote_url = Some(remote.base_url.clone());
            s
        })
        .collect()
}

pub struct HealthCheckHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for HealthCheckHandle {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Remote-side lifecycle (spec §4.9 remote role): register with HQ on
/// startup, keep retrying with capped exponential backoff until it
/// succeeds, and deregister on graceful shutdown.
pub struct RemoteClient {
    client: Client,
    hq_url: String,
    id: String,
    name: String,
    base_url: String,
    token: String,
}

impl RemoteClient {
    #[must_use]
    pub fn new(hq_url: String, id: String, name: String, base_url: String, token: String) -> Self {
        Self {
            client: Client::new(),
            hq_url,
            id,
            name,
            base_url,
            token,
        }
    }

    /// Blocks until registration succeeds, retrying with exponential backoff
    /// capped at 60s (spec §4.9).
    pub fn register_with_retry(&self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.try_register() {
                Ok(()) => {
                    info!(remote_id = %self.id, hq_url = %self.hq_url, "registered with HQ");
                    return;
                }
                Err(err) => {
                    warn!(remote_id = %self.id, error = %err, backoff_secs = backoff.as_secs(), "HQ registration failed, retrying");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(REGISTRATION_BACKOFF_CAP);
                }
            }
        }
    }

    fn try_register(&self) -> AppResult<()> {
        let url = format!("{}/api/remotes/register", self.hq_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "baseUrl": self.base_url,
            "token": self.token,
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::UpstreamUnavailable(format!(
                "HQ register returned {}",
                response.status()
            )))
        }
    }

    /// Best-effort `DELETE /api/remotes/:id` on graceful shutdown.
    pub fn deregister(&self) {
        let url = format!(
            "{}/api/remotes/{}",
            self.hq_url.trim_end_matches('/'),
            self.id
        );
        if let Err(err) = self.client.delete(&url).timeout(HEALTH_CHECK_TIMEOUT).send() {
            warn!(remote_id = %self.id, error = %err, "failed to deregister from HQ");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registration(id: &str) -> RemoteRegistration {
        RemoteRegistration {
            id: id.to_string(),
            name: format!("remote-{id}"),
            base_url: format!("http://remote-{id}.internal"),
            bearer_token: "secret".to_string(),
            last_healthy: Timestamp::now(),
            owned_session_ids: Vec::new(),
            consecutive_failures: 0,
        }
    }

    #[test]
    fn register_then_find_owner_by_cached_sessions() {
        let registry = RemoteRegistry::new();
        let mut reg = sample_registration("r1");
        reg.owned_session_ids = vec!["s1".to_string()];
        registry.register(reg);

        let owner = registry.find_owner("s1").unwrap();
        assert_eq!(owner.id, "r1");
        assert!(registry.find_owner("unknown").is_none());
    }

    #[test]
    fn re_registration_replaces_old_entry() {
        let registry = RemoteRegistry::new();
        let mut first = sample_registration("r1");
        first.owned_session_ids = vec!["old-session".to_string()];
        registry.register(first);

        let second = sample_registration("r1");
        registry.register(second);

        assert!(registry.find_owner("old-session").is_none());
    }

    #[test]
    fn three_consecutive_failures_evicts_remote() {
        let registry = RemoteRegistry::new();
        registry.register(sample_registration("r1"));

        assert!(!registry.record_health_failure("r1"));
        assert!(!registry.record_health_failure("r1"));
        assert!(registry.record_health_failure("r1"));
        assert!(registry.list_public().is_empty());
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = RemoteRegistry::new();
        registry.register(sample_registration("r1"));
        assert!(registry.unregister("r1"));
        assert!(!registry.unregister("r1"));
    }

    #[test]
    fn tag_as_remote_overwrites_source_fields() {
        let remote = sample_registration("r1");
        let session = Session::new_starting(
            "s1".to_string(),
            vec!["bash".to_string()],
            "/tmp".to_string(),
            "xterm".to_string(),
            80,
            24,
        );
        let tagged = tag_as_remote(vec![session], &remote);
        assert_eq!(tagged[0].source, SessionSource::Remote);
        assert_eq!(tagged[0].remote_id.as_deref(), Some("r1"));
    }
}
