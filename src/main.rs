//! `vibetunneld`: the HTTP/WS/SSE server binding Session Store, PTY Host,
//! Terminal Emulator, Stream Watcher, Buffer Aggregator, Activity Monitor,
//! Session Manager, and HQ/Remote Federation to the wire (spec §6, §9
//! "construct once at startup, thread them through, shut down in reverse
//! order").

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vibetunnel::activity::ActivityMonitor;
use vibetunnel::aggregator::BufferAggregator;
use vibetunnel::auth::{Authenticator, BasicAuthenticator, NoAuthenticator};
use vibetunnel::config::{Config, Mode};
use vibetunnel::manager::SessionManager;
use vibetunnel::remote::{RemoteClient, RemoteRegistry};
use vibetunnel::server::{self, AppState};
use vibetunnel::store::SessionStore;
use vibetunnel::utils::init_tracing;
use vibetunnel::watcher::StreamWatcher;

fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.control_dir)
        .with_context(|| format!("failed to create control dir {:?}", config.control_dir))?;

    info!(
        control_dir = %config.control_dir.display(),
        mode = ?config.mode,
        "starting vibetunneld",
    );

    let store = SessionStore::new(config.control_dir.clone());
    let manager = SessionManager::new(store.clone());
    let watcher = StreamWatcher::new();
    let aggregator = BufferAggregator::new();
    let authenticator = build_authenticator(&config);

    // One global instance each (spec §9), kept alive for the process's
    // lifetime by staying bound in `main`'s own scope.
    let _activity_monitor = ActivityMonitor::spawn(store.clone());
    let _zombie_reaper = manager.spawn_zombie_reaper();

    let fanout_manager = manager.clone();
    let _fanout_handle = aggregator.spawn_fanout(move |id| fanout_manager.emulator(id));

    let http_client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let mut remotes = None;
    let mut _health_check_handle = None;
    let mut _remote_client = None;

    match config.mode.clone() {
        Mode::Hq => {
            let registry = RemoteRegistry::new();
            _health_check_handle = Some(registry.spawn_health_checks(http_client.clone()));
            remotes = Some(registry);
        }
        Mode::Remote { hq_url, name, token } => {
            let base_url = remote_base_url(&config);
            let id = uuid::Uuid::new_v4().to_string();
            info!(remote_id = %id, %base_url, %hq_url, "running in remote mode");
            let client = Arc::new(RemoteClient::new(hq_url, id, name, base_url, token));
            let register_client = client.clone();
            std::thread::spawn(move || register_client.register_with_retry());
            spawn_deregister_on_signal(client.clone());
            _remote_client = Some(client);
        }
        Mode::Normal => {}
    }

    let state = AppState {
        manager,
        watcher,
        aggregator,
        authenticator,
        remotes,
        http_client,
    };

    server::serve(&config.bind_address(), state).context("server failed")
}

/// Builds the `Authenticator` the HTTP surface consumes (expansion §10.3).
/// `--enable-ssh-keys`/`--disallow-user-password` are parsed and threaded
/// through the config so a caller embedding this crate can read them, but
/// this crate ships no SSH-key verifier — that validation logic is the
/// out-of-scope external collaborator spec §1 names.
fn build_authenticator(config: &Config) -> Arc<dyn Authenticator> {
    let auth = &config.auth;
    if auth.enable_ssh_keys || auth.disallow_user_password {
        warn!(
            "--enable-ssh-keys/--disallow-user-password set but this build has no SSH-key \
             verifier wired in; supply a custom Authenticator to honor them"
        );
    }
    if auth.no_auth {
        return Arc::new(NoAuthenticator);
    }
    match &auth.password {
        Some(password) => Arc::new(BasicAuthenticator::new(
            password.clone(),
            auth.allow_local_bypass,
            auth.local_auth_token.clone(),
        )),
        None => {
            warn!("no --password configured and --no-auth not set; allowing all requests");
            Arc::new(NoAuthenticator)
        }
    }
}

/// The URL this server advertises to HQ on registration. There's no
/// dedicated flag for it in spec §6's configuration table, so `--bind`
/// being a wildcard address is resolved to a loopback URL and an explicit
/// override is read from `VIBETUNNEL_BASE_URL` for the real multi-host
/// case (see DESIGN.md for this Open Question's resolution).
fn remote_base_url(config: &Config) -> String {
    if let Ok(url) = std::env::var("VIBETUNNEL_BASE_URL") {
        return url;
    }
    let host = if config.bind == "0.0.0.0" || config.bind == "::" {
        "127.0.0.1"
    } else {
        config.bind.as_str()
    };
    format!("http://{host}:{}", config.port)
}

fn spawn_deregister_on_signal(client: Arc<RemoteClient>) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            warn!(error = %err, "failed to install signal handler for HQ deregistration");
            return;
        }
    };
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("shutting down, deregistering from HQ");
            client.deregister();
            std::process::exit(0);
        }
    });
}
