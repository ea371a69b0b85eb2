pub mod models {
    pub mod climate;
    pub mod cloud;
}

pub mod bus;
pub mod client;
pub mod config;
pub mod discovery;
pub mod extract;
pub mod parse;
pub mod reconcile;
pub mod referential;
pub mod session;
pub mod store;
pub mod temperature;
pub mod topics;
pub mod translator;
pub mod services {
    pub mod bridge;
    pub mod poller;
    pub mod scheduler;
}

use crate::bus::MqttBus;
use crate::client::{CloudApi, CloudClient};
use crate::config::Config;
use crate::models::cloud::{InstallationId, InstallationSummary};
use crate::reconcile::Reconciler;
use crate::services::bridge::{Bridge, BridgeHandle};
use crate::services::poller::CloudPoller;
use crate::services::scheduler::{Scheduler, StopSignal};
use crate::session::SessionManager;
use crate::topics::Topics;
use log::{error, info, warn};
use std::sync::{Arc, mpsc};

/// Apply the installation filter. Unknown ids in the filter are reported and skipped.
fn select_installations(available: Vec<InstallationSummary>, wanted: Option<&[InstallationId]>) -> Vec<InstallationSummary> {
    let Some(wanted) = wanted else {
        return available;
    };
    for id in wanted {
        if !available.iter().any(|i| &i.id == id) {
            warn!("Installation {} is not on this account; skipping", id);
        }
    }
    available.into_iter().filter(|i| wanted.contains(&i.id)).collect()
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (poll={}s, live={}s, referential={}s, token_refresh={}s, grace={}s, confirm_updates={}, broker={}:{})",
        cfg.intervals.poll.as_secs(),
        cfg.intervals.live.as_secs(),
        cfg.intervals.referential.as_secs(),
        cfg.intervals.token_refresh.as_secs(),
        cfg.policy.grace.num_seconds(),
        cfg.policy.confirm_updates,
        cfg.mqtt.host,
        cfg.mqtt.port
    );

    // 2) Log in
    let api: Arc<dyn CloudApi> = Arc::new(CloudClient::new(&cfg.cloud));
    let session = Arc::new(SessionManager::new(
        api.clone(),
        cfg.credentials.clone(),
        cfg.max_login_failures,
    ));
    session
        .authenticate()
        .map_err(|e| format!("Cloud login failed: {}", e))?;
    info!("Authenticated to the cloud as {}", cfg.credentials.username);
    let poller = Arc::new(CloudPoller::new(api, session));

    // 3) Discover installations
    let listed = poller
        .list_installations()
        .map_err(|e| format!("Listing installations failed: {}", e))?;
    let installations = select_installations(listed, cfg.installations.as_deref());
    if installations.is_empty() {
        return Err("No installations to bridge; check the account and CLOUD_INSTALLATIONS".into());
    }
    for i in &installations {
        info!("Bridging installation {} ({})", i.id, i.name);
    }

    // 4) Mode codes
    let mut reconciler = Reconciler::new(cfg.policy);
    match poller.fetch_referential() {
        Ok(table) => {
            reconciler.set_referential(table);
        }
        Err(e) => warn!("Refs: initial load failed, using built-in mode codes: {}", e),
    }

    // 5) Bus
    let topics = Topics::new(&cfg.topic_prefix, &cfg.discovery_prefix, &cfg.node_id);
    let (handle, events) = BridgeHandle::channel();
    let (bus, bus_connected, mqtt_thread) = MqttBus::connect(&cfg.mqtt, topics.clone(), handle.clone())?;

    // 6) Timers, then the bridge loop until shutdown
    let (commands_tx, commands_rx) = mpsc::channel();
    let stop = StopSignal::new();
    let scheduler = Scheduler::start(
        poller,
        installations.into_iter().map(|i| i.id).collect(),
        cfg.intervals,
        bus_connected,
        handle,
        commands_rx,
        stop.clone(),
    )?;
    let bridge = Bridge::new(reconciler, topics, bus, commands_tx, stop, cfg.shutdown_timeout);
    let result = bridge.run(events);

    scheduler.stop();
    if mqtt_thread.join().is_err() {
        warn!("Bus: connection thread panicked");
    }
    result
}

fn main() {
    let loaded_env = match config::load_env_from_args(std::env::args_os().skip(1).map(|a| a.to_string_lossy().into_owned())) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "heatzone-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
