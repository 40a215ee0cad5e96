// Integration tests for the relay supervisor
//
// These drive `Supervisor::tick()` directly against hand-written fake
// collaborators, exercising the reconcile/start/cleanup cycle end to end
// without a real upstream or source tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{
    ConfigSource, MasterConfig, RelayConfig, RelayListKind, RelayTemplate, SourceHandle,
    SourceRegistry, StatsSink, Supervisor, YpDirectory,
};
use tokio::sync::Mutex;

struct FakeRegistry {
    sources: Mutex<HashMap<String, SourceHandle>>,
    reserve_calls: AtomicUsize,
}

impl FakeRegistry {
    fn new() -> Self {
        FakeRegistry { sources: Mutex::new(HashMap::new()), reserve_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl SourceRegistry for FakeRegistry {
    async fn reserve(&self, local_mount: &str) -> Option<SourceHandle> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        let mut sources = self.sources.lock().await;
        if sources.contains_key(local_mount) {
            return None;
        }
        let handle = SourceHandle::new(local_mount.to_string());
        sources.insert(local_mount.to_string(), handle.clone());
        Some(handle)
    }

    async fn free(&self, handle: SourceHandle) {
        self.sources.lock().await.remove(handle.name());
    }

    async fn find(&self, local_mount: &str) -> Option<SourceHandle> {
        self.sources.lock().await.get(local_mount).cloned()
    }

    async fn move_clients(&self, _from: &SourceHandle, _to: &SourceHandle) {}

    async fn recheck_mounts(&self) {}

    async fn refresh_mount_settings(&self, _local_mount: &str) {}

    async fn pump(&self, handle: &SourceHandle) {
        // A relay with no real upstream connects, then the pump returns
        // immediately (nothing to stream), same as a fallback-free dead
        // relay in the real server.
        handle.set_running(false);
    }
}

struct FakeStats {
    cleared: Mutex<Vec<String>>,
}

impl FakeStats {
    fn new() -> Self {
        FakeStats { cleared: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl StatsSink for FakeStats {
    async fn inc_relay_connections(&self) {}
    async fn set_source_ip(&self, _local_mount: &str, _ip: &str) {}
    async fn set_listeners(&self, _local_mount: &str, _count: u64) {}
    async fn clear(&self, local_mount: &str) {
        self.cleared.lock().await.push(local_mount.to_string());
    }
}

struct FakeYp;

#[async_trait]
impl YpDirectory for FakeYp {
    async fn remove(&self, _local_mount: &str) {}
}

struct FakeConfigSource {
    config: Mutex<RelayConfig>,
}

impl FakeConfigSource {
    fn new(config: RelayConfig) -> Self {
        FakeConfigSource { config: Mutex::new(config) }
    }

    async fn set(&self, config: RelayConfig) {
        *self.config.lock().await = config;
    }
}

#[async_trait]
impl ConfigSource for FakeConfigSource {
    async fn snapshot(&self) -> RelayConfig {
        self.config.lock().await.clone()
    }
}

fn relay_template(local_mount: &str) -> RelayTemplate {
    RelayTemplate {
        // Port 1 on loopback refuses immediately, so a worker's connect
        // attempt fails fast instead of hanging on a real DNS lookup.
        server: "127.0.0.1".into(),
        port: 1,
        mount: local_mount.into(),
        local_mount: local_mount.into(),
        username: None,
        password: None,
        mp3_metadata: true,
        on_demand: false,
        enable: true,
        fallback_mount: None,
        fallback_override: false,
    }
}

fn base_config(relays: Vec<RelayTemplate>) -> RelayConfig {
    RelayConfig {
        hostname: "host.example.com".into(),
        relays,
        on_demand: false,
        master: MasterConfig::default(),
    }
}

#[tokio::test]
async fn test_static_relay_is_reserved_and_started() {
    let config_source = Arc::new(FakeConfigSource::new(base_config(vec![relay_template("/live")])));
    let registry = Arc::new(FakeRegistry::new());
    let supervisor = Arc::new(Supervisor::new(
        config_source,
        registry.clone(),
        Arc::new(FakeStats::new()),
        Arc::new(FakeYp),
    ));

    supervisor.tick().await;
    // Give the detached worker task a chance to run to completion.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let info = supervisor.find_relay(RelayListKind::Static, "/live").await;
    assert!(info.is_some(), "relay should be tracked after the first tick");
    assert_eq!(registry.reserve_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_worker_resets_running_so_it_can_reconnect() {
    // Port 1 on loopback refuses immediately, so the worker fails fast and
    // signals completion back through the shared runtime.
    let config_source = Arc::new(FakeConfigSource::new(base_config(vec![relay_template("/live")])));
    let supervisor = Arc::new(Supervisor::new(
        config_source,
        Arc::new(FakeRegistry::new()),
        Arc::new(FakeStats::new()),
        Arc::new(FakeYp),
    ));

    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let first = supervisor.find_relay(RelayListKind::Static, "/live").await.unwrap();
    assert!(first.running, "the worker is marked running as soon as it's spawned");

    // The completion sweep on this tick should observe the worker's
    // failure and clear `running`, letting the next tick restart it.
    supervisor.rescan();
    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    supervisor.rescan();
    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let restarted = supervisor.find_relay(RelayListKind::Static, "/live").await.unwrap();
    assert!(restarted.running, "a failed relay worker must be restarted, not left permanently stopped");
}

#[tokio::test]
async fn test_config_removal_cleans_up_relay() {
    let config_source = Arc::new(FakeConfigSource::new(base_config(vec![relay_template("/live")])));
    let stats = Arc::new(FakeStats::new());
    let supervisor = Arc::new(Supervisor::new(
        config_source.clone(),
        Arc::new(FakeRegistry::new()),
        stats.clone(),
        Arc::new(FakeYp),
    ));

    supervisor.recheck_mounts();
    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(supervisor.find_relay(RelayListKind::Static, "/live").await.is_some());

    config_source.set(base_config(vec![])).await;
    supervisor.recheck_mounts();
    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(supervisor.find_relay(RelayListKind::Static, "/live").await.is_none());
}

#[tokio::test]
async fn test_on_demand_relay_does_not_start_without_listener_demand() {
    let mut template = relay_template("/live");
    template.on_demand = true;
    let config_source = Arc::new(FakeConfigSource::new(base_config(vec![template])));
    let registry = Arc::new(FakeRegistry::new());
    let supervisor = Arc::new(Supervisor::new(
        config_source,
        registry,
        Arc::new(FakeStats::new()),
        Arc::new(FakeYp),
    ));

    supervisor.tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let info = supervisor.find_relay(RelayListKind::Static, "/live").await.unwrap();
    assert!(!info.running, "an on-demand relay with no fallback override must stay idle");
}

#[tokio::test]
async fn test_slave_host_table_redirects_round_trip() {
    let config_source = Arc::new(FakeConfigSource::new(base_config(vec![])));
    let supervisor = Arc::new(Supervisor::new(
        config_source,
        Arc::new(FakeRegistry::new()),
        Arc::new(FakeStats::new()),
        Arc::new(FakeYp),
    ));

    assert!(supervisor.host_add("relay.example.com:8010").await);
    assert_eq!(supervisor.slave_count(), 1);

    let location = supervisor.redirect("/live").await.expect("one known slave host");
    assert_eq!(location, "http://relay.example.com:8010/live");

    assert!(supervisor.host_remove("relay.example.com:8010").await);
    assert_eq!(supervisor.slave_count(), 0);
}
