//! Standalone relay supervisor daemon. The source tree, stats, and YP
//! subsystems this normally runs against are provided by the rest of the
//! streaming server; here they're stood up as minimal in-process stand-ins
//! so the supervisor loop can run on its own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use relay_core::{
    ConfigSource, MasterConfig, RelayConfig, RelayTemplate, SourceHandle, SourceRegistry,
    StatsSink, Supervisor, YpDirectory,
};
use tokio::sync::Mutex;

struct MemorySourceRegistry {
    sources: Mutex<HashMap<String, SourceHandle>>,
}

impl MemorySourceRegistry {
    fn new() -> Self {
        MemorySourceRegistry { sources: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl SourceRegistry for MemorySourceRegistry {
    async fn reserve(&self, local_mount: &str) -> Option<SourceHandle> {
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

    async fn move_clients(&self, from: &SourceHandle, to: &SourceHandle) {
        info!("moving clients from \"{}\" to \"{}\"", from.name(), to.name());
    }

    async fn recheck_mounts(&self) {}

    async fn refresh_mount_settings(&self, _local_mount: &str) {}

    async fn pump(&self, handle: &SourceHandle) {
        while handle.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

struct LoggingStatsSink;

#[async_trait]
impl StatsSink for LoggingStatsSink {
    async fn inc_relay_connections(&self) {}
    async fn set_source_ip(&self, local_mount: &str, ip: &str) {
        info!("source \"{}\" connected from {}", local_mount, ip);
    }
    async fn set_listeners(&self, _local_mount: &str, _count: u64) {}
    async fn clear(&self, local_mount: &str) {
        info!("clearing stats for \"{}\"", local_mount);
    }
}

struct NoopYpDirectory;

#[async_trait]
impl YpDirectory for NoopYpDirectory {
    async fn remove(&self, _local_mount: &str) {}
}

/// Reads relay configuration from the process environment, mirroring the
/// handful of `RELAY_*` variables a packaged deployment would set.
struct EnvConfigSource;

#[async_trait]
impl ConfigSource for EnvConfigSource {
    async fn snapshot(&self) -> RelayConfig {
        let hostname = std::env::var("RELAY_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let master_server = std::env::var("RELAY_MASTER_SERVER").ok();

        let master = MasterConfig {
            master_server,
            master_server_port: env_u16("RELAY_MASTER_PORT", 8000),
            master_ssl_port: env_u16("RELAY_MASTER_SSL_PORT", 0),
            master_username: std::env::var("RELAY_MASTER_USER").ok(),
            master_password: std::env::var("RELAY_MASTER_PASS").ok(),
            master_relay_auth: env_bool("RELAY_MASTER_RELAY_AUTH", false),
            master_update_interval: env_u64("RELAY_MASTER_UPDATE_INTERVAL", 120),
            master_redirect_port: env_u16("RELAY_REDIRECT_PORT", 0),
            verify_master_tls: env_bool("RELAY_VERIFY_MASTER_TLS", false),
        };

        let relays = match (std::env::var("RELAY_STATIC_SERVER"), std::env::var("RELAY_STATIC_MOUNT")) {
            (Ok(server), Ok(mount)) => vec![RelayTemplate {
                server,
                port: env_u16("RELAY_STATIC_PORT", 8000),
                mount: mount.clone(),
                local_mount: mount,
                username: None,
                password: None,
                mp3_metadata: true,
                on_demand: false,
                enable: true,
                fallback_mount: None,
                fallback_override: false,
            }],
            _ => Vec::new(),
        };

        RelayConfig { hostname, relays, on_demand: env_bool("RELAY_ON_DEMAND", false), master }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(EnvConfigSource),
        Arc::new(MemorySourceRegistry::new()),
        Arc::new(LoggingStatsSink),
        Arc::new(NoopYpDirectory),
    ));

    info!("starting relay supervisor");
    let handle = supervisor.clone().run().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        info!("failed to listen for ctrl-c: {}", e);
    }

    info!("shutdown requested, draining relays");
    supervisor.request_shutdown();
    let _ = handle.await;
    info!("relay supervisor stopped");
}
