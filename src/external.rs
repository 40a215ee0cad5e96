//! Traits for the collaborators this subsystem treats as external: the
//! source tree / name-reservation registry, the stats subsystem, and the
//! YP directory. The HTTP/ICY parser, the audio pump, and listener-facing
//! HTTP serving live behind these same traits at the points the relay core
//! actually touches them (`reserve`, `find`, `move_clients`, `pump`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// A reservation in the server's global source tree. Cheap to clone: every
/// clone refers to the same underlying slot.
#[derive(Clone)]
pub struct SourceHandle {
    name: Arc<str>,
    running: Arc<AtomicBool>,
    listeners: Arc<AtomicU64>,
    on_demand_req: Arc<AtomicBool>,
}

impl SourceHandle {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        SourceHandle {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(AtomicU64::new(0)),
            on_demand_req: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn listeners(&self) -> u64 {
        self.listeners.load(Ordering::Acquire)
    }

    pub fn set_listeners(&self, count: u64) {
        self.listeners.store(count, Ordering::Release);
    }

    pub fn request_on_demand(&self) {
        self.on_demand_req.store(true, Ordering::Release);
    }

    pub fn clear_on_demand_request(&self) {
        self.on_demand_req.store(false, Ordering::Release);
    }

    pub fn on_demand_requested(&self) -> bool {
        self.on_demand_req.load(Ordering::Acquire)
    }
}

/// The source tree / name-reservation registry, plus the blocking audio
/// pump that the worker hands the connection off to once the source is
/// running.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Reserve `local_mount` as a new source. Returns `None` if the name is
    /// already reserved.
    async fn reserve(&self, local_mount: &str) -> Option<SourceHandle>;

    /// Release a previously reserved source.
    async fn free(&self, handle: SourceHandle);

    /// Look up an existing source by mountpoint, under the source tree's
    /// read lock.
    async fn find(&self, local_mount: &str) -> Option<SourceHandle>;

    /// Migrate any clients attached to `from` onto `to`.
    async fn move_clients(&self, from: &SourceHandle, to: &SourceHandle);

    /// Force the source subsystem to recheck mount-level settings.
    async fn recheck_mounts(&self);

    /// Refresh the cached mount-level settings (fallback mount, on-demand
    /// flag, ...) for a single source from the config tree.
    async fn refresh_mount_settings(&self, local_mount: &str);

    /// Run the blocking audio pump for this source. Returns once the pump
    /// observes `handle.is_running() == false` or the upstream is
    /// exhausted.
    async fn pump(&self, handle: &SourceHandle);
}

/// The stats subsystem.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn inc_relay_connections(&self);
    async fn set_source_ip(&self, local_mount: &str, ip: &str);
    async fn set_listeners(&self, local_mount: &str, count: u64);
    /// Clear the stats entry for a mountpoint entirely (disabled relay).
    async fn clear(&self, local_mount: &str);
}

/// The YP (stream directory) subsystem.
#[async_trait]
pub trait YpDirectory: Send + Sync {
    async fn remove(&self, local_mount: &str);
}

/// Read-only access to the live configuration tree. `snapshot` takes the
/// config lock, clones out what's needed, and releases it -- callers must
/// never hold the returned snapshot across a `relay_lock` acquisition or
/// network I/O (see the lock-ordering invariant in SPEC_FULL.md §5).
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn snapshot(&self) -> crate::config::RelayConfig;
}
