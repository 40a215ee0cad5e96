use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::external::SourceHandle;

/// The `running`/`cleanup` pair shared between a record and the worker task
/// spawned for it. The worker owns a clone and flips `cleanup` on exit
/// (mirroring the original's shared `relay->cleanup` field, set by the
/// relay thread itself); the supervisor's `completion_sweep` is what
/// actually observes that flip and joins the task.
#[derive(Clone)]
pub struct RelayRuntime {
    running: Arc<AtomicBool>,
    cleanup: Arc<AtomicBool>,
}

impl RelayRuntime {
    pub fn new() -> Self {
        RelayRuntime {
            running: Arc::new(AtomicBool::new(false)),
            cleanup: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_cleanup(&self) -> bool {
        self.cleanup.load(Ordering::Acquire)
    }

    pub fn set_cleanup(&self, cleanup: bool) {
        self.cleanup.store(cleanup, Ordering::Release);
    }
}

impl Default for RelayRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured relay: an immutable-ish description of one upstream stream
/// plus the mutable runtime handles the supervisor and worker share.
pub struct RelayRecord {
    pub server: String,
    pub port: u16,
    pub mount: String,
    pub local_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mp3_metadata: bool,
    pub on_demand: bool,
    pub enable: bool,
    pub fallback_mount: Option<String>,
    pub fallback_override: bool,

    pub source_handle: Option<SourceHandle>,
    pub worker: Option<JoinHandle<()>>,
    pub runtime: RelayRuntime,
}

/// The desired-state description of a relay, as produced by config or a
/// master-server fetch. Carries no runtime handles.
#[derive(Debug, Clone)]
pub struct RelayTemplate {
    pub server: String,
    pub port: u16,
    pub mount: String,
    pub local_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mp3_metadata: bool,
    pub on_demand: bool,
    pub enable: bool,
    pub fallback_mount: Option<String>,
    pub fallback_override: bool,
}

impl RelayRecord {
    /// Deep-copy a template into a fresh, un-reserved record.
    pub fn from_template(template: &RelayTemplate) -> Self {
        RelayRecord {
            server: template.server.clone(),
            port: template.port,
            mount: template.mount.clone(),
            local_mount: template.local_mount.clone(),
            username: template.username.clone(),
            password: template.password.clone(),
            mp3_metadata: template.mp3_metadata,
            on_demand: template.on_demand,
            enable: template.enable,
            fallback_mount: template.fallback_mount.clone(),
            fallback_override: template.fallback_override,
            source_handle: None,
            worker: None,
            runtime: RelayRuntime::new(),
        }
    }

    /// Two records are materially equivalent iff `server`, `mount`, `port`
    /// and `mp3_metadata` match. `on_demand` is intentionally excluded: a
    /// change there alone is a hot update, not a restart.
    pub fn materially_equivalent(&self, other: &RelayTemplate) -> bool {
        self.server == other.server
            && self.mount == other.mount
            && self.port == other.port
            && self.mp3_metadata == other.mp3_metadata
    }

    /// Absorb an `on_demand`-only change from `other` without restarting.
    pub fn hot_update(&mut self, other: &RelayTemplate) {
        self.on_demand = other.on_demand;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(local_mount: &str) -> RelayTemplate {
        RelayTemplate {
            server: "a".into(),
            port: 8000,
            mount: "/m".into(),
            local_mount: local_mount.into(),
            username: None,
            password: None,
            mp3_metadata: false,
            on_demand: false,
            enable: true,
            fallback_mount: None,
            fallback_override: false,
        }
    }

    #[test]
    fn test_material_equivalence_ignores_on_demand() {
        let record = RelayRecord::from_template(&template("/m"));
        let mut changed = template("/m");
        changed.on_demand = true;
        assert!(record.materially_equivalent(&changed));
    }

    #[test]
    fn test_material_equivalence_detects_server_change() {
        let record = RelayRecord::from_template(&template("/m"));
        let mut changed = template("/m");
        changed.server = "b".into();
        assert!(!record.materially_equivalent(&changed));
    }

    #[test]
    fn test_hot_update_copies_on_demand_only() {
        let mut record = RelayRecord::from_template(&template("/m"));
        let mut changed = template("/m");
        changed.on_demand = true;
        record.hot_update(&changed);
        assert!(record.on_demand);
        assert_eq!(record.server, "a");
    }

    #[test]
    fn test_runtime_clone_shares_completion_signal() {
        let record = RelayRecord::from_template(&template("/m"));
        let worker_side = record.runtime.clone();

        record.runtime.set_running(true);
        assert!(worker_side.is_running(), "clones must observe the same flag");

        worker_side.set_running(false);
        worker_side.set_cleanup(true);
        assert!(!record.runtime.is_running());
        assert!(record.runtime.is_cleanup(), "a clone held by a worker task must be able to signal completion back");
    }
}
