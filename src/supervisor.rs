use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::external::{ConfigSource, SourceRegistry, StatsSink, YpDirectory};
use crate::list::RelayList;
use crate::reconciler::RelayReconciler;
use crate::record::{RelayRecord, RelayTemplate};
use crate::slaves::SlaveHostTable;
use crate::worker::{RelayOutcome, RelayWorker, WorkerContext};

/// Which of the two disjoint relay lists an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayListKind {
    Static,
    Master,
}

/// Snapshot of a relay's state, safe to hand out without exposing the
/// record's non-`Clone` runtime handles.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub server: String,
    pub port: u16,
    pub mount: String,
    pub local_mount: String,
    pub running: bool,
    pub on_demand: bool,
}

impl From<&RelayRecord> for RelayInfo {
    fn from(record: &RelayRecord) -> Self {
        RelayInfo {
            server: record.server.clone(),
            port: record.port,
            mount: record.mount.clone(),
            local_mount: record.local_mount.clone(),
            running: record.runtime.is_running(),
            on_demand: record.on_demand,
        }
    }
}

pub(crate) struct RelayLists {
    pub(crate) static_relays: RelayList,
    pub(crate) master_relays: RelayList,
}

/// The collaborators and cross-tick signals the cleanup/start sweep needs,
/// shared between the supervisor's own tick and any detached `MasterFetcher`
/// commit.
pub(crate) struct SupervisorShared {
    registry: Arc<dyn SourceRegistry>,
    stats: Arc<dyn StatsSink>,
    yp: Arc<dyn YpDirectory>,
    rescan_requested: AtomicBool,
    settings_dirty: AtomicBool,
    worker_ctx: Mutex<WorkerContext>,
}

impl SupervisorShared {
    fn request_rebuild(&self) {
        self.settings_dirty.store(true, Ordering::Release);
        self.rescan_requested.store(true, Ordering::Release);
    }
}

/// Periodic controller that reconciles desired relay sets against running
/// ones, starts/stops worker tasks, applies on-demand activation policy,
/// and owns the slave-host redirection table.
pub struct Supervisor {
    config_source: Arc<dyn ConfigSource>,
    shared: Arc<SupervisorShared>,
    lists: Arc<Mutex<RelayLists>>,
    slaves: SlaveHostTable,

    running: AtomicBool,
    max_interval: AtomicU64,
    interval: AtomicU64,
    master_fetch_in_flight: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        registry: Arc<dyn SourceRegistry>,
        stats: Arc<dyn StatsSink>,
        yp: Arc<dyn YpDirectory>,
    ) -> Self {
        Supervisor {
            config_source,
            shared: Arc::new(SupervisorShared {
                registry,
                stats,
                yp,
                rescan_requested: AtomicBool::new(false),
                settings_dirty: AtomicBool::new(false),
                worker_ctx: Mutex::new(WorkerContext {
                    user_agent: format!("relaymaster/{}", env!("CARGO_PKG_VERSION")),
                    hostname: String::new(),
                    redirect_port: 0,
                }),
            }),
            lists: Arc::new(Mutex::new(RelayLists {
                static_relays: RelayList::new(),
                master_relays: RelayList::new(),
            })),
            slaves: SlaveHostTable::new(),
            running: AtomicBool::new(false),
            max_interval: AtomicU64::new(0),
            interval: AtomicU64::new(0),
            master_fetch_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    // ---- exposed control operations (spec.md §6) ----

    /// `slave_recheck_mounts`: force an immediate full refresh next tick.
    pub fn recheck_mounts(&self) {
        self.max_interval.store(0, Ordering::Release);
        self.shared.settings_dirty.store(true, Ordering::Release);
    }

    /// `slave_rescan`: force at least a lightweight rescan next tick.
    pub fn rescan(&self) {
        self.shared.rescan_requested.store(true, Ordering::Release);
    }

    /// `slave_rebuild_mounts`: both of the above.
    pub fn rebuild_mounts(&self) {
        self.shared.request_rebuild();
    }

    /// `slave_redirect`: pick a random known slave host and return the
    /// `Location` value to hand back with an HTTP 302, if any host is known.
    pub async fn redirect(&self, mountpoint: &str) -> Option<String> {
        let slave = self.slaves.pick_random().await?;
        info!("redirecting client to slave server at {}:{}", slave.server, slave.port);
        Some(format!("http://{}:{}{}", slave.server, slave.port, mountpoint))
    }

    pub async fn host_add(&self, header: &str) -> bool {
        self.slaves.add(header).await
    }

    pub async fn host_remove(&self, ice_redirect_header: &str) -> bool {
        self.slaves.remove(ice_redirect_header).await
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.slave_count()
    }

    /// `slave_find_relay`: look up a relay by mountpoint in either list.
    pub async fn find_relay(&self, which: RelayListKind, mount: &str) -> Option<RelayInfo> {
        let lists = self.lists.lock().await;
        let list = match which {
            RelayListKind::Static => &lists.static_relays,
            RelayListKind::Master => &lists.master_relays,
        };
        list.find(mount).map(RelayInfo::from)
    }

    // ---- lifecycle ----

    /// `slave_initialize`: seed the slave-host table and spawn the
    /// supervisor loop as a background task.
    pub async fn run(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Release);

        let config = self.config_source.snapshot().await;
        self.seed_master_as_slave(&config).await;
        self.shared.registry.recheck_mounts().await;

        tokio::spawn(async move {
            loop {
                self.run_one_tick_with_sleep().await;
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
            }
            info!("slave thread shutdown complete");
        })
    }

    /// `slave_shutdown`: stop accepting new ticks. The caller is expected to
    /// await the `JoinHandle` returned by `run` to observe the final
    /// cleanup pass.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn run_one_tick_with_sleep(&self) {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if !self.running.load(Ordering::Acquire) {
            self.shutdown_cleanup().await;
            return;
        }

        self.tick().await;
    }

    /// Run a single supervisor iteration: decide between a full refresh and
    /// a lightweight rescan, apply it, and clear per-tick flags. Exposed
    /// directly so tests can drive the state machine without the 1s sleep.
    pub async fn tick(&self) {
        let rescan_requested = self.shared.rescan_requested.load(Ordering::Acquire);
        let max_interval = self.max_interval.load(Ordering::Acquire);
        let interval = self.interval.fetch_add(1, Ordering::AcqRel) + 1;

        if !rescan_requested && max_interval > interval {
            return;
        }

        if interval >= max_interval {
            self.full_refresh().await;
        } else {
            self.lightweight_rescan().await;
        }

        self.shared.rescan_requested.store(false, Ordering::Release);

        if self.shared.settings_dirty.swap(false, Ordering::AcqRel) {
            self.shared.registry.recheck_mounts().await;
        }
    }

    async fn full_refresh(&self) {
        debug!("checking master stream list");
        let config = self.config_source.snapshot().await;

        self.interval.store(0, Ordering::Release);
        self.max_interval.store(config.master.master_update_interval, Ordering::Release);
        self.seed_master_as_slave(&config).await;
        self.refresh_worker_ctx(&config).await;

        if config.master.master_server.is_some() {
            crate::master_fetch::MasterFetcher::spawn(
                self.lists.clone(),
                self.shared.clone(),
                config.master.clone(),
                config.on_demand,
                self.master_fetch_in_flight.clone(),
            );
        }

        let mut lists = self.lists.lock().await;
        let (keep, cleanup) = RelayReconciler::reconcile(&mut lists.static_relays, config.relays.clone());
        lists.static_relays = keep;
        apply(&self.shared, &mut lists.static_relays, cleanup).await;
    }

    async fn lightweight_rescan(&self) {
        debug!("rescanning relay lists");
        let mut lists = self.lists.lock().await;

        let mut master = std::mem::replace(&mut lists.master_relays, RelayList::new());
        apply(&self.shared, &mut master, RelayList::new()).await;
        lists.master_relays = master;

        let mut static_relays = std::mem::replace(&mut lists.static_relays, RelayList::new());
        apply(&self.shared, &mut static_relays, RelayList::new()).await;
        lists.static_relays = static_relays;
    }

    async fn shutdown_cleanup(&self) {
        debug!("shutting down current relays");

        {
            let mut lists = self.lists.lock().await;
            let static_relays = std::mem::replace(&mut lists.static_relays, RelayList::new());
            let mut empty = RelayList::new();
            apply(&self.shared, &mut empty, static_relays).await;

            let master_relays = std::mem::replace(&mut lists.master_relays, RelayList::new());
            let mut empty2 = RelayList::new();
            apply(&self.shared, &mut empty2, master_relays).await;
        }

        while self.master_fetch_in_flight.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn seed_master_as_slave(&self, config: &RelayConfig) {
        let (Some(server), true) = (
            config.master.master_server.clone(),
            config.master.master_redirect_port != 0,
        ) else {
            return;
        };
        if !self.slaves.contains(&server, config.master.master_server_port).await {
            let header = format!("{}:{}", server, config.master.master_server_port);
            self.slaves.add(&header).await;
        }
    }

    async fn refresh_worker_ctx(&self, config: &RelayConfig) {
        let mut ctx = self.shared.worker_ctx.lock().await;
        ctx.hostname = config.hostname.clone();
        ctx.redirect_port = config.master.master_redirect_port;
    }
}

/// Commit a freshly fetched master relay list: reconcile against the
/// running master-relay set and apply cleanup/starts, all under the relay
/// lock (spec.md §4.5 "Commit").
pub(crate) async fn commit_master_relays(
    lists: &Mutex<RelayLists>,
    shared: &SupervisorShared,
    templates: Vec<RelayTemplate>,
) {
    let mut lists = lists.lock().await;
    let (keep, cleanup) = RelayReconciler::reconcile(&mut lists.master_relays, templates);
    lists.master_relays = keep;
    apply(shared, &mut lists.master_relays, cleanup).await;
}

// ---- §4.3 cleanup + §4.4 start/on-demand policy ----

async fn apply(shared: &SupervisorShared, keep: &mut RelayList, cleanup: RelayList) {
    for mut record in cleanup.into_iter() {
        if let Some(handle) = record.source_handle.take() {
            if record.runtime.is_running() {
                debug!("source shutdown request on \"{}\"", record.local_mount);
                handle.set_running(false);
                if let Some(worker) = record.worker.take() {
                    let _ = worker.await;
                }
                shared.request_rebuild();
            } else {
                shared.stats.clear(&record.local_mount).await;
            }
            shared.registry.free(handle).await;
        }
    }

    let worker_ctx = shared.worker_ctx.lock().await.clone();
    for record in keep.iter_mut() {
        check_relay_stream(shared, record, &worker_ctx).await;
    }
}

async fn check_relay_stream(shared: &SupervisorShared, record: &mut RelayRecord, ctx: &WorkerContext) {
    if record.source_handle.is_none() {
        if !record.local_mount.starts_with('/') {
            warn!(
                "relay mountpoint \"{}\" does not start with /, skipping",
                record.local_mount
            );
            return;
        }
        match shared.registry.reserve(&record.local_mount).await {
            Some(handle) => {
                debug!("adding relay source at mountpoint \"{}\"", record.local_mount);
                record.source_handle = Some(handle);
            }
            None => {
                warn!("new relay but source \"{}\" already exists", record.local_mount);
                return;
            }
        }
    }

    maybe_start(shared, record, ctx).await;
    completion_sweep(shared, record).await;
}

async fn maybe_start(shared: &SupervisorShared, record: &mut RelayRecord, ctx: &WorkerContext) {
    let Some(handle) = record.source_handle.clone() else { return };

    if record.runtime.is_running() {
        return;
    }
    if !record.enable {
        shared.stats.clear(&record.local_mount).await;
        return;
    }

    if record.on_demand {
        shared.registry.refresh_mount_settings(&record.local_mount).await;
        shared.request_rebuild();
        shared.stats.set_listeners(&record.local_mount, 0).await;

        if record.fallback_override {
            if let Some(fallback_mount) = &record.fallback_mount {
                debug!("checking {} for fallback override", fallback_mount);
                if let Some(fallback) = shared.registry.find(fallback_mount).await {
                    if fallback.is_running() && fallback.listeners() > 0 {
                        handle.request_on_demand();
                    }
                }
            }
        }

        if !handle.on_demand_requested() {
            return;
        }
    }

    let spawn_args = WorkerSpawnArgs {
        server: record.server.clone(),
        port: record.port,
        mount: record.mount.clone(),
        local_mount: record.local_mount.clone(),
        username: record.username.clone(),
        password: record.password.clone(),
        mp3_metadata: record.mp3_metadata,
        on_demand: record.on_demand,
        fallback_mount: record.fallback_mount.clone(),
    };

    record.runtime.set_running(true);
    let runtime = record.runtime.clone();
    let ctx = ctx.clone();
    let registry = shared.registry.clone();
    let stats = shared.stats.clone();
    let yp = shared.yp.clone();
    let local_mount = record.local_mount.clone();

    record.worker = Some(tokio::spawn(async move {
        let worker_record = spawn_args.into_record();
        let outcome = RelayWorker::run(&worker_record, handle, &ctx, &registry, &stats, &yp).await;
        if outcome == RelayOutcome::Failed || outcome == RelayOutcome::FallbackHandled {
            debug!("relay worker for \"{}\" exited after failure", local_mount);
        }
        // Signal completion back to the live record, mirroring the
        // original's shared `relay->cleanup` flag set by the relay thread
        // itself just before it exits. `running` is left untouched here:
        // only `completion_sweep`, after joining this task, clears it --
        // otherwise a concurrent `maybe_start` could see `running == false`
        // and spawn a second worker before this one is joined.
        runtime.set_cleanup(true);
    }));
}

async fn completion_sweep(shared: &SupervisorShared, record: &mut RelayRecord) {
    if !(record.runtime.is_cleanup() && record.worker.is_some()) {
        return;
    }

    debug!("waiting for relay thread for \"{}\"", record.local_mount);
    if let Some(worker) = record.worker.take() {
        let _ = worker.await;
    }
    record.runtime.set_cleanup(false);
    record.runtime.set_running(false);

    if !record.enable {
        shared.stats.clear(&record.local_mount).await;
        shared.request_rebuild();
        return;
    }

    if record.on_demand {
        shared.registry.refresh_mount_settings(&record.local_mount).await;
        shared.stats.set_listeners(&record.local_mount, 0).await;
        if let Some(handle) = &record.source_handle {
            handle.set_listeners(0);
            handle.clear_on_demand_request();
        }
    }
}

/// Plain-data snapshot used to build the record the worker task owns,
/// avoiding a `&mut RelayRecord` borrow living across the spawned task.
struct WorkerSpawnArgs {
    server: String,
    port: u16,
    mount: String,
    local_mount: String,
    username: Option<String>,
    password: Option<String>,
    mp3_metadata: bool,
    on_demand: bool,
    fallback_mount: Option<String>,
}

impl WorkerSpawnArgs {
    fn into_record(self) -> RelayRecord {
        RelayRecord {
            server: self.server,
            port: self.port,
            mount: self.mount,
            local_mount: self.local_mount,
            username: self.username,
            password: self.password,
            mp3_metadata: self.mp3_metadata,
            on_demand: self.on_demand,
            enable: true,
            fallback_mount: self.fallback_mount,
            fallback_override: false,
            source_handle: None,
            worker: None,
            runtime: crate::record::RelayRuntime::new(),
        }
    }
}
