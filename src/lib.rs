mod config;
mod error;
mod external;
mod list;
mod master_fetch;
mod reconciler;
mod record;
mod slaves;
mod worker;
mod supervisor;

pub use config::{MasterConfig, RelayConfig, RelayConfigBuilder};
pub use error::{RelayError, RelayResult};
pub use external::{ConfigSource, SourceHandle, SourceRegistry, StatsSink, YpDirectory};
pub use list::RelayList;
pub use reconciler::RelayReconciler;
pub use record::{RelayRecord, RelayTemplate};
pub use slaves::{SlaveHost, SlaveHostTable};
pub use supervisor::{RelayInfo, RelayListKind, Supervisor};
pub use worker::{RelayOutcome, RelayWorker, WorkerContext};
