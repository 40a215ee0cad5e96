use crate::error::{RelayError, RelayResult};
use crate::record::RelayTemplate;

/// Read-only snapshot of master-server configuration.
#[derive(Debug, Clone, Default)]
pub struct MasterConfig {
    pub master_server: Option<String>,
    pub master_server_port: u16,
    pub master_ssl_port: u16,
    pub master_username: Option<String>,
    pub master_password: Option<String>,
    /// Whether master credentials are also sent to master-discovered relays.
    pub master_relay_auth: bool,
    /// Seconds between full refreshes.
    pub master_update_interval: u64,
    /// Nonzero if this server advertises itself as a slave to the master.
    pub master_redirect_port: u16,
    /// Preserve legacy behavior (peer verification disabled) unless the
    /// operator opts in.
    pub verify_master_tls: bool,
}

/// Read-only snapshot of the relay subsystem's configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub hostname: String,
    pub relays: Vec<RelayTemplate>,
    /// Default `on_demand` value applied to master-discovered relays.
    pub on_demand: bool,
    pub master: MasterConfig,
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.hostname.is_empty() {
            return Err(RelayError::config("hostname must not be empty"));
        }
        for relay in &self.relays {
            if !relay.local_mount.starts_with('/') {
                return Err(RelayError::config(format!(
                    "relay local_mount \"{}\" does not start with /",
                    relay.local_mount
                )));
            }
        }
        Ok(())
    }
}

/// Builder for `RelayConfig`, mirroring the crate's `ServerConfigBuilder`
/// convention.
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn new() -> Self {
        RelayConfigBuilder {
            config: RelayConfig::default(),
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn relay(mut self, relay: RelayTemplate) -> Self {
        self.config.relays.push(relay);
        self
    }

    pub fn on_demand(mut self, on_demand: bool) -> Self {
        self.config.on_demand = on_demand;
        self
    }

    pub fn master(mut self, master: MasterConfig) -> Self {
        self.config.master = master;
        self
    }

    pub fn build(self) -> RelayResult<RelayConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RelayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
