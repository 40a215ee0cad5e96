use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::config::MasterConfig;
use crate::record::RelayTemplate;
use crate::supervisor::{commit_master_relays, RelayLists, SupervisorShared};

const MASTER_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Detached task that fetches `admin/streamlist.txt` from the master server
/// and commits the resulting relay set. Grounded on `streamlist_thread`'s
/// curl-based fetch in the original implementation, rebuilt on `reqwest`.
pub struct MasterFetcher;

impl MasterFetcher {
    /// Fire the fetch-and-commit task. Does not hold a `JoinHandle`: the
    /// `in_flight` counter is how shutdown waits for it.
    pub fn spawn(
        lists: Arc<Mutex<RelayLists>>,
        shared: Arc<SupervisorShared>,
        master: MasterConfig,
        default_on_demand: bool,
        in_flight: Arc<std::sync::atomic::AtomicUsize>,
    ) {
        let Some(server) = master.master_server.clone() else {
            return;
        };

        in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            match fetch_streamlist(&server, &master, default_on_demand).await {
                Ok(templates) => {
                    commit_master_relays(&lists, &shared, templates).await;
                }
                Err(e) => {
                    warn!("failed URL access for streamlist from \"{}\": {}", server, e);
                }
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

async fn fetch_streamlist(
    server: &str,
    master: &MasterConfig,
    default_on_demand: bool,
) -> Result<Vec<RelayTemplate>, reqwest::Error> {
    let (protocol, port) = if master.master_ssl_port != 0 {
        ("https", master.master_ssl_port)
    } else {
        ("http", master.master_server_port)
    };
    let url = format!("{}://{}:{}/admin/streamlist.txt", protocol, server, port);

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!master.verify_master_tls)
        .timeout(MASTER_FETCH_TIMEOUT)
        .user_agent(format!("relaymaster/{}", env!("CARGO_PKG_VERSION")))
        .build()?;

    let credentials = format!(
        "{}:{}",
        master.master_username.as_deref().unwrap_or(""),
        master.master_password.as_deref().unwrap_or("")
    );
    let auth = base64::engine::general_purpose::STANDARD.encode(credentials);

    let mut response = client
        .get(&url)
        .header("Authorization", format!("Basic {}", auth))
        .send()
        .await?;

    if response.status().as_u16() != 200 {
        warn!("Failed response from master \"{}\"", response.status());
        return Ok(Vec::new());
    }

    let mut templates = Vec::new();
    let mut carry = String::new();

    while let Some(chunk) = response.chunk().await? {
        carry.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = carry.find('\n') {
            let line: String = carry.drain(..=pos).collect();
            let mount = line.trim_end_matches(['\r', '\n']);
            if !mount.is_empty() {
                debug!("read from master \"{}\"", mount);
                templates.push(build_template(server, port, mount, master, default_on_demand));
            }
        }
    }

    Ok(templates)
}

fn build_template(
    server: &str,
    port: u16,
    mount: &str,
    master: &MasterConfig,
    default_on_demand: bool,
) -> RelayTemplate {
    let (username, password) = if master.master_relay_auth {
        (master.master_username.clone(), master.master_password.clone())
    } else {
        (None, None)
    };

    RelayTemplate {
        server: server.to_string(),
        port,
        mount: mount.to_string(),
        local_mount: mount.to_string(),
        username,
        password,
        mp3_metadata: true,
        on_demand: default_on_demand,
        enable: true,
        fallback_mount: None,
        fallback_override: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_template_sends_auth_when_master_relay_auth_set() {
        let master = MasterConfig {
            master_server: Some("m".into()),
            master_username: Some("user".into()),
            master_password: Some("pass".into()),
            master_relay_auth: true,
            ..Default::default()
        };
        let template = build_template("m", 8000, "/live", &master, false);
        assert_eq!(template.username.as_deref(), Some("user"));
        assert_eq!(template.password.as_deref(), Some("pass"));
        assert!(template.mp3_metadata);
    }

    #[test]
    fn test_build_template_omits_auth_by_default() {
        let master = MasterConfig {
            master_username: Some("user".into()),
            master_password: Some("pass".into()),
            master_relay_auth: false,
            ..Default::default()
        };
        let template = build_template("m", 8000, "/live", &master, true);
        assert!(template.username.is_none());
        assert!(template.password.is_none());
        assert!(template.on_demand);
    }
}
