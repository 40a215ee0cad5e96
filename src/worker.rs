use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{RelayError, RelayResult};
use crate::external::{SourceHandle, SourceRegistry, StatsSink, YpDirectory};
use crate::record::RelayRecord;

const MAX_HEADER_BYTES: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What came of running a relay worker to completion.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The pump ran and returned normally (or was asked to stop).
    Completed,
    /// Connecting or the header handshake failed, and any attached clients
    /// were migrated to a configured fallback mount.
    FallbackHandled,
    /// Connecting or the header handshake failed, with no fallback to hand
    /// off to.
    Failed,
}

/// Everything the worker needs about the server's own identity, used to
/// build the `ice-redirect` header it advertises to the upstream.
#[derive(Clone)]
pub struct WorkerContext {
    pub user_agent: String,
    pub hostname: String,
    /// Nonzero if this server advertises itself as a redirect target.
    pub redirect_port: u16,
}

/// One task per active relay: establishes the upstream connection, hands
/// the socket off to the source subsystem, and pumps until exhaustion or
/// cooperative shutdown.
pub struct RelayWorker;

impl RelayWorker {
    /// Run the full worker contract for `record`, using `handle` as the
    /// already-reserved source slot.
    pub async fn run(
        record: &RelayRecord,
        handle: SourceHandle,
        ctx: &WorkerContext,
        registry: &Arc<dyn SourceRegistry>,
        stats: &Arc<dyn StatsSink>,
        yp: &Arc<dyn YpDirectory>,
    ) -> RelayOutcome {
        info!("starting relayed source at mountpoint \"{}\"", record.local_mount);
        handle.set_running(true);

        match Self::connect_and_pump(record, &handle, ctx, registry, stats).await {
            Ok(()) => {
                if !record.on_demand {
                    yp.remove(&record.local_mount).await;
                }
                RelayOutcome::Completed
            }
            Err(e) => {
                warn!("relay \"{}\" failed: {}", record.local_mount, e);
                handle.set_running(false);

                if let Some(fallback_mount) = &record.fallback_mount {
                    debug!("failed relay, falling back to {}", fallback_mount);
                    if let Some(fallback) = registry.find(fallback_mount).await {
                        registry.move_clients(&handle, &fallback).await;
                        return RelayOutcome::FallbackHandled;
                    }
                }
                RelayOutcome::Failed
            }
        }
    }

    async fn connect_and_pump(
        record: &RelayRecord,
        handle: &SourceHandle,
        ctx: &WorkerContext,
        registry: &Arc<dyn SourceRegistry>,
        stats: &Arc<dyn StatsSink>,
    ) -> RelayResult<()> {
        let addr = (record.server.as_str(), record.port);
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RelayError::connect(format!(
                    "timed out connecting to http://{}:{}{}",
                    record.server, record.port, record.mount
                ))
            })?
            .map_err(|e| {
                RelayError::connect(format!(
                    "couldn't connect to http://{}:{}{}: {}",
                    record.server, record.port, record.mount, e
                ))
            })?;

        let request = build_request(record, ctx);
        stream.write_all(request.as_bytes()).await?;

        let header = read_header(&mut stream).await?;
        let status = parse_status_code(&header)?;
        if !(200..300).contains(&status) {
            return Err(RelayError::header_protocol(format!(
                "upstream returned status {}",
                status
            )));
        }

        stats.inc_relay_connections().await;
        stats.set_source_ip(&record.local_mount, &record.server).await;

        registry.pump(handle).await;
        Ok(())
    }
}

fn build_request(record: &RelayRecord, ctx: &WorkerContext) -> String {
    let mut request = format!(
        "GET {} HTTP/1.0\r\nUser-Agent: {}\r\n",
        record.mount, ctx.user_agent
    );

    if record.mp3_metadata {
        request.push_str("Icy-MetaData: 1\r\n");
    }

    if ctx.redirect_port != 0 {
        request.push_str(&format!("ice-redirect: {}:{}\r\n", ctx.hostname, ctx.redirect_port));
    }

    if let (Some(username), Some(password)) = (&record.username, &record.password) {
        let credentials = format!("{}:{}", username, password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Authorization: Basic {}\r\n", encoded));
    }

    request.push_str("\r\n");
    request
}

async fn read_header(stream: &mut TcpStream) -> RelayResult<String> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(RelayError::header_protocol("header exceeded 4096 bytes"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::header_protocol("connection closed before headers completed"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_header_terminator(&buf).is_some() {
            break;
        }
    }

    String::from_utf8(buf).map_err(|_| RelayError::header_protocol("header was not valid UTF-8"))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(header: &str) -> RelayResult<u16> {
    let first_line = header
        .lines()
        .next()
        .ok_or_else(|| RelayError::header_protocol("empty response"))?;

    let mut parts = first_line.split_whitespace();
    let _version = parts
        .next()
        .filter(|v| v.starts_with("HTTP"))
        .ok_or_else(|| RelayError::header_protocol(format!("unrecognized status line: {}", first_line)))?;

    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| RelayError::header_protocol(format!("unrecognized status line: {}", first_line)))
}
