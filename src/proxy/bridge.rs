//! MITM Bridge: drives one accepted connection through classification, TLS
//! termination (when applicable), rule evaluation, upstream re-origination,
//! and per-request forwarding across keep-alive.

use crate::config::{self, ConfigStore, Decision};
use crate::log::{TrafficEntry, TrafficLog};
use crate::proxy::cert_manager::{CaError, CertManager};
use crate::proxy::framing::{self, BodyFraming, FramingError};
use crate::proxy::peek::{self, HttpHead, PeekError, Protocol};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::Instrument;

/// Process-lifetime counter handed out as each connection's log-correlation id.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deadline for the upstream connect + TLS handshake.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle-between-requests timeout on a kept-alive connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("peek/classification failed: {0}")]
    Peek(#[from] PeekError),
    #[error("CA authority error: {0}")]
    Ca(#[from] CaError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared, cloneable handles every connection task needs.
#[derive(Clone)]
pub struct BridgeContext {
    pub cert_manager: Arc<CertManager>,
    pub config_store: Arc<ConfigStore>,
    pub traffic_log: Arc<TrafficLog>,
    pub upstream_tls: TlsConnector,
}

impl BridgeContext {
    pub fn new(
        cert_manager: Arc<CertManager>,
        config_store: Arc<ConfigStore>,
        traffic_log: Arc<TrafficLog>,
    ) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            cert_manager,
            config_store,
            traffic_log,
            upstream_tls: TlsConnector::from(Arc::new(client_config)),
        }
    }
}

/// Drives a single accepted connection to completion. Never panics on
/// malformed client input; all failures are caught and logged by the
/// caller. Every event emitted while handling this connection is scoped
/// under one span carrying `peer` and a process-lifetime connection id,
/// so stderr diagnostics for one connection can be correlated without
/// re-parsing the traffic log.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: BridgeContext,
) -> Result<(), BridgeError> {
    let conn_id = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!("connection", %peer, conn_id);
    handle_connection_inner(stream, peer, ctx)
        .instrument(span)
        .await
}

async fn handle_connection_inner(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: BridgeContext,
) -> Result<(), BridgeError> {
    match peek::peek_protocol(&stream).await? {
        Protocol::Tls => handle_tls(stream, peer, ctx).await,
        Protocol::PlainHttp => handle_plain(stream, peer, ctx).await,
    }
}

async fn handle_tls(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: BridgeContext,
) -> Result<(), BridgeError> {
    let pending = peek::start_tls_handshake(stream).await?;
    let host = match pending.server_name.clone() {
        Some(host) => host,
        None => {
            tracing::debug!(%peer, "TLS ClientHello carried no SNI, closing");
            return Ok(());
        }
    };

    let server_config = ctx.cert_manager.server_config_for_host(&host).await?;
    let start = pending.into_start();
    let mut client = match start.into_stream(server_config).await {
        Ok(stream) => stream,
        Err(err) => {
            log_handshake_failure(&ctx, &host, &err).await;
            return Ok(());
        }
    };

    let upstream = match timeout(UPSTREAM_CONNECT_TIMEOUT, connect_upstream_tls(&host, &ctx)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            log_upstream_failure(&ctx, &host, &err).await;
            return Ok(());
        }
        Err(_) => {
            log_upstream_failure(&ctx, &host, "upstream TLS handshake timed out").await;
            return Ok(());
        }
    };

    run_session(&mut client, upstream, host, peer, &ctx, true).await
}

async fn handle_plain(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: BridgeContext,
) -> Result<(), BridgeError> {
    // The host for routing is only known once the first request's Host
    // header has been read, so the upstream connection is opened lazily on
    // first use inside `run_session`.
    let head = match peek::read_http_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            tracing::debug!(%peer, error = %err, "failed to parse plaintext request head");
            return Ok(());
        }
    };

    let host = head.host.clone();
    let upstream = match timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), 80))).await
    {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            log_upstream_failure(&ctx, &host, &err).await;
            let _ = peek::write_bad_gateway(&mut stream, "upstream unavailable").await;
            return Ok(());
        }
        Err(_) => {
            log_upstream_failure(&ctx, &host, "connect timed out").await;
            let _ = peek::write_bad_gateway(&mut stream, "upstream unavailable").await;
            return Ok(());
        }
    };

    run_session_with_first_head(&mut stream, upstream, host, head, peer, &ctx).await
}

async fn log_upstream_failure(ctx: &BridgeContext, host: &str, err: impl std::fmt::Display) {
    tracing::info!(host, error = %err, "upstream connection failed");
    let snapshot = ctx.config_store.current();
    ctx.traffic_log
        .append(TrafficEntry::now(
            "BLOCK",
            mode_label(snapshot.mode),
            host.to_string(),
            String::new(),
            String::new(),
            format!("Upstream connect error: {err}"),
        ))
        .await;
}

/// Logs a client-facing TLS handshake failure (either side) as a blocked
/// traffic entry, matching the treatment given to upstream failures.
async fn log_handshake_failure(ctx: &BridgeContext, host: &str, err: impl std::fmt::Display) {
    tracing::info!(host, error = %err, "TLS handshake failed");
    let snapshot = ctx.config_store.current();
    ctx.traffic_log
        .append(TrafficEntry::now(
            "BLOCK",
            mode_label(snapshot.mode),
            host.to_string(),
            String::new(),
            String::new(),
            format!("Handshake error: {err}"),
        ))
        .await;
}

fn mode_label(mode: config::Mode) -> &'static str {
    match mode {
        config::Mode::Monitor => "monitor",
        config::Mode::Enforce => "enforce",
        config::Mode::AllowAll => "allow-all",
    }
}

/// Drives the keep-alive request loop for a connection whose first request
/// head has not yet been read (the TLS path: the upstream connects before
/// anything is known about the first request).
async fn run_session<C, U>(
    client: &mut C,
    mut upstream: U,
    host: String,
    peer: SocketAddr,
    ctx: &BridgeContext,
    is_tls: bool,
) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head = match timeout(IDLE_TIMEOUT, peek::read_http_head(client)).await {
            Ok(Ok(head)) => head,
            Ok(Err(PeekError::ConnectionClosed)) => return Ok(()),
            Ok(Err(err)) => {
                tracing::debug!(%peer, %host, error = %err, "failed to parse request on kept-alive connection");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!(%peer, %host, "connection idle timeout reached");
                return Ok(());
            }
        };

        // On the TLS path, SNI is authoritative for rule matching and a
        // differing Host header is only ever logged. Plaintext requests
        // carry no SNI, so each request's own Host header is the routing
        // hostname — a pipelined request naming a different host must be
        // evaluated and logged under that host, not the connection's first.
        let rule_host: &str = if is_tls {
            if !head.host.eq_ignore_ascii_case(&host) {
                tracing::info!(
                    %peer,
                    sni = %host,
                    host_header = %head.host,
                    "Host header disagrees with SNI; SNI is authoritative for rule matching"
                );
            }
            &host
        } else {
            &head.host
        };

        let should_close = forward_one_request(client, &mut upstream, rule_host, &head, ctx).await?;
        if should_close {
            return Ok(());
        }
    }
}

/// Same as [`run_session`] but for the plaintext path, where the first
/// request head has already been read during host extraction.
async fn run_session_with_first_head<C, U>(
    client: &mut C,
    mut upstream: U,
    host: String,
    first_head: HttpHead,
    peer: SocketAddr,
    ctx: &BridgeContext,
) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let should_close = forward_one_request(client, &mut upstream, &host, &first_head, ctx).await?;
    if should_close {
        return Ok(());
    }
    run_session(client, upstream, host, peer, ctx, false).await
}

/// Evaluates, forwards, and logs exactly one request/response exchange.
/// Returns `true` if the connection should be closed afterward.
async fn forward_one_request<C, U>(
    client: &mut C,
    upstream: &mut U,
    rule_host: &str,
    head: &HttpHead,
    ctx: &BridgeContext,
) -> Result<bool, BridgeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let decision = evaluate_and_log(ctx, rule_host, &head.path, &head.method).await;
    if !decision.is_allow() {
        let _ = peek::write_forbidden(client, decision.reason()).await;
        return Ok(true);
    }

    upstream.write_all(&head.raw).await?;
    let request_framing = framing::request_framing(&head.headers);
    if let Err(err) = framing::forward_body(client, upstream, request_framing).await {
        tracing::debug!(error = %err, "failed forwarding request body");
        return Ok(true);
    }

    let response = match framing::read_response_head(upstream).await {
        Ok(response) => response,
        Err(FramingError::ConnectionClosed) => return Ok(true),
        Err(err) => {
            tracing::debug!(error = %err, "failed reading upstream response head");
            return Ok(true);
        }
    };
    client.write_all(&response.raw).await?;

    let response_framing = framing::response_framing(response.status, &head.method, &response.headers);
    if let Err(err) = framing::forward_body(upstream, client, response_framing).await {
        tracing::debug!(error = %err, "failed forwarding response body");
        return Ok(true);
    }

    let close_requested = framing::wants_close(&head.headers) || framing::wants_close(&response.headers);
    Ok(close_requested || response_framing == BodyFraming::UntilClose)
}

async fn evaluate_and_log(ctx: &BridgeContext, host: &str, path: &str, method: &str) -> Decision {
    let snapshot = ctx.config_store.current();
    let decision = config::evaluate(host, path, &snapshot);

    let action = if decision.is_allow() { "ALLOW" } else { "BLOCK" };
    tracing::info!(host, path, action, reason = decision.reason(), "request evaluated");
    ctx.traffic_log
        .append(TrafficEntry::now(
            action,
            mode_label(snapshot.mode),
            host.to_string(),
            path.to_string(),
            method.to_string(),
            decision.reason().to_string(),
        ))
        .await;

    decision
}

async fn connect_upstream_tls(
    host: &str,
    ctx: &BridgeContext,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, std::io::Error> {
    let tcp = TcpStream::connect((host, 443)).await?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid hostname"))?;
    ctx.upstream_tls.connect(server_name, tcp).await
}
