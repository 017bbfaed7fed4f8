//! SNI/Host Peeker: classifies an accepted connection as TLS or plaintext
//! HTTP without disturbing bytes any later stage still needs to read, then
//! extracts the hostname each protocol carries.

use rustls::server::{Acceptor, ClientHello};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{LazyConfigAcceptor, StartHandshake};

/// Hard bound on the header block of a request head.
const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Deadline for completing classification + hostname extraction.
const PEEK_DEADLINE: Duration = Duration::from_millis(1500);
/// Upper bound on header lines accepted by the HTTP-head parser.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum PeekError {
    #[error("connection closed before any bytes arrived")]
    ConnectionClosed,
    #[error("timed out waiting for client data")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request head exceeded {MAX_HEAD_BYTES} bytes without completing")]
    HeadTooLarge,
    #[error("malformed HTTP request head: {0}")]
    MalformedHttp(#[from] httparse::Error),
    #[error("HTTP request is missing a Host header")]
    MissingHost,
    #[error("TLS handshake error: {0}")]
    Tls(#[from] rustls::Error),
}

/// What the first byte on the wire tells us to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    PlainHttp,
}

/// Peeks a single byte — via `MSG_PEEK`, so it is still there for whichever
/// handler runs next — to tell a TLS ClientHello (starts with record type
/// 0x16) from plaintext HTTP.
pub async fn peek_protocol(stream: &TcpStream) -> Result<Protocol, PeekError> {
    let mut buf = [0u8; 1];
    let n = timeout(PEEK_DEADLINE, stream.peek(&mut buf))
        .await
        .map_err(|_| PeekError::Timeout)??;
    if n == 0 {
        return Err(PeekError::ConnectionClosed);
    }
    Ok(if buf[0] == 0x16 {
        Protocol::Tls
    } else {
        Protocol::PlainHttp
    })
}

/// A TLS handshake parked after the ClientHello has been read but before a
/// server certificate has been chosen, plus the SNI hostname pulled out of
/// it (if the client sent one).
pub struct PendingTlsHandshake {
    pub server_name: Option<String>,
    start: StartHandshake<TcpStream>,
}

impl PendingTlsHandshake {
    pub fn into_start(self) -> StartHandshake<TcpStream> {
        self.start
    }
}

fn sni_from_hello(hello: &ClientHello<'_>) -> Option<String> {
    hello.server_name().map(|s| s.to_string())
}

/// Starts a TLS handshake on `stream`, reading exactly as much as rustls
/// needs to parse the ClientHello and no further, and returns it alongside
/// the SNI hostname so the caller can pick a per-host certificate before
/// completing the handshake.
pub async fn start_tls_handshake(stream: TcpStream) -> Result<PendingTlsHandshake, PeekError> {
    let start = timeout(
        PEEK_DEADLINE,
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    .map_err(|_| PeekError::Timeout)??;

    let server_name = sni_from_hello(&start.client_hello());
    Ok(PendingTlsHandshake { server_name, start })
}

/// The parsed head of a plaintext HTTP request, plus the raw bytes read off
/// the wire while finding it. Those bytes were consumed (not peeked) and
/// must be forwarded upstream verbatim ahead of anything read afterward.
pub struct HttpHead {
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub raw: Vec<u8>,
}

/// Reads and parses an HTTP request line + headers from any async stream
/// (a raw plaintext `TcpStream` or an already-terminated TLS stream),
/// extracting the `Host` header as the routing hostname. Bounded to
/// `MAX_HEAD_BYTES` and `PEEK_DEADLINE` so a slow or hostile client cannot
/// stall a worker.
pub async fn read_http_head<S>(stream: &mut S) -> Result<HttpHead, PeekError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    timeout(PEEK_DEADLINE, read_http_head_inner(stream))
        .await
        .map_err(|_| PeekError::Timeout)?
}

async fn read_http_head_inner<S>(stream: &mut S) -> Result<HttpHead, PeekError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf)? {
            httparse::Status::Complete(consumed) => {
                let method = request.method.unwrap_or("").to_string();
                let path = request.path.unwrap_or("").to_string();
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .filter_map(|h| {
                        std::str::from_utf8(h.value)
                            .ok()
                            .map(|v| (h.name.to_string(), v.to_string()))
                    })
                    .collect();
                let host = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("host"))
                    .map(|(_, value)| value.trim().to_string())
                    .ok_or(PeekError::MissingHost)?;
                let _ = consumed;
                return Ok(HttpHead {
                    method,
                    path,
                    host,
                    headers,
                    raw: buf,
                });
            }
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_BYTES {
                    return Err(PeekError::HeadTooLarge);
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(PeekError::ConnectionClosed);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Writes a minimal `403 Forbidden` response and shuts the connection down.
/// Reserved for an actual policy `Block` decision.
pub async fn write_forbidden<S>(stream: &mut S, reason: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    write_status_response(stream, 403, "Forbidden", "Blocked by proxy policy", reason).await
}

/// Writes a minimal `502 Bad Gateway` response and shuts the connection
/// down. Used when the upstream connection could not be established, as
/// opposed to a policy decision.
pub async fn write_bad_gateway<S>(stream: &mut S, reason: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    write_status_response(stream, 502, "Bad Gateway", "Upstream connection failed", reason).await
}

async fn write_status_response<S>(
    stream: &mut S,
    status: u16,
    status_text: &str,
    prefix: &str,
    reason: &str,
) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let body = format!("{prefix}: {reason}\n");
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
