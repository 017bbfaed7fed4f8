//! HTTP/1.1 message framing: determines how many body bytes follow a parsed
//! request/response head and forwards exactly that many, so the bridge can
//! support keep-alive (each request on a connection individually evaluated)
//! without buffering or rewriting bodies.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const HEAD_DEADLINE: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out reading message head")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("response head exceeded {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("malformed chunked transfer encoding")]
    BadChunkedEncoding,
}

/// How a message's body boundary is determined (RFC 7230 §3.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub fn request_framing(headers: &[(String, String)]) -> BodyFraming {
    if has_chunked_encoding(headers) {
        return BodyFraming::Chunked;
    }
    if let Some(len) = content_length(headers) {
        return BodyFraming::Fixed(len);
    }
    BodyFraming::None
}

pub fn response_framing(status: u16, method: &str, headers: &[(String, String)]) -> BodyFraming {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return BodyFraming::None;
    }
    if has_chunked_encoding(headers) {
        return BodyFraming::Chunked;
    }
    if let Some(len) = content_length(headers) {
        return BodyFraming::Fixed(len);
    }
    BodyFraming::UntilClose
}

/// True when either side asked the connection to close after this message.
pub fn wants_close(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("close")
    })
}

fn has_chunked_encoding(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding") && value.to_ascii_lowercase().contains("chunked")
    })
}

fn content_length(headers: &[(String, String)]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
}

/// Forwards a message body from `reader` to `writer` according to
/// `framing`, without altering bytes. Returns once the body boundary (or
/// connection close, for `UntilClose`) is reached.
pub async fn forward_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Fixed(len) => {
            let mut limited = reader.take(len);
            tokio::io::copy(&mut limited, writer).await?;
            Ok(())
        }
        BodyFraming::Chunked => forward_chunked(reader, writer).await,
        BodyFraming::UntilClose => {
            tokio::io::copy(reader, writer).await?;
            Ok(())
        }
    }
}

async fn forward_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = read_line(reader).await?;
        writer.write_all(&size_line).await?;

        let text = std::str::from_utf8(&size_line).map_err(|_| FramingError::BadChunkedEncoding)?;
        let size_text = text.trim_end().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16).map_err(|_| FramingError::BadChunkedEncoding)?;

        if size == 0 {
            // Trailers (possibly none) followed by the terminating blank line.
            loop {
                let trailer_line = read_line(reader).await?;
                writer.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            return Ok(());
        }

        let mut remaining = size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..to_read]).await?;
            if n == 0 {
                return Err(FramingError::ConnectionClosed);
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        // Trailing CRLF after chunk data.
        let crlf = read_line(reader).await?;
        writer.write_all(&crlf).await?;
    }
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(FramingError::ConnectionClosed);
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            return Ok(line);
        }
        if line.len() > MAX_HEAD_BYTES {
            return Err(FramingError::BadChunkedEncoding);
        }
    }
}

/// A parsed HTTP response head, plus the exact bytes read off the wire
/// (forwarded to the client verbatim ahead of the body).
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub raw: Vec<u8>,
}

/// Reads and parses an HTTP/1.1 response line + headers from `upstream`,
/// bounded the same way request heads are.
pub async fn read_response_head<R>(upstream: &mut R) -> Result<ResponseHead, FramingError>
where
    R: AsyncRead + Unpin,
{
    timeout(HEAD_DEADLINE, read_response_head_inner(upstream))
        .await
        .map_err(|_| FramingError::Timeout)?
}

async fn read_response_head_inner<R>(upstream: &mut R) -> Result<ResponseHead, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf)? {
            httparse::Status::Complete(_) => {
                let status = response.code.unwrap_or(502);
                let headers = response
                    .headers
                    .iter()
                    .filter_map(|h| {
                        std::str::from_utf8(h.value)
                            .ok()
                            .map(|v| (h.name.to_string(), v.to_string()))
                    })
                    .collect();
                return Ok(ResponseHead {
                    status,
                    headers,
                    raw: buf,
                });
            }
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_BYTES {
                    return Err(FramingError::HeadTooLarge);
                }
                let n = upstream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(FramingError::ConnectionClosed);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
