//! # Secure Proxy
//!
//! Transparent intercepting HTTPS proxy for sandboxed workloads. A redirector
//! (outside this crate) routes all outbound traffic on remote ports 80/443 to
//! this process's listener; from there it is classified (TLS vs plaintext
//! HTTP), MITM'd using a dynamically minted leaf certificate, checked against
//! a host/path allowlist, and forwarded or blocked with a structured record
//! written to the traffic log.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> Peeker -> (CA Authority <-> MITM Bridge) -> Rule Evaluator -> upstream
//! ```
//!
//! Config Store and Traffic Log are cross-cutting: every connection reads an
//! immutable rule snapshot and writes at most one log line per request.

pub mod config;
pub mod log;
pub mod proxy;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
