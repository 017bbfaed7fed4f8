//! HTTPS MITM proxy: peeks SNI/Host, mints per-host leaf certificates,
//! terminates and re-originates TLS, evaluates the host/path allowlist, and
//! forwards or blocks each request.

pub mod bridge;
pub mod cert_manager;
pub mod framing;
pub mod listener;
pub mod peek;

pub use bridge::BridgeContext;
pub use cert_manager::{CaError, CertManager};
pub use listener::{Listener, ListenerError};
