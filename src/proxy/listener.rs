//! Listener: accepts redirected connections, hands each off to the MITM
//! bridge, and drains in-flight work on shutdown.

use crate::proxy::bridge::{handle_connection, BridgeContext};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Grace period for in-flight connections once shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct Listener {
    addr: SocketAddr,
}

impl Listener {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Accepts connections until `shutdown` fires, then stops accepting new
    /// work and gives in-flight connections up to `DRAIN_TIMEOUT` to finish
    /// before abandoning them.
    pub async fn serve(
        &self,
        ctx: BridgeContext,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: self.addr,
                source,
            })?;
        tracing::info!(addr = %self.addr, "proxy listener accepting connections");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = ctx.clone();
                            tasks.spawn(async move {
                                if let Err(err) = handle_connection(stream, peer, ctx).await {
                                    tracing::debug!(%peer, error = %err, "connection ended with an error");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to accept connection");
                        }
                    }
                }
            }
        }

        tracing::info!(pending = tasks.len(), "draining in-flight connections");
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("drain timeout exceeded, aborting remaining connections");
            tasks.shutdown().await;
        }
        Ok(())
    }
}
