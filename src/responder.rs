//! # Responder
//!
//! Owns the long-lived key pair and the listening socket. Each accepted
//! connection runs one [`ResponderHandshake`]; per-connection errors are
//! logged and never leave the handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::{ConcurrencyMode, ServerConfig};
use crate::crypto::{Kem, KeyPair};
use crate::error::ProtocolResult;
use crate::handshake::{ConnectionReport, ResponderHandshake};
use crate::transport::TransportListener;
use crate::{PK_LEN, SK_LEN};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Totals gathered by the accept loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResponderStats {
    pub accepted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ResponderStats {
    fn record(&mut self, report: &ConnectionReport) {
        if report.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Handshake server
pub struct Responder<K: Kem + 'static> {
    listener: TransportListener,
    keypair: Arc<KeyPair>,
    kem: Arc<K>,
    config: ServerConfig,
}

impl<K: Kem + 'static> Responder<K> {
    /// Generate the process key pair and bind the listening socket
    ///
    /// Key generation failure is returned to the caller and is meant to be
    /// fatal to the process.
    pub async fn bind(config: ServerConfig, kem: K) -> ProtocolResult<Self> {
        let keypair = kem.keypair()?;
        info!("ML-KEM-768 keypair ready (pk={}B, sk={}B)", PK_LEN, SK_LEN);
        Self::with_keypair(config, kem, keypair).await
    }

    /// Bind with an existing key pair
    pub async fn with_keypair(config: ServerConfig, kem: K, keypair: KeyPair) -> ProtocolResult<Self> {
        config.validate()?;
        let listener = TransportListener::bind(config.listen.socket_addr()).await?;
        info!("Listening on {}", listener.local_addr());

        Ok(Self {
            listener,
            keypair: Arc::new(keypair),
            kem: Arc::new(kem),
            config,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The key pair served to every connection
    pub fn keypair(&self) -> &Arc<KeyPair> {
        &self.keypair
    }

    fn handler(&self) -> ResponderHandshake<K> {
        ResponderHandshake::new(Arc::clone(&self.keypair), Arc::clone(&self.kem))
    }

    /// Accept one connection and run its handshake to completion
    pub async fn accept_one(&self) -> ProtocolResult<ConnectionReport> {
        let (transport, peer) = self.listener.accept().await?;
        info!("Client {} connected", peer);
        let transport = transport.with_timeouts(
            self.config.connection.read_timeout(),
            self.config.connection.write_timeout(),
        );
        Ok(self.handler().run(transport, Some(peer)).await)
    }

    /// Serve until the connection limit is reached, if any
    pub async fn run(&self) -> ResponderStats {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves or the connection limit is reached
    pub async fn run_until<F>(&self, shutdown: F) -> ResponderStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = ResponderStats::default();
        let mut tasks = JoinSet::new();
        let limit = self.config.connection.max_connections;

        loop {
            if limit.is_some_and(|max| stats.accepted >= max) {
                info!("Connection limit of {} reached", stats.accepted);
                break;
            }

            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (transport, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept() failed: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            stats.accepted += 1;
            info!("Client {} connected", peer);

            let transport = transport.with_timeouts(
                self.config.connection.read_timeout(),
                self.config.connection.write_timeout(),
            );
            let handler = self.handler();

            match self.config.connection.concurrency {
                ConcurrencyMode::Serial => {
                    let report = handler.run(transport, Some(peer)).await;
                    stats.record(&report);
                }
                ConcurrencyMode::PerConnection => {
                    tasks.spawn(handler.run(transport, Some(peer)));
                    // Reap whatever already finished so the set stays small.
                    while let Some(joined) = tasks.try_join_next() {
                        match joined {
                            Ok(report) => stats.record(&report),
                            Err(e) => {
                                warn!("connection task panicked: {}", e);
                                stats.failed += 1;
                            }
                        }
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => stats.record(&report),
                Err(e) => {
                    warn!("connection task panicked: {}", e);
                    stats.failed += 1;
                }
            }
        }

        info!(
            accepted = stats.accepted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Responder stopped"
        );
        stats
    }
}
