//! The proxy itself: the listener and the pipeline wiring.
//!
//! `Proxy` owns the configuration, the event bus and the routing table,
//! and ties the pieces together: accepted sockets go over a rendezvous
//! channel to the processing pool, processed connections over another to
//! the gateway. Unbuffered channels mean a saturated pipeline slows
//! `accept()` down instead of queueing unboundedly.

use crate::config::{Config, ServerConfig};
use crate::cpn::{self, ProcessedConn, ProcessorSettings};
use crate::event::Bus;
use crate::gateway::{self, GatewaySettings};
use crate::server::{ServerTable, SharedServerTable};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Proxy {
    config: Config,
    bus: Bus,
    table: SharedServerTable,
}

impl Proxy {
    pub fn new(config: Config) -> Self {
        let table = Arc::new(ArcSwap::from_pointee(ServerTable::new(
            config.servers.clone(),
        )));
        Self {
            config,
            bus: Bus::new(),
            table,
        }
    }

    /// The event bus connections are announced on. Attach handlers before
    /// serving to observe or deny connections.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Atomically replaces the routing table. In-flight sessions keep the
    /// table they dispatched with; new connections see the new one.
    pub fn swap_servers(&self, servers: Vec<ServerConfig>) {
        self.table.store(Arc::new(ServerTable::new(servers)));
    }

    pub async fn listen_and_serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let bind = self.config.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already-bound listener until shutdown.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        let (accept_tx, accept_rx) = flume::bounded::<TcpStream>(0);
        let (processed_tx, processed_rx) = flume::bounded::<ProcessedConn>(0);

        let processor = Arc::new(ProcessorSettings {
            client_timeout: self.config.client_timeout,
            proxy_protocol: self.config.proxy_protocol,
            receive_real_ip: self.config.receive_real_ip,
        });
        let node_count = match self.config.processing_node_count {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            count => count,
        };
        let mut nodes = Vec::with_capacity(node_count);
        for node in 0..node_count {
            nodes.push(tokio::spawn(cpn::run(
                node,
                accept_rx.clone(),
                processed_tx.clone(),
                Arc::clone(&processor),
                self.bus.clone(),
                shutdown.clone(),
            )));
        }
        drop(accept_rx);
        drop(processed_tx);

        let settings = Arc::new(GatewaySettings {
            gateway_id: self.config.gateway_id.clone(),
            kick_message: self.config.kick_message.clone(),
            keep_alive_timeout: self.config.keep_alive_timeout,
            grace_period: self.config.grace_period,
        });
        let gateway = tokio::spawn(gateway::run(
            Arc::clone(&self.table),
            settings,
            self.bus.clone(),
            processed_rx,
            shutdown.clone(),
        ));

        let result = accept_loop(&listener, &accept_tx, &shutdown).await;

        // Closing the accept channel winds the pipeline down stage by
        // stage: nodes finish their in-flight job, then the gateway drains.
        drop(accept_tx);
        for node in nodes {
            node.await.ok();
        }
        gateway.await.ok();
        info!("proxy stopped");
        result
    }
}

async fn accept_loop(
    listener: &TcpListener,
    accept_tx: &flume::Sender<TcpStream>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted connection");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        sent = accept_tx.send_async(stream) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(err) if is_transient(&err) => {
                    warn!(error = %err, "transient accept error");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => {
                    return Err(anyhow::Error::from(err).context("accepting connections"))
                }
            },
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
    // Out of file descriptors (ENFILE / EMFILE): back off instead of dying.
    || matches!(err.raw_os_error(), Some(23) | Some(24))
}
