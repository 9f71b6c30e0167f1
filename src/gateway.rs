//! The server gateway: routes processed connections to configured
//! backends and runs each session to completion.
//!
//! Routing decisions happen on the gateway loop against one consistent
//! table snapshot; everything after the decision runs in its own task so
//! backend dials never block the router.

use crate::config::ServerConfig;
use crate::cpn::ProcessedConn;
use crate::event::{Bus, Event, EventData, Topic};
use crate::pipe;
use crate::protocol::handshake::NextState;
use crate::protocol::packet::{read_packet, write_packet, Packet, ReadError};
use crate::protocol::status::ResponseJson;
use crate::protocol::{login, status, MAX_PACKET_SIZE};
use crate::proxy_protocol;
use crate::server::{self, Matched, MessageContext, SharedServerTable, DEFAULT_OFFLINE_KICK};
use anyhow::{bail, Context as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub gateway_id: String,
    pub kick_message: String,
    pub keep_alive_timeout: Option<Duration>,
    pub grace_period: Duration,
}

/// The gateway loop. Runs until the processed channel closes or shutdown
/// fires, then gives live sessions the grace period before aborting them.
pub(crate) async fn run(
    table: SharedServerTable,
    settings: Arc<GatewaySettings>,
    bus: Bus,
    processed: flume::Receiver<ProcessedConn>,
    shutdown: CancellationToken,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = processed.recv_async() => match conn {
                Ok(conn) => {
                    let matched = table.load().route(&conn.routing_host);
                    let remote = conn.remote_addr;
                    let host = conn.routing_host.clone();
                    match &matched {
                        Some(matched) => debug!(
                            %remote,
                            %host,
                            backend = %matched.server.address,
                            "routing connection"
                        ),
                        None => debug!(%remote, %host, "no server matches"),
                    }

                    let settings = Arc::clone(&settings);
                    let bus = bus.clone();
                    sessions.spawn(async move {
                        if let Err(err) = dispatch(conn, matched, settings, bus).await {
                            warn!(%remote, %host, error = %err, "session ended with error");
                        }
                    });
                }
                Err(_) => break,
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = finished {
                    warn!(error = %err, "session task failed");
                }
            }
        }
    }

    let drained = timeout(settings.grace_period, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                warn!(error = %err, "session task failed");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            sessions = sessions.len(),
            grace = ?settings.grace_period,
            "aborting sessions still live after grace period"
        );
        sessions.shutdown().await;
    }
    debug!("gateway stopped");
}

async fn dispatch(
    conn: ProcessedConn,
    matched: Option<Matched>,
    settings: Arc<GatewaySettings>,
    bus: Bus,
) -> anyhow::Result<()> {
    let ctx = message_context(&conn, matched.as_ref(), &settings);
    match matched {
        None => reject(conn, &ctx, &settings).await,
        Some(matched) => match conn.handshake.next_state {
            NextState::Status => serve_status(conn, &matched, &ctx, &settings).await,
            NextState::Login => serve_login(conn, &matched, &ctx, &settings, bus).await,
        },
    }
}

fn message_context(
    conn: &ProcessedConn,
    matched: Option<&Matched>,
    settings: &GatewaySettings,
) -> MessageContext {
    MessageContext {
        username: conn.username.clone().unwrap_or_default(),
        remote_addr: conn.remote_addr.to_string(),
        local_addr: conn.local_addr.to_string(),
        matched_address: matched.map(|m| m.pattern.clone()).unwrap_or_default(),
        gateway_id: settings.gateway_id.clone(),
    }
}

async fn reject(
    mut conn: ProcessedConn,
    ctx: &MessageContext,
    settings: &GatewaySettings,
) -> anyhow::Result<()> {
    match conn.handshake.next_state {
        NextState::Login => {
            let reason = ctx.expand(&settings.kick_message);
            write_packet(&mut conn.writer, &login::disconnect(&reason)).await?;
        }
        NextState::Status => {
            let response = server::offline_status(conn.handshake.protocol_version);
            answer_status(&mut conn, &response, settings).await?;
        }
    }
    Ok(())
}

async fn serve_status(
    mut conn: ProcessedConn,
    matched: &Matched,
    ctx: &MessageContext,
    settings: &GatewaySettings,
) -> anyhow::Result<()> {
    let server = &matched.server;

    match &server.status_override {
        // A plain override answers locally; the backend is never dialed.
        Some(over) if !over.merge_with_backend => {
            let response = server::synthesize_status(over, conn.handshake.protocol_version, ctx);
            answer_status(&mut conn, &response, settings).await
        }
        // Merge mode fetches the backend's response and overrides fields.
        Some(over) => {
            let response = match dial(server).await {
                Ok(backend) => {
                    let (backend_reader, mut backend_writer) = backend.into_split();
                    backend_writer.write_all(&conn.replay).await?;
                    let mut backend_reader = BufReader::new(backend_reader);
                    let packet = read_packet(&mut backend_reader, MAX_PACKET_SIZE)
                        .await
                        .context("reading backend status response")?;
                    let mut response = ResponseJson::decode(&packet)?;
                    server::apply_status_override(over, &mut response, ctx);
                    response
                }
                Err(err) => {
                    warn!(backend = %server.address, error = %err, "status dial failed");
                    server::offline_status(conn.handshake.protocol_version)
                }
            };
            answer_status(&mut conn, &response, settings).await
        }
        // No override: hand the whole exchange to the backend.
        None => match dial(server).await {
            Ok(backend) => {
                let (backend_reader, mut backend_writer) = backend.into_split();
                backend_writer.write_all(&conn.replay).await?;
                let (upstream, downstream) = pipe::run(
                    conn.reader,
                    conn.writer,
                    backend_reader,
                    backend_writer,
                    settings.keep_alive_timeout,
                )
                .await;
                debug!(?upstream, ?downstream, "status session closed");
                Ok(())
            }
            Err(err) => {
                warn!(backend = %server.address, error = %err, "status dial failed");
                let response = server::offline_status(conn.handshake.protocol_version);
                answer_status(&mut conn, &response, settings).await
            }
        },
    }
}

async fn serve_login(
    mut conn: ProcessedConn,
    matched: &Matched,
    ctx: &MessageContext,
    settings: &GatewaySettings,
    bus: Bus,
) -> anyhow::Result<()> {
    let server = &matched.server;

    let pre = Event::new(
        Topic::PrePlayerJoin,
        EventData {
            remote_addr: Some(conn.remote_addr),
            local_addr: Some(conn.local_addr),
            requested_host: Some(conn.routing_host.clone()),
            username: conn.username.clone(),
            server_address: Some(server.address.clone()),
            is_login: Some(true),
        },
    );
    if let Some(reason) = bus.request_denied(pre).await {
        write_packet(&mut conn.writer, &login::disconnect(&ctx.expand(&reason))).await?;
        return Ok(());
    }

    let backend = match dial(server).await {
        Ok(backend) => backend,
        Err(err) => {
            warn!(backend = %server.address, error = %err, "login dial failed");
            let reason = ctx.expand(
                server
                    .offline_kick_message
                    .as_deref()
                    .unwrap_or(DEFAULT_OFFLINE_KICK),
            );
            write_packet(&mut conn.writer, &login::disconnect(&reason)).await?;
            return Ok(());
        }
    };

    let (backend_reader, mut backend_writer) = backend.into_split();

    if server.send_proxy_protocol {
        let header = proxy_protocol::encode_v2(conn.remote_addr, conn.local_addr);
        backend_writer.write_all(&header).await?;
    }

    let replay = if server.send_real_ip {
        let mut handshake = conn.handshake.clone();
        handshake.rewrite_forwarded_address(conn.remote_addr);
        conn.replay_with_handshake(&handshake)
    } else {
        std::mem::take(&mut conn.replay)
    };
    backend_writer.write_all(&replay).await?;

    let joined = EventData {
        remote_addr: Some(conn.remote_addr),
        local_addr: Some(conn.local_addr),
        requested_host: Some(conn.routing_host.clone()),
        username: conn.username.clone(),
        server_address: Some(server.address.clone()),
        is_login: Some(true),
    };
    bus.push(Event::new(Topic::PlayerJoin, joined.clone()));
    info!(
        username = %ctx.username,
        remote = %conn.remote_addr,
        backend = %server.address,
        "player joined"
    );

    let (upstream, downstream) = pipe::run(
        conn.reader,
        conn.writer,
        backend_reader,
        backend_writer,
        settings.keep_alive_timeout,
    )
    .await;
    debug!(?upstream, ?downstream, "login session closed");

    bus.push(Event::new(Topic::PlayerLeave, joined));
    info!(
        username = %ctx.username,
        remote = %conn.remote_addr,
        "player left"
    );
    Ok(())
}

/// Writes a status response, then answers the client's Ping with an
/// identical Pong. A client that hangs up without pinging closed
/// normally.
async fn answer_status(
    conn: &mut ProcessedConn,
    response: &ResponseJson,
    settings: &GatewaySettings,
) -> anyhow::Result<()> {
    write_packet(&mut conn.writer, &response.encode()).await?;

    let ping = match read_client_packet(conn, settings).await? {
        Some(ping) => ping,
        None => return Ok(()),
    };
    if ping.id != status::PING_ID {
        bail!("expected ping, got packet id {:#04x}", ping.id);
    }
    write_packet(&mut conn.writer, &status::pong(&ping)).await?;
    Ok(())
}

/// Reads the client's next packet; `None` on a clean disconnect.
async fn read_client_packet(
    conn: &mut ProcessedConn,
    settings: &GatewaySettings,
) -> anyhow::Result<Option<Packet>> {
    let packet = match settings.keep_alive_timeout {
        Some(limit) => timeout(limit, read_packet(&mut conn.reader, MAX_PACKET_SIZE))
            .await
            .context("client idle")?,
        None => read_packet(&mut conn.reader, MAX_PACKET_SIZE).await,
    };
    match packet {
        Ok(packet) => Ok(Some(packet)),
        Err(ReadError::UnexpectedEof) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn dial(server: &ServerConfig) -> anyhow::Result<TcpStream> {
    let stream = timeout(server.dial_timeout, TcpStream::connect(&server.address))
        .await
        .with_context(|| format!("dialing {} timed out", server.address))?
        .with_context(|| format!("dialing {}", server.address))?;
    Ok(stream)
}
