//! Connection-processing nodes.
//!
//! A fixed pool of workers drains the accept channel, reads the first two
//! packets of each connection under the client timeout, and hands the
//! parsed result to the gateway. Both channels are rendezvous channels, so
//! a saturated pool pushes back on `accept()` and a slow gateway pushes
//! back on the pool.

use crate::event::{Bus, Event, EventData, Topic};
use crate::protocol::handshake::{Handshake, NextState};
use crate::protocol::login::LoginStart;
use crate::protocol::packet::read_packet_recorded;
use crate::protocol::{DecodeError, MAX_PACKET_SIZE};
use crate::proxy_protocol;
use anyhow::Context as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The client's read side. The buffer may hold pipelined bytes beyond the
/// two processed packets, so this reader travels with the connection
/// instead of the bare socket half.
pub type ClientReader = BufReader<OwnedReadHalf>;

/// A connection that made it through processing, owned by the gateway
/// from here on.
pub struct ProcessedConn {
    pub reader: ClientReader,
    pub writer: OwnedWriteHalf,
    /// Effective client address after PROXY protocol / Real-IP resolution.
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub handshake: Handshake,
    pub routing_host: String,
    /// Set iff the handshake continued into Login.
    pub username: Option<String>,
    /// The exact wire bytes of the two processed packets, in order.
    pub replay: Vec<u8>,
    handshake_frame_len: usize,
    pub received_at: Instant,
}

impl ProcessedConn {
    pub fn is_login(&self) -> bool {
        self.handshake.is_login()
    }

    /// The replay buffer with the handshake frame swapped for a rewritten
    /// one. The second frame is forwarded byte-identical.
    pub fn replay_with_handshake(&self, handshake: &Handshake) -> Vec<u8> {
        let mut replay = handshake.encode().wire_encoding();
        replay.extend_from_slice(&self.replay[self.handshake_frame_len..]);
        replay
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub client_timeout: Duration,
    pub proxy_protocol: bool,
    pub receive_real_ip: bool,
}

/// One worker of the pool. Runs until the accept channel closes or the
/// shutdown token fires; a failing connection never takes the worker down.
pub(crate) async fn run(
    node: usize,
    incoming: flume::Receiver<TcpStream>,
    processed: flume::Sender<ProcessedConn>,
    settings: Arc<ProcessorSettings>,
    bus: Bus,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            stream = incoming.recv_async() => match stream {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };

        let remote = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(node, error = %err, "dropping connection without a peer address");
                continue;
            }
        };
        debug!(node, %remote, "processing connection");

        let pre = Event::new(
            Topic::PreConnProcessing,
            EventData {
                remote_addr: Some(remote),
                ..EventData::default()
            },
        );
        if let Some(reason) = bus.request_denied(pre).await {
            debug!(node, %remote, %reason, "connection denied by event handler");
            continue;
        }

        let conn = match timeout(settings.client_timeout, process(stream, &settings)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                warn!(node, %remote, error = %err, "failed to process connection");
                continue;
            }
            Err(_) => {
                warn!(
                    node,
                    %remote,
                    timeout = ?settings.client_timeout,
                    "client timed out during processing"
                );
                continue;
            }
        };

        bus.push(Event::new(
            Topic::PostConnProcessing,
            EventData {
                remote_addr: Some(conn.remote_addr),
                local_addr: Some(conn.local_addr),
                requested_host: Some(conn.routing_host.clone()),
                username: conn.username.clone(),
                is_login: Some(conn.is_login()),
                ..EventData::default()
            },
        ));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = processed.send_async(conn) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(node, "processing node stopped");
}

pub(crate) async fn process(
    stream: TcpStream,
    settings: &ProcessorSettings,
) -> anyhow::Result<ProcessedConn> {
    let local_addr = stream.local_addr()?;
    let mut remote_addr = stream.peer_addr()?;
    let (read_half, writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if settings.proxy_protocol {
        let source = proxy_protocol::read_header(&mut reader)
            .await
            .context("reading PROXY protocol header")?;
        if let Some(source) = source {
            remote_addr = source;
        }
    }

    let mut replay = Vec::new();
    let first = read_packet_recorded(&mut reader, MAX_PACKET_SIZE, &mut replay)
        .await
        .context("reading handshake packet")?;
    let handshake_frame_len = replay.len();
    let second = read_packet_recorded(&mut reader, MAX_PACKET_SIZE, &mut replay)
        .await
        .context("reading second packet")?;

    let handshake = Handshake::decode(&first)?;
    let routing_host = handshake.routing_host();

    if settings.receive_real_ip {
        match handshake.forwarded_address() {
            Ok(forwarded) => remote_addr = forwarded.remote_addr,
            Err(DecodeError::NoForwardedAddress) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let username = match handshake.next_state {
        NextState::Login => Some(LoginStart::decode(&second)?.name),
        NextState::Status => None,
    };

    Ok(ProcessedConn {
        reader,
        writer,
        remote_addr,
        local_addr,
        handshake,
        routing_host,
        username,
        replay,
        handshake_frame_len,
        received_at: Instant::now(),
    })
}
