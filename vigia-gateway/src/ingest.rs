//! Ingestion listeners
//!
//! Two transports feed the registry and store:
//! - TCP: one length-framed reading per connection, answered with a framed
//!   [`Ack`], then the connection closes.
//! - UDP: one raw serialized reading per datagram, strictly fire-and-forget.
//!
//! Both funnel through [`absorb_reading`], which stamps the source address
//! into the reading's metadata, resolves the device's control port and
//! upserts both maps. A third, optional bus transport reuses the same path
//! (see `bus`).

use prost::Message;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{read_frame, write_frame, Ack, Reading, META_CONTROL_PORT, META_SOURCE_ADDRESS};

use crate::registry::{DeviceRegistry, ReadingsStore};

/// Everything an ingestion path needs to absorb a reading.
#[derive(Clone)]
pub struct IngestContext {
    pub registry: DeviceRegistry,
    pub store: ReadingsStore,
    pub default_control_port: u16,
}

pub fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Update registry and store from one successfully decoded reading.
///
/// The control port comes from the reading's `control_port` metadata when
/// present and parseable, else the configured default.
pub async fn absorb_reading(
    ctx: &IngestContext,
    mut reading: Reading,
    source: IpAddr,
    transport: &'static str,
) {
    let control_port = reading
        .metadata
        .get(META_CONTROL_PORT)
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(ctx.default_control_port);

    reading
        .metadata
        .insert(META_SOURCE_ADDRESS.to_string(), source.to_string());

    info!(
        "{:?} reading from {} via {}: {} @ {} = {} {}",
        reading.kind(),
        source,
        transport,
        reading.device_id,
        reading.location,
        reading.value,
        reading.unit
    );

    ctx.registry
        .upsert(&reading.device_id, source, Some(control_port))
        .await;
    ctx.store.upsert(reading).await;
}

/// Serve one TCP ingestion connection: one framed request, one framed ack.
///
/// Generic over the stream so tests can drive it with an in-memory duplex.
pub async fn handle_ingest_conn<S>(mut stream: S, peer: IpAddr, ctx: &IngestContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = match read_frame(&mut stream).await {
        Ok(Some(payload)) => payload,
        // Incomplete frame: the peer went away, nothing to answer.
        Ok(None) => return,
        Err(e) => {
            warn!("ingest connection from {peer}: {e}");
            return;
        }
    };

    let ack = match Reading::decode(&payload[..]) {
        Ok(reading) => {
            let device_id = reading.device_id.clone();
            absorb_reading(ctx, reading, peer, "tcp").await;
            Ack {
                success: true,
                message: format!("reading accepted from {device_id}"),
                timestamp: now_ts(),
            }
        }
        Err(e) => {
            warn!("undecodable reading from {peer}: {e}");
            Ack {
                success: false,
                message: format!("decode error: {e}"),
                timestamp: now_ts(),
            }
        }
    };

    if let Err(e) = write_frame(&mut stream, &ack.encode_to_vec()).await {
        warn!("failed to ack {peer}: {e}");
    }
}

/// TCP accept loop; one task per connection, single request/response cycle.
pub async fn run_tcp_ingest(listener: TcpListener, ctx: IngestContext, token: CancellationToken) {
    info!("tcp ingestion listening on {:?}", listener.local_addr().ok());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("ingest connection from {peer}");
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_ingest_conn(stream, peer.ip(), &ctx).await;
                        });
                    }
                    Err(e) => warn!("tcp ingest accept failed: {e}"),
                }
            }
        }
    }
}

/// UDP receive loop; each datagram is exactly one serialized reading.
pub async fn run_udp_ingest(socket: UdpSocket, ctx: IngestContext, token: CancellationToken) {
    info!("udp ingestion listening on {:?}", socket.local_addr().ok());
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("udp ingest recv failed: {e}");
                        continue;
                    }
                };
                match Reading::decode(&buf[..len]) {
                    Ok(reading) => absorb_reading(&ctx, reading, peer.ip(), "udp").await,
                    // No response channel exists on UDP; log and move on.
                    Err(e) => warn!(
                        "undecodable datagram from {peer} ({len} bytes): {e}\n  data: {}",
                        hex_dump(&buf[..len])
                    ),
                }
            }
        }
    }
}

pub(crate) fn hex_dump(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
