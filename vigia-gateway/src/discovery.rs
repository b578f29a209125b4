//! Discovery announcer
//!
//! Makes the gateway discoverable: serializes one [`Announcement`] of the
//! configured endpoints and re-broadcasts the same bytes to the multicast
//! group on a fixed interval. Broadcasting is best-effort — a send failure
//! is logged and the loop continues; nothing here is ever fatal.

use prost::Message;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigia_wire::Announcement;

use crate::config::GatewayConfig;

/// Announcement for this gateway's configured endpoints.
pub fn build_announcement(cfg: &GatewayConfig) -> Announcement {
    Announcement {
        gateway_ip: cfg.advertised_ip(),
        tcp_port: cfg.tcp_port as u32,
        udp_port: cfg.udp_port as u32,
        command_port: cfg.poll_port as u32,
    }
}

pub async fn run_announcer(cfg: GatewayConfig, token: CancellationToken) {
    let announcement = build_announcement(&cfg);
    // Serialized once; every broadcast sends these exact bytes.
    let payload = announcement.encode_to_vec();
    let target = SocketAddr::new(cfg.discovery_group.into(), cfg.discovery_port);

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("discovery announcer could not bind a socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_multicast_ttl_v4(1) {
        warn!("could not set multicast ttl: {e}");
    }

    info!(
        "announcing {}:{}/{} to {} every {}s",
        announcement.gateway_ip, announcement.tcp_port, announcement.udp_port,
        target, cfg.announce_interval_secs
    );

    let mut tick = tokio::time::interval(std::time::Duration::from_secs(
        cfg.announce_interval_secs.max(1),
    ));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    // No route to the group is survivable; keep announcing.
                    warn!("discovery broadcast failed: {e}");
                }
            }
        }
    }
}
