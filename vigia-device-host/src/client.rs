//! Gateway-facing side of a device
//!
//! Handles everything a device needs to talk to the gateway:
//! - multicast discovery: join the announcement group and wait for the
//!   gateway to introduce itself
//! - framed TCP transmission (with ack) and raw UDP transmission
//! - the poll connection of the pull-mode command protocol

use anyhow::{Context, Result};
use prost::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{read_frame, write_frame, Ack, Announcement, Command, Reading};

/// Gateway endpoints learned from a discovery announcement.
#[derive(Debug, Clone)]
pub struct GatewayAddresses {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
    pub command: SocketAddr,
}

pub struct DeviceClient {
    pub device_id: String,
    pub location: String,
    discovery_group: Ipv4Addr,
    discovery_port: u16,
    addresses: Arc<RwLock<Option<GatewayAddresses>>>,
}

impl DeviceClient {
    pub fn new(
        device_id: String,
        location: String,
        discovery_group: Ipv4Addr,
        discovery_port: u16,
    ) -> Self {
        Self {
            device_id,
            location,
            discovery_group,
            discovery_port,
            addresses: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn gateway(&self) -> Option<GatewayAddresses> {
        self.addresses.read().await.clone()
    }

    /// Seed the gateway addresses directly (tests, fixed deployments).
    pub async fn set_gateway(&self, addresses: GatewayAddresses) {
        *self.addresses.write().await = Some(addresses);
    }

    /// Listen on the multicast group until an announcement arrives, then
    /// keep listening so a restarted test fleet can be repointed later.
    /// Malformed packets are ignored.
    pub async fn run_discovery(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.discovery_port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(target_family = "unix")]
        socket.set_reuse_port(true)?;
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;
        socket.join_multicast_v4(self.discovery_group, Ipv4Addr::UNSPECIFIED)?;

        info!(
            "[{}] listening for gateway announcements on {}:{}",
            self.device_id, self.discovery_group, self.discovery_port
        );

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    let (len, _peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("[{}] discovery receive failed: {e}", self.device_id);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    let announcement = match Announcement::decode(&buf[..len]) {
                        Ok(a) => a,
                        Err(_) => {
                            debug!("[{}] ignoring malformed discovery packet", self.device_id);
                            continue;
                        }
                    };
                    let gateway_ip: IpAddr = match announcement.gateway_ip.parse() {
                        Ok(ip) => ip,
                        Err(_) => continue,
                    };
                    let mut slot = self.addresses.write().await;
                    if slot.is_none() {
                        let addresses = GatewayAddresses {
                            tcp: SocketAddr::new(gateway_ip, announcement.tcp_port as u16),
                            udp: SocketAddr::new(gateway_ip, announcement.udp_port as u16),
                            command: SocketAddr::new(gateway_ip, announcement.command_port as u16),
                        };
                        info!("[{}] gateway found at {}", self.device_id, addresses.tcp);
                        *slot = Some(addresses);
                    }
                }
            }
        }
    }

    /// Block until discovery has produced a gateway address (or cancellation).
    pub async fn wait_for_gateway(&self, token: &CancellationToken) -> Option<GatewayAddresses> {
        loop {
            if token.is_cancelled() {
                return None;
            }
            if let Some(addresses) = self.gateway().await {
                return Some(addresses);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Transmit one reading over the framed TCP channel and await the ack.
    pub async fn send_tcp(&self, reading: &Reading) -> Result<Ack> {
        let addresses = self
            .gateway()
            .await
            .context("gateway address not yet discovered")?;

        let mut stream = TcpStream::connect(addresses.tcp)
            .await
            .context("connecting to gateway tcp ingestion")?;
        write_frame(&mut stream, &reading.encode_to_vec()).await?;

        let payload = read_frame(&mut stream)
            .await?
            .context("gateway closed the connection without an ack")?;
        let ack = Ack::decode(&payload[..])?;

        if ack.success {
            info!(
                "[{}] sent {} {} — gateway: {}",
                self.device_id, reading.value, reading.unit, ack.message
            );
        } else {
            warn!("[{}] gateway refused the reading: {}", self.device_id, ack.message);
        }
        Ok(ack)
    }

    /// Transmit one reading as a single UDP datagram; no response exists.
    pub async fn send_udp(&self, reading: &Reading) -> Result<()> {
        let addresses = self
            .gateway()
            .await
            .context("gateway address not yet discovered")?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&reading.encode_to_vec(), addresses.udp).await?;
        debug!(
            "[{}] sent {} {} via udp to {}",
            self.device_id, reading.value, reading.unit, addresses.udp
        );
        Ok(())
    }

    /// One cycle of the pull-mode poll protocol: send our id, receive the
    /// oldest queued command or a zero-length "nothing pending" frame.
    pub async fn poll_once(&self) -> Result<Option<Command>> {
        let addresses = self
            .gateway()
            .await
            .context("gateway address not yet discovered")?;

        let mut stream = TcpStream::connect(addresses.command)
            .await
            .context("connecting to gateway command server")?;
        write_frame(&mut stream, self.device_id.as_bytes()).await?;

        let payload = read_frame(&mut stream)
            .await?
            .context("gateway closed the poll connection early")?;
        if payload.is_empty() {
            return Ok(None);
        }
        let command = Command::decode(&payload[..])?;
        Ok(Some(command))
    }
}
