//! Vigia Gateway - telemetry aggregation for field devices
//!
//! Central point of a device network:
//! - announces its endpoints over multicast so devices find it
//! - ingests readings over TCP (framed, acked), UDP (fire-and-forget) and
//!   optionally an MQTT bus
//! - tracks every device's last-known address and latest reading
//! - delivers commands back down, by poll queue (pull) or direct control
//!   call (push)
//! - answers status queries from external clients over a framed TCP protocol

mod bus;
mod config;
mod discovery;
mod dispatch;
mod ingest;
mod query;
mod registry;
mod state;

use crate::config::DeliveryMode;
use crate::dispatch::{CommandDispatcher, CommandQueues, TcpControlLink};
use crate::ingest::IngestContext;
use crate::query::QueryContext;
use crate::registry::{DeviceRegistry, ReadingsStore};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let cfg = config::load_config().await;
    info!(
        "starting gateway on {} (tcp {}, udp {}, query {}, {:?} delivery)",
        cfg.bind_host, cfg.tcp_port, cfg.udp_port, cfg.query_port, cfg.delivery
    );

    let registry = DeviceRegistry::new();
    let store = ReadingsStore::new();
    let queues = CommandQueues::new();
    let dispatcher = Arc::new(CommandDispatcher::new(
        cfg.delivery,
        registry.clone(),
        queues.clone(),
        Arc::new(TcpControlLink),
    ));
    let token = CancellationToken::new();

    let ingest_ctx = IngestContext {
        registry: registry.clone(),
        store: store.clone(),
        default_control_port: cfg.default_control_port,
    };

    let tcp = TcpListener::bind((cfg.bind_host.as_str(), cfg.tcp_port))
        .await
        .context("binding tcp ingestion port")?;
    tokio::spawn(ingest::run_tcp_ingest(tcp, ingest_ctx.clone(), token.clone()));

    let udp = UdpSocket::bind((cfg.bind_host.as_str(), cfg.udp_port))
        .await
        .context("binding udp ingestion port")?;
    tokio::spawn(ingest::run_udp_ingest(udp, ingest_ctx.clone(), token.clone()));

    if let Some(mqtt) = cfg.mqtt.clone() {
        bus::spawn_bus_consumer(mqtt, ingest_ctx.clone(), token.clone());
    }

    if cfg.delivery == DeliveryMode::Pull {
        let poll = TcpListener::bind((cfg.bind_host.as_str(), cfg.poll_port))
            .await
            .context("binding command poll port")?;
        tokio::spawn(dispatch::run_poll_server(poll, queues.clone(), token.clone()));
    }

    let query_listener = TcpListener::bind((cfg.bind_host.as_str(), cfg.query_port))
        .await
        .context("binding status query port")?;
    let query_ctx = QueryContext {
        store: store.clone(),
        dispatcher,
        on_demand_timeout: Duration::from_millis(cfg.on_demand_timeout_ms),
        on_demand_poll: Duration::from_millis(cfg.on_demand_poll_ms),
    };
    tokio::spawn(query::run_query_server(query_listener, query_ctx, token.clone()));

    tokio::spawn(discovery::run_announcer(cfg.clone(), token.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    token.cancel();
    Ok(())
}
