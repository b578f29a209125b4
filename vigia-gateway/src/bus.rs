//! Bus ingestion (optional)
//!
//! When an MQTT section is configured, the gateway also consumes serialized
//! readings from a fanout topic. Each message body is handled like a UDP
//! datagram with one difference: the broker is the transport peer, not the
//! device, so the source address comes from the reading's own
//! `source_address` metadata. A reading without one still updates the
//! store, but not the registry — an address-less record could never be
//! dispatched to.

use prost::Message;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::net::IpAddr;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{Reading, META_SOURCE_ADDRESS};

use crate::config::MqttConf;
use crate::ingest::{absorb_reading, IngestContext};

/// Absorb one bus payload. Factored out of the event loop for testability.
pub async fn handle_bus_payload(ctx: &IngestContext, payload: &[u8]) {
    let reading = match Reading::decode(payload) {
        Ok(reading) => reading,
        Err(e) => {
            warn!(
                "undecodable bus message ({} bytes): {e}\n  data: {}",
                payload.len(),
                crate::ingest::hex_dump(payload)
            );
            return;
        }
    };

    let source = reading
        .metadata
        .get(META_SOURCE_ADDRESS)
        .and_then(|s| s.parse::<IpAddr>().ok());

    match source {
        Some(source) => absorb_reading(ctx, reading, source, "bus").await,
        None => {
            debug!(
                "bus reading from {} carries no source_address, store only",
                reading.device_id
            );
            ctx.store.upsert(reading).await;
        }
    }
}

pub fn spawn_bus_consumer(cfg: MqttConf, ctx: IngestContext, token: CancellationToken) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("vigia-gateway", &cfg.host, cfg.port);
        opts.set_keep_alive(std::time::Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        if let Err(e) = client.subscribe(&cfg.topic, QoS::AtLeastOnce).await {
            warn!("bus subscribe failed: {e:?}");
            return;
        }
        info!("bus consumer subscribed to {} on {}:{}", cfg.topic, cfg.host, cfg.port);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == cfg.topic => {
                        handle_bus_payload(&ctx, &p.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("bus connection error: {e:?}");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });
}
