//! Vigia Device Host - simulated field devices
//!
//! Boots a fleet of device simulators that discover the gateway over
//! multicast, push readings on their own cadence over TCP, and receive
//! commands either by polling the gateway (pull) or by serving a framed
//! control endpoint (push).

mod client;
mod config;
mod devices;
mod runtime;

use crate::client::DeviceClient;
use crate::config::{CommandMode, DeviceVariant};
use crate::devices::{
    AlarmDevice, DeviceBehavior, HumidityDevice, LampDevice, SemaphoreDevice, TemperatureDevice,
};
use crate::runtime::DeviceRuntime;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let cfg = config::load_config().await;
    let token = CancellationToken::new();
    info!(
        "starting {} devices ({:?} command mode)",
        cfg.fleet.len(),
        cfg.mode
    );

    for spec in &cfg.fleet {
        let behavior: Arc<dyn DeviceBehavior> = match spec.variant {
            DeviceVariant::Temperature => Arc::new(TemperatureDevice::new(22.0)),
            DeviceVariant::Humidity => Arc::new(HumidityDevice::new()),
            DeviceVariant::Alarm => Arc::new(AlarmDevice::new(0.1)),
            DeviceVariant::Semaphore => {
                Arc::new(SemaphoreDevice::new(Duration::from_secs(spec.interval_secs)))
            }
            DeviceVariant::Lamp => Arc::new(LampDevice::new()),
        };

        let client = Arc::new(DeviceClient::new(
            spec.id.clone(),
            spec.location.clone(),
            cfg.discovery_group,
            cfg.discovery_port,
        ));
        let control_port = match cfg.mode {
            CommandMode::Push => Some(spec.control_port.unwrap_or(50051)),
            CommandMode::Pull => None,
        };
        let runtime = DeviceRuntime {
            client: client.clone(),
            behavior,
            control_port,
        };

        {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = client.run_discovery(token).await {
                    warn!("discovery task failed: {e}");
                }
            });
        }

        let interval = Duration::from_secs(spec.interval_secs);
        let poll_interval = Duration::from_secs(cfg.poll_interval_secs);
        let mode = cfg.mode;
        let token = token.clone();
        tokio::spawn(async move {
            if runtime.client.wait_for_gateway(&token).await.is_none() {
                return;
            }

            let (commands_tx, commands_rx) = mpsc::channel(8);
            match mode {
                CommandMode::Pull => {
                    tokio::spawn(runtime::run_poll_loop(
                        runtime.client.clone(),
                        commands_tx,
                        poll_interval,
                        token.clone(),
                    ));
                }
                CommandMode::Push => {
                    drop(commands_tx);
                    if let Some(port) = runtime.control_port {
                        match TcpListener::bind(("0.0.0.0", port)).await {
                            Ok(listener) => {
                                tokio::spawn(runtime::run_control_server(
                                    runtime.clone(),
                                    listener,
                                    token.clone(),
                                ));
                            }
                            Err(e) => warn!(
                                "[{}] could not bind control port {port}: {e}",
                                runtime.client.device_id
                            ),
                        }
                    }
                }
            }

            runtime.run(interval, commands_rx, token).await;
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("stopping all devices");
    token.cancel();
    Ok(())
}
