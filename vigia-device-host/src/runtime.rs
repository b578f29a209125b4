//! Device runtime
//!
//! Glues a [`DeviceClient`] to a [`DeviceBehavior`]: periodic transmission
//! driven by the behavior's dwell time, command intake from either the poll
//! loop (pull mode) or the framed control listener (push mode), and the
//! built-in handling of the "send" command every device understands.

use crate::client::DeviceClient;
use crate::devices::{CommandOutcome, DeviceBehavior, DeviceCommand};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{
    read_frame, write_frame, ControlOp, ControlRequest, ControlResponse, Reading,
    META_CONTROL_PORT,
};

#[derive(Clone)]
pub struct DeviceRuntime {
    pub client: Arc<DeviceClient>,
    pub behavior: Arc<dyn DeviceBehavior>,
    /// Advertised in reading metadata when the device serves a control
    /// endpoint (push mode).
    pub control_port: Option<u16>,
}

impl DeviceRuntime {
    /// Wrap the behavior's current sample into a wire reading.
    pub fn build_reading(&self) -> Reading {
        let sample = self.behavior.sample();
        let mut reading = Reading {
            device_id: self.client.device_id.clone(),
            location: self.client.location.clone(),
            kind: self.behavior.kind() as i32,
            value: sample.value,
            unit: sample.unit,
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            metadata: Default::default(),
        };
        if let Some(port) = self.control_port {
            reading
                .metadata
                .insert(META_CONTROL_PORT.to_string(), port.to_string());
        }
        reading
    }

    /// Handle one decoded command. `Send` transmits immediately; everything
    /// else goes to the variant's dispatch table.
    pub async fn handle_command(&self, command: DeviceCommand) -> (bool, String) {
        info!("[{}] received command: {:?}", self.client.device_id, command);
        match command {
            DeviceCommand::Send => match self.client.send_tcp(&self.build_reading()).await {
                Ok(_) => (true, "reading transmitted".into()),
                Err(e) => (false, format!("transmit failed: {e}")),
            },
            other => match self.behavior.apply(&other) {
                CommandOutcome::Applied(message) => (true, message),
                CommandOutcome::Unsupported(message) => {
                    warn!("[{}] {message}", self.client.device_id);
                    (false, message)
                }
            },
        }
    }

    /// Main device loop: transmit on the behavior's cadence, absorb
    /// commands, reset the phase timer when a command changed the timing.
    pub async fn run(
        &self,
        base_interval: Duration,
        mut commands: mpsc::Receiver<DeviceCommand>,
        token: CancellationToken,
    ) {
        let mut next_at = tokio::time::Instant::now() + self.behavior.dwell(base_interval);
        loop {
            let timing_changed = async {
                match self.behavior.timing_changed() {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(next_at) => {
                    self.behavior.tick();
                    let reading = self.build_reading();
                    if let Err(e) = self.client.send_tcp(&reading).await {
                        warn!("[{}] periodic transmit failed: {e}", self.client.device_id);
                    }
                    next_at = tokio::time::Instant::now() + self.behavior.dwell(base_interval);
                }
                _ = timing_changed => {
                    next_at = tokio::time::Instant::now() + self.behavior.dwell(base_interval);
                }
                Some(command) = commands.recv() => {
                    let _ = self.handle_command(command).await;
                }
            }
        }
    }
}

/// Pull mode: ask the gateway for a pending command on a fixed cadence and
/// forward anything received into the device loop.
pub async fn run_poll_loop(
    client: Arc<DeviceClient>,
    commands: mpsc::Sender<DeviceCommand>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                match client.poll_once().await {
                    Ok(Some(command)) => {
                        if !command.params.is_empty() {
                            debug!(
                                "[{}] command {} carries {} params",
                                client.device_id, command.command_id, command.params.len()
                            );
                        }
                        let parsed = DeviceCommand::parse(&command.command);
                        if commands.send(parsed).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("[{}] command poll failed: {e}", client.device_id),
                }
            }
        }
    }
}

/// Push mode: serve the framed control protocol the gateway dials into.
pub async fn run_control_server(
    runtime: DeviceRuntime,
    listener: TcpListener,
    token: CancellationToken,
) {
    info!(
        "[{}] control endpoint listening on {:?}",
        runtime.client.device_id,
        listener.local_addr().ok()
    );
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (mut stream, _peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("[{}] control accept failed: {e}", runtime.client.device_id);
                        continue;
                    }
                };
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let payload = match read_frame(&mut stream).await {
                        Ok(Some(payload)) => payload,
                        _ => return,
                    };
                    let request = match ControlRequest::decode(&payload[..]) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("[{}] undecodable control request: {e}", runtime.client.device_id);
                            return;
                        }
                    };
                    let (success, message) = match request.op() {
                        ControlOp::SendNow => runtime.handle_command(DeviceCommand::Send).await,
                        ControlOp::Command => {
                            runtime
                                .handle_command(DeviceCommand::parse(&request.command))
                                .await
                        }
                    };
                    let response = ControlResponse { success, message };
                    if let Err(e) = write_frame(&mut stream, &response.encode_to_vec()).await {
                        warn!("[{}] control response failed: {e}", runtime.client.device_id);
                    }
                });
            }
        }
    }
}
