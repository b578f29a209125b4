//! Command dispatcher
//!
//! Given `(device_id, command, params)`, resolves the device in the
//! registry and delivers one of two ways, selected by deployment
//! configuration:
//! - **pull** (primary): the command joins the device's FIFO queue and the
//!   device retrieves it on its own polling cadence over the length-framed
//!   poll protocol. Retrieval pops the queue, so delivery is at-most-once
//!   per enqueue.
//! - **push**: the gateway opens a framed control channel to the device's
//!   control endpoint and invokes it synchronously.
//!
//! An unknown device id fails locally before any network I/O. The
//! dispatcher never retries; callers decide.

use async_trait::async_trait;
use prost::Message;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{read_frame, write_frame, Command, ControlOp, ControlRequest, ControlResponse};

use crate::config::DeliveryMode;
use crate::ingest::now_ts;
use crate::registry::DeviceRegistry;
use crate::state::{new_state, Shared};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no control endpoint known for device {0}")]
    NoControlEndpoint(String),
    #[error("control call to {addr} failed: {detail}")]
    Transport { addr: SocketAddr, detail: String },
    #[error("device rejected the command: {0}")]
    Rejected(String),
}

/// What a successful dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Pull mode: queued, awaiting the device's next poll.
    Queued { command_id: String },
    /// Push mode: delivered synchronously, with the device's own message.
    Delivered { message: String },
}

impl DispatchOutcome {
    pub fn describe(&self, device_id: &str) -> String {
        match self {
            DispatchOutcome::Queued { command_id } => {
                format!("command {command_id} queued for {device_id}")
            }
            DispatchOutcome::Delivered { message } => {
                format!("delivered to {device_id}: {message}")
            }
        }
    }
}

/// Outbound control channel, as a seam so tests can observe (and count)
/// calls without a live device.
#[async_trait]
pub trait ControlLink: Send + Sync {
    async fn call(
        &self,
        addr: SocketAddr,
        request: ControlRequest,
    ) -> Result<ControlResponse, DispatchError>;
}

/// Real control channel: one framed request/response over TCP. Blocks until
/// the transport's own connect/read failure fires; no extra timeout here.
pub struct TcpControlLink;

#[async_trait]
impl ControlLink for TcpControlLink {
    async fn call(
        &self,
        addr: SocketAddr,
        request: ControlRequest,
    ) -> Result<ControlResponse, DispatchError> {
        let transport = |detail: String| DispatchError::Transport { addr, detail };

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| transport(e.to_string()))?;
        write_frame(&mut stream, &request.encode_to_vec())
            .await
            .map_err(|e| transport(e.to_string()))?;

        let payload = read_frame(&mut stream)
            .await
            .map_err(|e| transport(e.to_string()))?
            .ok_or_else(|| transport("connection closed before a response arrived".into()))?;
        ControlResponse::decode(&payload[..]).map_err(|e| transport(e.to_string()))
    }
}

/// Per-device FIFO queues of pending commands (pull mode).
#[derive(Clone)]
pub struct CommandQueues {
    inner: Shared<HashMap<String, VecDeque<Command>>>,
}

impl Default for CommandQueues {
    fn default() -> Self {
        Self {
            inner: new_state(HashMap::new()),
        }
    }
}

impl CommandQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, command: Command) {
        self.inner
            .lock()
            .entry(command.device_id.clone())
            .or_default()
            .push_back(command);
    }

    /// Destructive pop of the oldest pending command; at-most-once per
    /// enqueue.
    pub fn pop(&self, device_id: &str) -> Option<Command> {
        self.inner
            .lock()
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
    }

    pub fn pending(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .get(device_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

pub struct CommandDispatcher {
    mode: DeliveryMode,
    registry: DeviceRegistry,
    queues: CommandQueues,
    link: Arc<dyn ControlLink>,
}

impl CommandDispatcher {
    pub fn new(
        mode: DeliveryMode,
        registry: DeviceRegistry,
        queues: CommandQueues,
        link: Arc<dyn ControlLink>,
    ) -> Self {
        Self {
            mode,
            registry,
            queues,
            link,
        }
    }

    /// Deliver an arbitrary command to one device.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: &str,
        params: BTreeMap<String, String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let record = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| DispatchError::DeviceNotFound(device_id.to_string()))?;

        match self.mode {
            DeliveryMode::Pull => {
                let command = Command {
                    device_id: device_id.to_string(),
                    command: command.to_string(),
                    params,
                    command_id: uuid::Uuid::new_v4().to_string(),
                    enqueued_at: now_ts(),
                };
                let command_id = command.command_id.clone();
                self.queues.enqueue(command);
                debug!("queued command {command_id} for {device_id}");
                Ok(DispatchOutcome::Queued { command_id })
            }
            DeliveryMode::Push => {
                let addr = record
                    .control_endpoint()
                    .ok_or_else(|| DispatchError::NoControlEndpoint(device_id.to_string()))?;
                let request = ControlRequest {
                    op: ControlOp::Command as i32,
                    command: command.to_string(),
                    params,
                };
                let response = self.link.call(addr, request).await?;
                if response.success {
                    Ok(DispatchOutcome::Delivered {
                        message: response.message,
                    })
                } else {
                    Err(DispatchError::Rejected(response.message))
                }
            }
        }
    }

    /// The dedicated "transmit your latest reading now" operation.
    pub async fn send_now(&self, device_id: &str) -> Result<DispatchOutcome, DispatchError> {
        match self.mode {
            // In pull mode "send" is an ordinary queued command every
            // device understands.
            DeliveryMode::Pull => self.dispatch(device_id, "send", BTreeMap::new()).await,
            DeliveryMode::Push => {
                let record = self
                    .registry
                    .get(device_id)
                    .await
                    .ok_or_else(|| DispatchError::DeviceNotFound(device_id.to_string()))?;
                let addr = record
                    .control_endpoint()
                    .ok_or_else(|| DispatchError::NoControlEndpoint(device_id.to_string()))?;
                let request = ControlRequest {
                    op: ControlOp::SendNow as i32,
                    command: String::new(),
                    params: BTreeMap::new(),
                };
                let response = self.link.call(addr, request).await?;
                if response.success {
                    Ok(DispatchOutcome::Delivered {
                        message: response.message,
                    })
                } else {
                    Err(DispatchError::Rejected(response.message))
                }
            }
        }
    }
}

/// Serve one poll connection: the device sends its id in a frame, the
/// gateway answers with the oldest queued command or a zero-length frame.
pub async fn handle_poll_conn<S>(mut stream: S, queues: &CommandQueues)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let device_id = match read_frame(&mut stream).await {
        Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
        Ok(None) => return,
        Err(e) => {
            warn!("poll connection failed: {e}");
            return;
        }
    };

    let response = match queues.pop(&device_id) {
        Some(command) => {
            debug!("handing command {} to {device_id}", command.command_id);
            command.encode_to_vec()
        }
        None => Vec::new(),
    };

    if let Err(e) = write_frame(&mut stream, &response).await {
        warn!("failed to answer poll from {device_id}: {e}");
    }
}

/// Accept loop for the pull-mode poll protocol.
pub async fn run_poll_server(
    listener: TcpListener,
    queues: CommandQueues,
    token: CancellationToken,
) {
    info!("command poll server listening on {:?}", listener.local_addr().ok());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let queues = queues.clone();
                        tokio::spawn(async move {
                            handle_poll_conn(stream, &queues).await;
                        });
                    }
                    Err(e) => warn!("poll accept failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test double for the control channel; counts every outbound call.
    struct RecordingLink {
        calls: AtomicUsize,
        response: ControlResponse,
    }

    impl RecordingLink {
        fn new(success: bool, message: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: ControlResponse {
                    success,
                    message: message.into(),
                },
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ControlLink for RecordingLink {
        async fn call(
            &self,
            _addr: SocketAddr,
            _request: ControlRequest,
        ) -> Result<ControlResponse, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn command(device_id: &str, name: &str) -> Command {
        Command {
            device_id: device_id.into(),
            command: name.into(),
            params: BTreeMap::new(),
            command_id: uuid::Uuid::new_v4().to_string(),
            enqueued_at: 0,
        }
    }

    async fn seen_registry(device_id: &str, control_port: Option<u16>) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        registry.upsert(device_id, addr, control_port).await;
        registry
    }

    #[test]
    fn queues_are_fifo_and_pop_is_destructive() {
        let queues = CommandQueues::new();
        queues.enqueue(command("D1", "first"));
        queues.enqueue(command("D1", "second"));

        assert_eq!(queues.pop("D1").unwrap().command, "first");
        assert_eq!(queues.pop("D1").unwrap().command, "second");
        assert!(queues.pop("D1").is_none());
    }

    #[test]
    fn queues_are_independent_per_device() {
        let queues = CommandQueues::new();
        queues.enqueue(command("D1", "for-d1"));
        queues.enqueue(command("D2", "for-d2"));

        assert_eq!(queues.pop("D2").unwrap().command, "for-d2");
        assert_eq!(queues.pending("D1"), 1);
    }

    #[tokio::test]
    async fn unknown_device_fails_without_any_control_call() {
        let link = RecordingLink::new(true, "ok");
        let dispatcher = CommandDispatcher::new(
            DeliveryMode::Push,
            DeviceRegistry::new(),
            CommandQueues::new(),
            link.clone(),
        );

        let err = dispatcher
            .dispatch("GHOST", "send", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceNotFound(_)));
        assert_eq!(link.calls(), 0);

        let err = dispatcher.send_now("GHOST").await.unwrap_err();
        assert!(matches!(err, DispatchError::DeviceNotFound(_)));
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn pull_dispatch_queues_and_never_touches_the_link() {
        let link = RecordingLink::new(true, "ok");
        let queues = CommandQueues::new();
        let dispatcher = CommandDispatcher::new(
            DeliveryMode::Pull,
            seen_registry("D1", Some(50051)).await,
            queues.clone(),
            link.clone(),
        );

        let outcome = dispatcher
            .dispatch("D1", "arm", BTreeMap::new())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        assert_eq!(queues.pending("D1"), 1);
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn push_dispatch_delivers_and_reports_the_device_message() {
        let link = RecordingLink::new(true, "command applied");
        let dispatcher = CommandDispatcher::new(
            DeliveryMode::Push,
            seen_registry("D1", Some(50051)).await,
            CommandQueues::new(),
            link.clone(),
        );

        let outcome = dispatcher
            .dispatch("D1", "arm", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                message: "command applied".into()
            }
        );
        assert_eq!(link.calls(), 1);
    }

    #[tokio::test]
    async fn push_dispatch_surfaces_device_rejection() {
        let link = RecordingLink::new(false, "unsupported");
        let dispatcher = CommandDispatcher::new(
            DeliveryMode::Push,
            seen_registry("D1", Some(50051)).await,
            CommandQueues::new(),
            link,
        );

        let err = dispatcher
            .dispatch("D1", "warp", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(m) if m == "unsupported"));
    }

    #[tokio::test]
    async fn push_without_control_endpoint_fails_locally() {
        let link = RecordingLink::new(true, "ok");
        let dispatcher = CommandDispatcher::new(
            DeliveryMode::Push,
            seen_registry("D1", None).await,
            CommandQueues::new(),
            link.clone(),
        );

        let err = dispatcher
            .dispatch("D1", "send", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoControlEndpoint(_)));
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn poll_protocol_hands_out_commands_in_order_then_goes_quiet() {
        let queues = CommandQueues::new();
        queues.enqueue(command("D1", "first"));
        queues.enqueue(command("D1", "second"));

        for expected in ["first", "second"] {
            let (mut device, gateway) = tokio::io::duplex(4096);
            write_frame(&mut device, b"D1").await.unwrap();
            handle_poll_conn(gateway, &queues).await;

            let frame = read_frame(&mut device).await.unwrap().unwrap();
            let cmd = Command::decode(&frame[..]).unwrap();
            assert_eq!(cmd.command, expected);
        }

        // Third poll with nothing queued: zero-length frame.
        let (mut device, gateway) = tokio::io::duplex(4096);
        write_frame(&mut device, b"D1").await.unwrap();
        handle_poll_conn(gateway, &queues).await;
        assert_eq!(read_frame(&mut device).await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn poll_for_an_unknown_device_answers_the_empty_frame() {
        let queues = CommandQueues::new();
        let (mut device, gateway) = tokio::io::duplex(4096);
        write_frame(&mut device, b"NEVER-SEEN").await.unwrap();
        handle_poll_conn(gateway, &queues).await;
        assert_eq!(read_frame(&mut device).await.unwrap(), Some(Vec::new()));
    }
}
