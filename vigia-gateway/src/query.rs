//! Status query server
//!
//! TCP request/response service for external clients (the REST facade among
//! them), framed like ingestion. Four operations:
//! - LIST_DEVICES: every reading in the store's snapshot
//! - GET_ON_DEMAND_DATA: solicit a fresh reading and wait, bounded
//! - QUEUE_COMMAND: relay a command through the dispatcher
//! - STREAM_LOCATION_DATA: readings for one location, framed one by one and
//!   closed with a zero-length frame
//!
//! Connections are handled independently; a slow on-demand wait never
//! blocks other queries.

use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigia_wire::{read_frame, write_frame, QueryKind, QueryRequest, QueryResponse, Reading};

use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::registry::ReadingsStore;

/// Why an on-demand read produced no data. The wire answer is a zero-length
/// frame either way; the causes stay distinct here and in the logs.
#[derive(Debug, Error)]
pub enum OnDemandError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("command not accepted: {0}")]
    Rejected(String),
    #[error("no fresh reading arrived within the deadline")]
    Timeout,
}

#[derive(Clone)]
pub struct QueryContext {
    pub store: ReadingsStore,
    pub dispatcher: Arc<CommandDispatcher>,
    pub on_demand_timeout: Duration,
    pub on_demand_poll: Duration,
}

/// Solicit a fresh reading from one device and wait for it to land in the
/// store: remember the current last-seen timestamp, fire the dedicated
/// "send now" command, then poll until a strictly newer reading appears or
/// the deadline passes.
pub async fn on_demand_read(
    ctx: &QueryContext,
    device_id: &str,
) -> Result<Reading, OnDemandError> {
    let last_ts = ctx
        .store
        .get(device_id)
        .await
        .map(|r| r.timestamp)
        .unwrap_or(0);

    ctx.dispatcher.send_now(device_id).await.map_err(|e| match e {
        DispatchError::DeviceNotFound(id) => OnDemandError::DeviceNotFound(id),
        other => OnDemandError::Rejected(other.to_string()),
    })?;

    let deadline = tokio::time::Instant::now() + ctx.on_demand_timeout;
    loop {
        if let Some(reading) = ctx.store.get(device_id).await {
            if reading.timestamp > last_ts {
                return Ok(reading);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OnDemandError::Timeout);
        }
        tokio::time::sleep(ctx.on_demand_poll).await;
    }
}

fn sorted_by_id(mut readings: Vec<Reading>) -> Vec<Reading> {
    readings.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    readings
}

/// Serve one query connection: one framed request, a framed answer (or a
/// frame sequence for streams), then the connection closes.
pub async fn handle_query_conn<S>(mut stream: S, ctx: &QueryContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_frame(&mut stream).await {
        Ok(Some(payload)) => match QueryRequest::decode(&payload[..]) {
            Ok(request) => request,
            Err(e) => {
                warn!("undecodable query request: {e}");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!("query connection failed: {e}");
            return;
        }
    };

    let result = match request.kind() {
        QueryKind::ListDevices => {
            let readings = sorted_by_id(ctx.store.snapshot().await.into_values().collect());
            debug!("list_devices: {} readings", readings.len());
            let response = QueryResponse {
                kind: QueryKind::ListDevices as i32,
                success: true,
                message: String::new(),
                readings,
            };
            write_frame(&mut stream, &response.encode_to_vec()).await
        }

        QueryKind::GetOnDemandData => match on_demand_read(ctx, &request.device_id).await {
            Ok(reading) => {
                let response = QueryResponse {
                    kind: QueryKind::GetOnDemandData as i32,
                    success: true,
                    message: String::new(),
                    readings: vec![reading],
                };
                write_frame(&mut stream, &response.encode_to_vec()).await
            }
            Err(e) => {
                warn!("on-demand read for {} failed: {e}", request.device_id);
                // "No data" is a bare zero-length frame on this protocol.
                write_frame(&mut stream, &[]).await
            }
        },

        QueryKind::QueueCommand => {
            let (success, message) = match ctx
                .dispatcher
                .dispatch(&request.device_id, &request.command, request.params.clone())
                .await
            {
                Ok(outcome) => (true, outcome.describe(&request.device_id)),
                Err(e) => (false, e.to_string()),
            };
            let response = QueryResponse {
                kind: QueryKind::QueueCommand as i32,
                success,
                message,
                readings: Vec::new(),
            };
            write_frame(&mut stream, &response.encode_to_vec()).await
        }

        QueryKind::StreamLocationData => {
            let matching = sorted_by_id(
                ctx.store
                    .snapshot()
                    .await
                    .into_values()
                    .filter(|r| r.location == request.location)
                    .collect(),
            );
            debug!(
                "stream_location_data {}: {} readings",
                request.location,
                matching.len()
            );
            let mut result = Ok(());
            for reading in matching {
                let response = QueryResponse {
                    kind: QueryKind::StreamLocationData as i32,
                    success: true,
                    message: String::new(),
                    readings: vec![reading],
                };
                result = write_frame(&mut stream, &response.encode_to_vec()).await;
                if result.is_err() {
                    break;
                }
            }
            match result {
                // Terminator.
                Ok(()) => write_frame(&mut stream, &[]).await,
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        warn!("failed to answer query: {e}");
    }
}

pub async fn run_query_server(listener: TcpListener, ctx: QueryContext, token: CancellationToken) {
    info!("status query server listening on {:?}", listener.local_addr().ok());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("query connection from {peer}");
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_query_conn(stream, &ctx).await;
                        });
                    }
                    Err(e) => warn!("query accept failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::dispatch::{CommandQueues, ControlLink, TcpControlLink};
    use crate::ingest::{handle_ingest_conn, IngestContext};
    use crate::registry::DeviceRegistry;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, SocketAddr};
    use vigia_wire::{Ack, ControlRequest, ControlResponse, DeviceKind};

    struct RefusingLink;

    #[async_trait]
    impl ControlLink for RefusingLink {
        async fn call(
            &self,
            _addr: SocketAddr,
            _request: ControlRequest,
        ) -> Result<ControlResponse, DispatchError> {
            Ok(ControlResponse {
                success: false,
                message: "busy".into(),
            })
        }
    }

    fn reading(id: &str, location: &str, timestamp: i64, value: f64) -> Reading {
        Reading {
            device_id: id.into(),
            location: location.into(),
            kind: DeviceKind::Temperature as i32,
            value,
            unit: "C".into(),
            timestamp,
            metadata: Default::default(),
        }
    }

    /// Pull-mode context over a fresh registry/store pair.
    async fn pull_ctx(timeout_ms: u64, poll_ms: u64) -> (QueryContext, DeviceRegistry) {
        let registry = DeviceRegistry::new();
        let store = ReadingsStore::new();
        let dispatcher = Arc::new(CommandDispatcher::new(
            DeliveryMode::Pull,
            registry.clone(),
            CommandQueues::new(),
            Arc::new(TcpControlLink),
        ));
        (
            QueryContext {
                store,
                dispatcher,
                on_demand_timeout: Duration::from_millis(timeout_ms),
                on_demand_poll: Duration::from_millis(poll_ms),
            },
            registry,
        )
    }

    async fn roundtrip(ctx: &QueryContext, request: QueryRequest) -> Vec<Vec<u8>> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &request.encode_to_vec()).await.unwrap();
        handle_query_conn(server, ctx).await;

        let mut frames = Vec::new();
        while let Some(frame) = read_frame(&mut client).await.unwrap() {
            let empty = frame.is_empty();
            frames.push(frame);
            if empty {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn list_devices_returns_the_whole_snapshot() {
        let (ctx, _registry) = pull_ctx(100, 10).await;
        ctx.store.upsert(reading("T1", "Zone-A", 1000, 21.5)).await;
        ctx.store.upsert(reading("H1", "Zone-B", 1001, 60.0)).await;

        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::ListDevices as i32,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(frames.len(), 1);
        let response = QueryResponse::decode(&frames[0][..]).unwrap();
        assert!(response.success);
        assert_eq!(response.kind(), QueryKind::ListDevices);
        let ids: Vec<_> = response.readings.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["H1", "T1"]);
    }

    #[tokio::test]
    async fn ingested_reading_flows_to_list_and_location_stream() {
        // The concrete end-to-end scenario: one TCP ingestion, then all
        // three read-side queries over the same store.
        let (ctx, registry) = pull_ctx(100, 10).await;
        let ingest = IngestContext {
            registry,
            store: ctx.store.clone(),
            default_control_port: 50051,
        };

        let (mut device, gateway) = tokio::io::duplex(4096);
        write_frame(&mut device, &reading("T1", "Zone-A", 1000, 21.5).encode_to_vec())
            .await
            .unwrap();
        handle_ingest_conn(gateway, "10.0.0.7".parse::<IpAddr>().unwrap(), &ingest).await;
        let ack = Ack::decode(&read_frame(&mut device).await.unwrap().unwrap()[..]).unwrap();
        assert!(ack.success);

        // LIST_DEVICES contains exactly that reading.
        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::ListDevices as i32,
                ..Default::default()
            },
        )
        .await;
        let listed = QueryResponse::decode(&frames[0][..]).unwrap();
        assert_eq!(listed.readings.len(), 1);
        assert_eq!(listed.readings[0].device_id, "T1");
        assert_eq!(listed.readings[0].value, 21.5);

        // STREAM_LOCATION_DATA("Zone-A"): the reading, then the terminator.
        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::StreamLocationData as i32,
                location: "Zone-A".into(),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(frames.len(), 2);
        let streamed = QueryResponse::decode(&frames[0][..]).unwrap();
        assert_eq!(streamed.kind(), QueryKind::StreamLocationData);
        assert_eq!(streamed.readings[0].device_id, "T1");
        assert!(frames[1].is_empty());

        // STREAM_LOCATION_DATA("Zone-B"): only the terminator.
        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::StreamLocationData as i32,
                location: "Zone-B".into(),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[tokio::test]
    async fn queue_command_reports_unknown_devices() {
        let (ctx, _registry) = pull_ctx(100, 10).await;
        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::QueueCommand as i32,
                device_id: "GHOST".into(),
                command: "arm".into(),
                ..Default::default()
            },
        )
        .await;
        let response = QueryResponse::decode(&frames[0][..]).unwrap();
        assert!(!response.success);
        assert!(response.message.contains("device not found"));
    }

    #[tokio::test]
    async fn queue_command_confirms_queued_delivery() {
        let (ctx, registry) = pull_ctx(100, 10).await;
        registry
            .upsert("T1", "10.0.0.7".parse().unwrap(), Some(50051))
            .await;

        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::QueueCommand as i32,
                device_id: "T1".into(),
                command: "arm".into(),
                params: BTreeMap::new(),
                ..Default::default()
            },
        )
        .await;
        let response = QueryResponse::decode(&frames[0][..]).unwrap();
        assert!(response.success);
        assert!(response.message.contains("queued for T1"));
    }

    #[tokio::test]
    async fn on_demand_returns_the_fresh_reading() {
        let (ctx, registry) = pull_ctx(1_000, 10).await;
        registry
            .upsert("T1", "10.0.0.7".parse().unwrap(), Some(50051))
            .await;
        ctx.store.upsert(reading("T1", "Zone-A", 1000, 21.5)).await;

        // The device "answers" the queued send command shortly after.
        let store = ctx.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.upsert(reading("T1", "Zone-A", 1001, 22.0)).await;
        });

        let fresh = on_demand_read(&ctx, "T1").await.unwrap();
        assert_eq!(fresh.timestamp, 1001);
        assert_eq!(fresh.value, 22.0);
    }

    #[tokio::test]
    async fn on_demand_failure_causes_stay_distinct() {
        // Unknown device.
        let (ctx, _registry) = pull_ctx(50, 10).await;
        assert!(matches!(
            on_demand_read(&ctx, "GHOST").await.unwrap_err(),
            OnDemandError::DeviceNotFound(_)
        ));

        // Device known, command refused (push mode, refusing endpoint).
        let registry = DeviceRegistry::new();
        registry
            .upsert("T1", "10.0.0.7".parse().unwrap(), Some(50051))
            .await;
        let refusing = QueryContext {
            store: ReadingsStore::new(),
            dispatcher: Arc::new(CommandDispatcher::new(
                DeliveryMode::Push,
                registry,
                CommandQueues::new(),
                Arc::new(RefusingLink),
            )),
            on_demand_timeout: Duration::from_millis(50),
            on_demand_poll: Duration::from_millis(10),
        };
        assert!(matches!(
            on_demand_read(&refusing, "T1").await.unwrap_err(),
            OnDemandError::Rejected(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_timeout_is_bounded_by_deadline_plus_one_poll() {
        let (ctx, registry) = pull_ctx(15_000, 100).await;
        registry
            .upsert("T1", "10.0.0.7".parse().unwrap(), Some(50051))
            .await;
        ctx.store.upsert(reading("T1", "Zone-A", 1000, 21.5)).await;

        let start = tokio::time::Instant::now();
        let err = on_demand_read(&ctx, "T1").await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, OnDemandError::Timeout));
        // No sooner than the deadline, no later than one poll interval past it.
        assert!(elapsed >= Duration::from_millis(15_000));
        assert!(elapsed <= Duration::from_millis(15_100));
    }

    #[tokio::test]
    async fn on_demand_failure_answers_a_zero_length_frame() {
        let (ctx, _registry) = pull_ctx(50, 10).await;
        let frames = roundtrip(
            &ctx,
            QueryRequest {
                kind: QueryKind::GetOnDemandData as i32,
                device_id: "GHOST".into(),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }
}
