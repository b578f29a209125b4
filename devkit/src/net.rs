/*!
Protocol-level test clients

Small async clients speaking the gateway's wire protocols against real
sockets: ingestion (TCP and UDP), the status query protocol, and the
command poll protocol. Plus [`RecordingControlServer`], a push-mode control
endpoint double that counts how often it is called.
*/

use anyhow::{Context, Result};
use prost::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use vigia_wire::{
    read_frame, write_frame, Ack, Command, ControlRequest, ControlResponse, QueryKind,
    QueryRequest, QueryResponse, Reading,
};

/// Send one reading over the framed TCP ingestion channel; returns the ack.
pub async fn send_reading_tcp(gateway: SocketAddr, reading: &Reading) -> Result<Ack> {
    let mut stream = TcpStream::connect(gateway).await?;
    write_frame(&mut stream, &reading.encode_to_vec()).await?;
    let payload = read_frame(&mut stream)
        .await?
        .context("gateway closed without an ack")?;
    Ok(Ack::decode(&payload[..])?)
}

/// Send one reading as a raw UDP datagram (fire-and-forget).
pub async fn send_reading_udp(gateway: SocketAddr, reading: &Reading) -> Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.send_to(&reading.encode_to_vec(), gateway).await?;
    Ok(())
}

async fn query(gateway: SocketAddr, request: QueryRequest) -> Result<Vec<Vec<u8>>> {
    let mut stream = TcpStream::connect(gateway).await?;
    write_frame(&mut stream, &request.encode_to_vec()).await?;

    let mut frames = Vec::new();
    while let Some(frame) = read_frame(&mut stream).await? {
        let empty = frame.is_empty();
        frames.push(frame);
        if empty {
            break;
        }
    }
    Ok(frames)
}

/// LIST_DEVICES: every reading the gateway currently holds.
pub async fn list_devices(gateway: SocketAddr) -> Result<Vec<Reading>> {
    let frames = query(
        gateway,
        QueryRequest {
            kind: QueryKind::ListDevices as i32,
            ..Default::default()
        },
    )
    .await?;
    let first = frames.first().context("no response frame")?;
    let response = QueryResponse::decode(&first[..])?;
    Ok(response.readings)
}

/// GET_ON_DEMAND_DATA: `None` means the gateway answered "no data".
pub async fn on_demand(gateway: SocketAddr, device_id: &str) -> Result<Option<Reading>> {
    let frames = query(
        gateway,
        QueryRequest {
            kind: QueryKind::GetOnDemandData as i32,
            device_id: device_id.into(),
            ..Default::default()
        },
    )
    .await?;
    let first = frames.first().context("no response frame")?;
    if first.is_empty() {
        return Ok(None);
    }
    let response = QueryResponse::decode(&first[..])?;
    Ok(response.readings.into_iter().next())
}

/// QUEUE_COMMAND: the gateway's confirmation as (success, message).
pub async fn queue_command(
    gateway: SocketAddr,
    device_id: &str,
    command: &str,
) -> Result<(bool, String)> {
    let frames = query(
        gateway,
        QueryRequest {
            kind: QueryKind::QueueCommand as i32,
            device_id: device_id.into(),
            command: command.into(),
            ..Default::default()
        },
    )
    .await?;
    let first = frames.first().context("no response frame")?;
    let response = QueryResponse::decode(&first[..])?;
    Ok((response.success, response.message))
}

/// STREAM_LOCATION_DATA: readings until the zero-length terminator.
pub async fn stream_location(gateway: SocketAddr, location: &str) -> Result<Vec<Reading>> {
    let frames = query(
        gateway,
        QueryRequest {
            kind: QueryKind::StreamLocationData as i32,
            location: location.into(),
            ..Default::default()
        },
    )
    .await?;
    let mut readings = Vec::new();
    for frame in frames {
        if frame.is_empty() {
            break;
        }
        let response = QueryResponse::decode(&frame[..])?;
        readings.extend(response.readings);
    }
    Ok(readings)
}

/// One cycle of the poll protocol, as a device would run it.
pub async fn poll_once(gateway: SocketAddr, device_id: &str) -> Result<Option<Command>> {
    let mut stream = TcpStream::connect(gateway).await?;
    write_frame(&mut stream, device_id.as_bytes()).await?;
    let payload = read_frame(&mut stream)
        .await?
        .context("gateway closed the poll connection early")?;
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(Command::decode(&payload[..])?))
}

/// A fake device control endpoint: answers every framed [`ControlRequest`]
/// with a fixed response and counts the calls, so tests can assert whether
/// the gateway attempted network delivery at all.
pub struct RecordingControlServer {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
}

impl RecordingControlServer {
    /// Bind an ephemeral port and start serving.
    pub async fn start(success: bool, message: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let response = ControlResponse {
            success,
            message: message.into(),
        };

        let server_calls = calls.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let calls = server_calls.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    let Ok(Some(payload)) = read_frame(&mut stream).await else {
                        return;
                    };
                    if ControlRequest::decode(&payload[..]).is_err() {
                        return;
                    }
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = write_frame(&mut stream, &response.encode_to_vec()).await;
                });
            }
        });

        Ok(Self { addr, calls })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigia_wire::ControlOp;

    #[tokio::test]
    async fn recording_server_counts_control_calls() {
        let server = RecordingControlServer::start(true, "done").await.unwrap();
        assert_eq!(server.call_count(), 0);

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        let request = ControlRequest {
            op: ControlOp::SendNow as i32,
            command: String::new(),
            params: Default::default(),
        };
        write_frame(&mut stream, &request.encode_to_vec()).await.unwrap();
        let payload = read_frame(&mut stream).await.unwrap().unwrap();
        let response = ControlResponse::decode(&payload[..]).unwrap();

        assert!(response.success);
        assert_eq!(response.message, "done");
        assert_eq!(server.call_count(), 1);
    }
}
