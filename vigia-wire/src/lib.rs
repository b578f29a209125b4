//! Wire messages shared by the Vigia gateway, device hosts and tooling
//!
//! The binary schema is protobuf; the structs below carry their field
//! numbers directly via prost derives, so both ends of every socket agree
//! bit-for-bit without a codegen step. Length-prefix framing for the TCP
//! protocols lives in [`frame`].

pub mod frame;

use std::collections::BTreeMap;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};

/// Reading metadata key a device uses to advertise its control port.
pub const META_CONTROL_PORT: &str = "control_port";
/// Reading metadata key the gateway stamps with the ingestion peer address.
pub const META_SOURCE_ADDRESS: &str = "source_address";

/// Kind of field device that produced a reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeviceKind {
    Unknown = 0,
    Temperature = 1,
    Humidity = 2,
    Alarm = 3,
    Semaphore = 4,
    LampPost = 5,
}

/// A single timestamped measurement or event emitted by a device.
///
/// Identity is `device_id`; the gateway keeps only the most recently
/// arrived reading per id. Metadata is an ordered map so re-encoding a
/// reading is deterministic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reading {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub location: String,
    #[prost(enumeration = "DeviceKind", tag = "3")]
    pub kind: i32,
    #[prost(double, tag = "4")]
    pub value: f64,
    #[prost(string, tag = "5")]
    pub unit: String,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
    #[prost(btree_map = "string, string", tag = "7")]
    pub metadata: BTreeMap<String, String>,
}

/// Acknowledgment returned on the TCP ingestion channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

/// Periodic multicast announcement of the gateway's reachable endpoints.
///
/// Re-broadcast verbatim on a fixed interval; devices consume it to learn
/// where to push readings and where to poll for commands.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Announcement {
    #[prost(string, tag = "1")]
    pub gateway_ip: String,
    #[prost(uint32, tag = "2")]
    pub tcp_port: u32,
    #[prost(uint32, tag = "3")]
    pub udp_port: u32,
    #[prost(uint32, tag = "4")]
    pub command_port: u32,
}

/// A command bound for one device, queued or delivered at most once.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub command: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub params: BTreeMap<String, String>,
    #[prost(string, tag = "4")]
    pub command_id: String,
    #[prost(int64, tag = "5")]
    pub enqueued_at: i64,
}

/// Operation selector for the push-mode control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ControlOp {
    /// Deliver an arbitrary command with parameters.
    Command = 0,
    /// Ask the device to transmit its latest reading immediately.
    SendNow = 1,
}

/// Push-mode control request sent to a device's control endpoint.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlRequest {
    #[prost(enumeration = "ControlOp", tag = "1")]
    pub op: i32,
    #[prost(string, tag = "2")]
    pub command: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub params: BTreeMap<String, String>,
}

/// Device's answer on the control channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Request type tag of the status query protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum QueryKind {
    ListDevices = 0,
    GetOnDemandData = 1,
    QueueCommand = 2,
    StreamLocationData = 3,
}

/// Framed request on the status query channel; only the fields relevant to
/// `kind` are populated.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryRequest {
    #[prost(enumeration = "QueryKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub device_id: String,
    #[prost(string, tag = "3")]
    pub location: String,
    #[prost(string, tag = "4")]
    pub command: String,
    #[prost(btree_map = "string, string", tag = "5")]
    pub params: BTreeMap<String, String>,
}

/// Framed response carrying the matching type tag.
///
/// STREAM_LOCATION_DATA answers are a sequence of these (one reading each)
/// closed by a zero-length frame; a failed on-demand read answers with a
/// bare zero-length frame instead of a response message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryResponse {
    #[prost(enumeration = "QueryKind", tag = "1")]
    pub kind: i32,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(message, repeated, tag = "4")]
    pub readings: Vec<Reading>,
}
