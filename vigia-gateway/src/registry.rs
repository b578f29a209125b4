//! Device registry and readings store
//!
//! Two independent concurrent maps, each behind its own lock so query load
//! never serializes against ingestion:
//! - [`DeviceRegistry`]: device id → last-known address + control endpoint
//! - [`ReadingsStore`]: device id → most recent reading (by arrival order)
//!
//! Entries are never removed: a device that goes silent stays registered
//! with its last-known location. No liveness timeout exists by design.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;
use vigia_wire::Reading;

/// Where a device was last seen and how to reach its control service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub address: IpAddr,
    pub control_port: Option<u16>,
}

impl DeviceRecord {
    /// Control endpoint as a dialable address, when the port is known.
    pub fn control_endpoint(&self) -> Option<SocketAddr> {
        self.control_port.map(|p| SocketAddr::new(self.address, p))
    }
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where a device was seen. The address always overwrites; the
    /// control port overwrites only when the ingestion carried one — a known
    /// endpoint is never cleared implicitly.
    pub async fn upsert(&self, device_id: &str, address: IpAddr, control_port: Option<u16>) {
        let mut map = self.inner.write().await;
        match map.get_mut(device_id) {
            Some(record) => {
                record.address = address;
                if control_port.is_some() {
                    record.control_port = control_port;
                }
            }
            None => {
                map.insert(
                    device_id.to_string(),
                    DeviceRecord {
                        device_id: device_id.to_string(),
                        address,
                        control_port,
                    },
                );
            }
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.inner.read().await.get(device_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[derive(Clone, Default)]
pub struct ReadingsStore {
    inner: Arc<RwLock<HashMap<String, Reading>>>,
}

impl ReadingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins by arrival order, regardless of the reading's own
    /// timestamp.
    pub async fn upsert(&self, reading: Reading) {
        self.inner
            .write()
            .await
            .insert(reading.device_id.clone(), reading);
    }

    pub async fn get(&self, device_id: &str) -> Option<Reading> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Point-in-time copy so callers can iterate without holding the lock.
    pub async fn snapshot(&self) -> HashMap<String, Reading> {
        self.inner.read().await.clone()
    }
}
