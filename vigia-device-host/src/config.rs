use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::fs;

/// How this fleet receives commands; must match the gateway's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    /// Poll the gateway's command queue on an interval.
    Pull,
    /// Expose a framed control endpoint the gateway calls into.
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceVariant {
    Temperature,
    Humidity,
    Alarm,
    Semaphore,
    Lamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub location: String,
    pub variant: DeviceVariant,
    pub interval_secs: u64,
    /// Control endpoint port (push mode only); advertised in reading metadata.
    pub control_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceHostConfig {
    pub discovery_group: Ipv4Addr,
    pub discovery_port: u16,
    pub mode: CommandMode,
    pub poll_interval_secs: u64,
    pub fleet: Vec<DeviceSpec>,
}

impl Default for DeviceHostConfig {
    fn default() -> Self {
        Self {
            discovery_group: Ipv4Addr::new(228, 0, 0, 8),
            discovery_port: 6791,
            mode: CommandMode::Pull,
            poll_interval_secs: 5,
            fleet: vec![
                DeviceSpec {
                    id: "TEMP-01".into(),
                    location: "Zone-A".into(),
                    variant: DeviceVariant::Temperature,
                    interval_secs: 30,
                    control_port: None,
                },
                DeviceSpec {
                    id: "HUM-01".into(),
                    location: "Zone-A".into(),
                    variant: DeviceVariant::Humidity,
                    interval_secs: 30,
                    control_port: None,
                },
                DeviceSpec {
                    id: "ALARM-01".into(),
                    location: "Bank Branch".into(),
                    variant: DeviceVariant::Alarm,
                    interval_secs: 10,
                    control_port: None,
                },
                DeviceSpec {
                    id: "SEM-01".into(),
                    location: "First & Main".into(),
                    variant: DeviceVariant::Semaphore,
                    interval_secs: 10,
                    control_port: None,
                },
            ],
        }
    }
}

pub async fn load_config() -> DeviceHostConfig {
    let path = std::env::var("VIGIA_DEVICE_CONFIG").unwrap_or_else(|_| "devices.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return DeviceHostConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::error!("invalid config {path}: {e}, using defaults");
            DeviceHostConfig::default()
        })
    } else {
        tracing::info!("no {path}, using the default fleet");
        DeviceHostConfig::default()
    }
}
