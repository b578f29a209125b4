use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::fs;

/// Which command-delivery mechanism this gateway runs. The two modes never
/// run simultaneously against the same device fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Devices poll the gateway for queued commands (primary mode).
    Pull,
    /// The gateway calls each device's control endpoint directly.
    Push,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub discovery_group: Ipv4Addr,
    pub discovery_port: u16,
    /// Poll protocol port, also announced to devices as `command_port`.
    pub poll_port: u16,
    pub query_port: u16,
    pub delivery: DeliveryMode,
    /// Fallback control port when a reading carries no `control_port` metadata.
    pub default_control_port: u16,
    /// IP to advertise in announcements; autodetected when unset.
    pub advertised_ip: Option<String>,
    pub announce_interval_secs: u64,
    pub on_demand_timeout_ms: u64,
    pub on_demand_poll_ms: u64,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            tcp_port: 6789,
            udp_port: 6790,
            discovery_group: Ipv4Addr::new(228, 0, 0, 8),
            discovery_port: 6791,
            poll_port: 8081,
            query_port: 8082,
            delivery: DeliveryMode::Pull,
            default_control_port: 50051,
            advertised_ip: None,
            announce_interval_secs: 10,
            on_demand_timeout_ms: 15_000,
            on_demand_poll_ms: 100,
            mqtt: None,
        }
    }
}

impl GatewayConfig {
    /// IP the announcer puts on the wire: configured value first, otherwise
    /// the primary local address, otherwise loopback.
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.advertised_ip {
            return ip.clone();
        }
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".into())
    }
}

pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("VIGIA_GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return GatewayConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::error!("invalid config {path}: {e}, using defaults");
            GatewayConfig::default()
        })
    } else {
        tracing::info!("no {path}, using default configuration");
        GatewayConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_published_endpoints() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.tcp_port, 6789);
        assert_eq!(cfg.udp_port, 6790);
        assert_eq!(cfg.discovery_group, Ipv4Addr::new(228, 0, 0, 8));
        assert_eq!(cfg.discovery_port, 6791);
        assert_eq!(cfg.delivery, DeliveryMode::Pull);
        assert_eq!(cfg.default_control_port, 50051);
        assert!(cfg.mqtt.is_none());
    }

    #[test]
    fn partial_yaml_overlays_defaults() {
        let cfg: GatewayConfig =
            serde_yaml::from_str("tcp_port: 7000\ndelivery: push\n").unwrap();
        assert_eq!(cfg.tcp_port, 7000);
        assert_eq!(cfg.delivery, DeliveryMode::Push);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.udp_port, 6790);
        assert_eq!(cfg.on_demand_timeout_ms, 15_000);
    }

    #[test]
    fn mqtt_section_is_optional_but_complete_when_present() {
        let cfg: GatewayConfig = serde_yaml::from_str(
            "mqtt:\n  host: broker.local\n  port: 1883\n  topic: vigia/readings\n",
        )
        .unwrap();
        let mqtt = cfg.mqtt.expect("mqtt section");
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.topic, "vigia/readings");
    }
}
