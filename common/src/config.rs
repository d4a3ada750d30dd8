use serde::{Deserialize, Serialize};

use crate::types::NetworkCredential;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub connect_timeout_ms: u64,
    pub max_networks: usize,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_networks: 32,
        }
    }
}

impl WifiConfig {
    pub fn sanitize(&mut self) {
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(1_000, 120_000);
        self.max_networks = self.max_networks.clamp(1, 256);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub sync_interval_s: u16,
    pub timezone_offset_minutes: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_s: 600,
            timezone_offset_minutes: 0,
        }
    }
}

impl ClockConfig {
    pub fn sanitize(&mut self) {
        self.sync_interval_s = self.sync_interval_s.clamp(10, 7_200);
        // Offsets beyond UTC-12..UTC+14 don't exist.
        self.timezone_offset_minutes = self.timezone_offset_minutes.clamp(-12 * 60, 14 * 60);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    /// Number the relay receives SMS/MMS on; selects the MQTT topic.
    pub phone_number: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "silviutoderita.com".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            phone_number: "16043739569".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device_name: String,
    pub device_password: String,
    #[serde(default)]
    pub networks: Vec<NetworkCredential>,
    pub wifi: WifiConfig,
    pub clock: ClockConfig,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_name: "tagmachine".to_string(),
            device_password: "sebastian".to_string(),
            networks: Vec::new(),
            wifi: WifiConfig::default(),
            clock: ClockConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.wifi.sanitize();
        self.clock.sanitize();
        if self.device_name.trim().is_empty() {
            self.device_name = "tagmachine".to_string();
        }
        self.networks.truncate(self.wifi.max_networks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_wifi_timeout_and_capacity() {
        let mut config = WifiConfig {
            connect_timeout_ms: 50,
            max_networks: 10_000,
        };
        config.sanitize();

        assert_eq!(config.connect_timeout_ms, 1_000);
        assert_eq!(config.max_networks, 256);
    }

    #[test]
    fn sanitize_restores_blank_device_name() {
        let mut runtime = RuntimeConfig {
            device_name: "  ".to_string(),
            ..RuntimeConfig::default()
        };
        runtime.sanitize();

        assert_eq!(runtime.device_name, "tagmachine");
    }

    #[test]
    fn sanitize_drops_networks_past_capacity() {
        let mut runtime = RuntimeConfig::default();
        runtime.wifi.max_networks = 2;
        for i in 0..4 {
            runtime.networks.push(NetworkCredential {
                ssid: format!("net-{i}"),
                password: String::new(),
            });
        }
        runtime.sanitize();

        assert_eq!(runtime.networks.len(), 2);
        assert_eq!(runtime.networks[0].ssid, "net-0");
    }
}
