use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Scanning,
    ScanFailed,
    Connecting,
    ConnectionSuccess,
    Connected,
    ConnectionFailed,
    ConnectionLost,
    Hotspot,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::ScanFailed => "SCAN_FAILED",
            Self::Connecting => "CONNECTING",
            Self::ConnectionSuccess => "CONNECTION_SUCCESS",
            Self::Connected => "CONNECTED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Hotspot => "HOTSPOT",
        }
    }
}

/// One-shot link transition, consumed exactly once via
/// `WifiManager::take_notification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkNotification {
    Connected,
    ConnectionFailed,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub rssi: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredential {
    pub ssid: String,
    /// Empty password means an open network.
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub connection: &'static str,
    pub ssid: Option<String>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timestamp: String,
    #[serde(rename = "lastMessageId")]
    pub last_message_id: Option<String>,
}
