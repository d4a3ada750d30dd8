pub mod clock;
pub mod config;
pub mod message;
pub mod topics;
pub mod types;
pub mod wifi;

pub use clock::{parse_world_time_text, MachineClock, TimeAuthority, TimeReading};
pub use config::{ClockConfig, NetworkConfig, RuntimeConfig, WifiConfig};
pub use message::{InboundMessage, MessageCommand, MessageParseError};
pub use topics::{message_topic, TOPIC_MACHINE_STATE};
pub use types::{
    AccessPoint, ConnectionState, LinkNotification, MachineStatus, NetworkCredential,
};
pub use wifi::{Radio, RadioError, WifiManager};
