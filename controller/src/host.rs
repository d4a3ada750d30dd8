use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tagmachine_common::{
    message::{format_phone_number, MessageCommand, UNSUPPORTED_MEDIA},
    message_topic, AccessPoint, ConnectionState, InboundMessage, LinkNotification, MachineClock,
    MachineStatus, NetworkCredential, Radio, RadioError, RuntimeConfig, TimeAuthority,
    TimeReading, WifiManager, TOPIC_MACHINE_STATE,
};

const CONTROL_LOOP_MS: u64 = 250;
const STATUS_PUBLISH_INTERVAL_MS: u64 = 10_000;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4_096;

/// Stands in for the wifi hardware on the host: every configured network is
/// visible at a deterministic signal strength and association always acquires
/// an address on the next loop iteration.
struct SimulatedRadio {
    visible: Vec<AccessPoint>,
    joined: Option<String>,
    ip_pending: bool,
}

impl SimulatedRadio {
    fn covering(networks: &[NetworkCredential]) -> Self {
        let visible = networks
            .iter()
            .enumerate()
            .map(|(index, network)| AccessPoint {
                ssid: network.ssid.clone(),
                rssi: -50 - (index as i32) * 3,
            })
            .collect();
        Self {
            visible,
            joined: None,
            ip_pending: false,
        }
    }

    fn take_ip_event(&mut self) -> bool {
        std::mem::take(&mut self.ip_pending)
    }
}

impl Radio for SimulatedRadio {
    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        Ok(self.visible.clone())
    }

    fn join(&mut self, ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.joined = Some(ssid.to_string());
        self.ip_pending = true;
        Ok(())
    }

    fn leave(&mut self) {
        self.joined = None;
    }

    fn start_access_point(&mut self, _ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.joined = None;
        Ok(())
    }

    fn current_ssid(&self) -> Option<String> {
        self.joined.clone()
    }
}

/// The host has an OS clock, so the time authority answers each pending
/// request from it; the engine's cadence and offset handling stay identical
/// to the device build.
#[derive(Default)]
struct SystemTimeAuthority {
    pending: bool,
}

impl TimeAuthority for SystemTimeAuthority {
    fn send_request(&mut self) {
        self.pending = true;
    }

    fn poll_response(&mut self) -> Option<TimeReading> {
        if !self.pending {
            return None;
        }
        self.pending = false;

        u32::try_from(Utc::now().timestamp())
            .ok()
            .map(|unix_seconds| TimeReading {
                unix_seconds,
                utc_offset_seconds: None,
            })
    }
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("TAGMACHINE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.tagmachine"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_network_defaults(&mut runtime);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("tag-machine", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let inbound_topic = message_topic(&runtime.network.phone_number);
    mqtt.subscribe(inbound_topic.as_str(), QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to the relay topic")?;

    let (message_tx, message_rx) = mpsc::channel::<String>(32);
    spawn_mqtt_loop(eventloop, inbound_topic, message_tx);

    run_control_loop(runtime, mqtt, message_rx).await
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    inbound_topic: String,
    message_tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if publish.topic != inbound_topic {
                        continue;
                    }
                    if publish.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized relay payload ({} bytes)",
                            publish.payload.len()
                        );
                        continue;
                    }
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(payload) => {
                            if message_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("dropping non-utf8 relay payload"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The appliance loop. Both state machines live here and hardware-style
/// events only ever reach them from this task; the MQTT receiver hands
/// payloads over through the channel.
async fn run_control_loop(
    runtime: RuntimeConfig,
    mqtt: AsyncClient,
    mut messages: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let radio = SimulatedRadio::covering(&runtime.networks);
    let mut wifi = WifiManager::new(radio, runtime.wifi.clone());
    for network in &runtime.networks {
        if !wifi.add_credential(network.ssid.clone(), network.password.clone()) {
            warn!("network list is full; ignoring `{}`", network.ssid);
            break;
        }
    }

    let mut clock = MachineClock::new(SystemTimeAuthority::default(), runtime.clock.clone());
    let mut last_message_id: Option<String> = None;
    let mut last_status_publish_ms = 0_u64;

    info!("TAG MACHINE");

    if !wifi.begin(monotonic_ms()) {
        warn!("unable to find known wifi networks; check your wifi settings and access point");
        if wifi.create_hotspot(&runtime.device_name, &runtime.device_password) {
            info!(
                network = %runtime.device_name,
                password = %runtime.device_password,
                "hotspot started"
            );
        }
    }

    let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_LOOP_MS));

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();

        if wifi.radio_mut().take_ip_event() {
            wifi.got_ip();
        }

        let state = wifi.handle(now_ms);

        if let Some(notification) = wifi.take_notification() {
            match notification {
                LinkNotification::Connected => {
                    let ssid = wifi.current_ssid().unwrap_or_default();
                    info!("wifi connected: {ssid}");
                }
                LinkNotification::ConnectionFailed => {
                    warn!("unable to connect to network");
                }
                LinkNotification::ConnectionLost => {
                    warn!(
                        timestamp = %clock.timestamp(now_ms),
                        "lost wifi connection; searching for networks"
                    );
                }
            }
        }

        match state {
            ConnectionState::ConnectionSuccess => wifi.set_connected(),
            ConnectionState::ConnectionFailed | ConnectionState::ConnectionLost => {
                wifi.set_idle();
            }
            ConnectionState::Connected => {
                clock.handle(now_ms);

                while let Ok(payload) = messages.try_recv() {
                    process_payload(&clock, &payload, &mut last_message_id);
                }
            }
            _ => {}
        }

        if now_ms.saturating_sub(last_status_publish_ms) >= STATUS_PUBLISH_INTERVAL_MS {
            last_status_publish_ms = now_ms;

            let status = MachineStatus {
                connection: state.as_str(),
                ssid: wifi.current_ssid(),
                time_synced: clock.has_synced(),
                timestamp: clock.timestamp(now_ms),
                last_message_id: last_message_id.clone(),
            };

            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_MACHINE_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("machine state publish failed: {err}");
                    }
                }
                Err(err) => warn!("machine state serialization failed: {err}"),
            }
        }
    }
}

/// Renders one relay payload the way the printer path does. Printing itself
/// is the hardware build's concern; here every line lands in the log.
fn process_payload<A: TimeAuthority>(
    clock: &MachineClock<A>,
    payload: &str,
    last_message_id: &mut Option<String>,
) {
    let message = match InboundMessage::parse(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!("ignoring malformed relay payload: {err}");
            return;
        }
    };

    // The relay occasionally redelivers; the previous id is enough to
    // suppress the duplicate.
    if last_message_id.as_deref() == Some(message.id.as_str()) {
        return;
    }
    *last_message_id = Some(message.id.clone());

    let photo_only = MessageCommand::from_body(&message.body) == Some(MessageCommand::Photo);

    if !photo_only {
        info!("MESSAGE");
        info!("{}", clock.format_external(message.unix_time));
        info!("From: {}", format_phone_number(&message.from));
        info!("{}", message.body);
    }

    for media in &message.media {
        if media == UNSUPPORTED_MEDIA {
            warn!("<UNSUPPORTED ATTACHMENT>");
        } else {
            info!("photo: {media}");
        }
    }
}

fn ensure_network_defaults(runtime: &mut RuntimeConfig) {
    if !runtime.networks.is_empty() {
        return;
    }

    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        let password = std::env::var("WIFI_PASS").unwrap_or_default();
        runtime.networks.push(NetworkCredential { ssid, password });
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
