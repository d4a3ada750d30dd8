use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};

use tagmachine_common::{
    message::{format_phone_number, MessageCommand, UNSUPPORTED_MEDIA},
    message_topic, parse_world_time_text, AccessPoint, ConnectionState, InboundMessage,
    LinkNotification, MachineClock, MachineStatus, NetworkCredential, Radio, RadioError,
    RuntimeConfig, TimeAuthority, TimeReading, WifiManager, TOPIC_MACHINE_STATE,
};

const NVS_NAMESPACE: &str = "tagmachine";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WORLD_TIME_URL: &str = "http://worldtimeapi.org/api/ip.txt";
const CONTROL_LOOP_MS: u64 = 50;
const STATUS_PUBLISH_INTERVAL_MS: u64 = 10_000;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4_096;
const MAX_TIME_RESPONSE_BYTES: usize = 2_048;

struct EspRadio {
    wifi: EspWifi<'static>,
}

impl EspRadio {
    fn ensure_station_started(&mut self) -> Result<(), EspError> {
        if !matches!(self.wifi.get_configuration()?, Configuration::Client(_)) {
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        }
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }

    /// Associated and holding an IPv4 address. Polled by the main loop to
    /// derive the got-IP / link-lost edges.
    fn station_online(&self) -> bool {
        if station_ap_info().is_none() {
            return false;
        }
        self.wifi
            .sta_netif()
            .get_ip_info()
            .map(|ip_info| !ip_info.ip.is_unspecified())
            .unwrap_or(false)
    }
}

impl Radio for EspRadio {
    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        self.ensure_station_started()
            .map_err(|err| RadioError::Scan(err.to_string()))?;

        let found = self
            .wifi
            .scan()
            .map_err(|err| RadioError::Scan(err.to_string()))?;

        Ok(found
            .into_iter()
            .map(|ap| AccessPoint {
                ssid: ap.ssid.to_string(),
                rssi: i32::from(ap.signal_strength),
            })
            .collect())
    }

    fn join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::Join("ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| RadioError::Join("password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(|err| RadioError::Join(err.to_string()))?;
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .start()
                .map_err(|err| RadioError::Join(err.to_string()))?;
        }

        // Association completes (or not) in the background; the main loop
        // observes the outcome through `station_online`.
        self.wifi
            .connect()
            .map_err(|err| RadioError::Join(err.to_string()))
    }

    fn leave(&mut self) {
        let _ = self.wifi.disconnect();
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let config = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::AccessPoint("ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| RadioError::AccessPoint("password too long".to_string()))?,
            auth_method,
            channel: 1,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(|err| RadioError::AccessPoint(err.to_string()))?;
        self.wifi
            .start()
            .map_err(|err| RadioError::AccessPoint(err.to_string()))
    }

    fn current_ssid(&self) -> Option<String> {
        let ap_info = station_ap_info()?;
        let len = ap_info
            .ssid
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(ap_info.ssid.len());
        core::str::from_utf8(&ap_info.ssid[..len])
            .ok()
            .map(str::to_string)
    }
}

fn station_ap_info() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
}

/// Fetches the current time from worldtimeapi.org. Each request runs in its
/// own short-lived thread so the appliance loop never blocks on the network;
/// an unanswered request is simply retried at the next sync interval.
struct WorldTimeAuthority {
    reading: Arc<Mutex<Option<TimeReading>>>,
    request_in_flight: Arc<AtomicBool>,
}

impl WorldTimeAuthority {
    fn new() -> Self {
        Self {
            reading: Arc::new(Mutex::new(None)),
            request_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl TimeAuthority for WorldTimeAuthority {
    fn send_request(&mut self) {
        if self.request_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let reading = self.reading.clone();
        let request_in_flight = self.request_in_flight.clone();
        let spawn_result = thread::Builder::new()
            .name("time-sync".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                match fetch_world_time() {
                    Ok(fresh) => {
                        *reading.lock().unwrap() = Some(fresh);
                    }
                    Err(err) => warn!("time sync request failed: {err:#}"),
                }
                request_in_flight.store(false, Ordering::SeqCst);
            });

        if let Err(err) = spawn_result {
            warn!("failed to spawn time sync thread: {err}");
            self.request_in_flight.store(false, Ordering::SeqCst);
        }
    }

    fn poll_response(&mut self) -> Option<TimeReading> {
        self.reading.lock().unwrap().take()
    }
}

fn fetch_world_time() -> anyhow::Result<TimeReading> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, WORLD_TIME_URL, &[])?;
    let mut response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("time api returned HTTP {status}"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = response.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_TIME_RESPONSE_BYTES {
            return Err(anyhow!("time api response too large"));
        }
    }

    parse_world_time_text(&String::from_utf8_lossy(&body))
        .ok_or_else(|| anyhow!("unrecognized time api response"))
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_network_defaults(&mut runtime);

    let Peripherals { modem, .. } = Peripherals::take()?;
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let mut wifi = WifiManager::new(EspRadio { wifi: esp_wifi }, runtime.wifi.clone());
    for network in &runtime.networks {
        if !wifi.add_credential(network.ssid.clone(), network.password.clone()) {
            warn!("network list is full; ignoring `{}`", network.ssid);
            break;
        }
    }

    let mut clock = MachineClock::new(WorldTimeAuthority::new(), runtime.clock.clone());

    let (mut mqtt_client, mqtt_conn) =
        create_mqtt_client(&runtime.network).context("mqtt client startup failed")?;
    let inbound_topic = message_topic(&runtime.network.phone_number);
    mqtt_client
        .subscribe(&inbound_topic, QoS::AtLeastOnce)
        .context("failed to subscribe to the relay topic")?;

    let (message_tx, message_rx) = mpsc::channel::<String>();
    spawn_mqtt_receiver(mqtt_conn, inbound_topic, message_tx);

    info!("TAG MACHINE");

    if !wifi.begin(monotonic_ms()) {
        warn!("unable to find known wifi networks; check your wifi settings and access point");
        if wifi.create_hotspot(&runtime.device_name, &runtime.device_password) {
            info!(
                "hotspot started: network `{}`, password `{}`",
                runtime.device_name, runtime.device_password
            );
        }
    }

    let mut last_message_id: Option<String> = None;
    let mut last_status_publish_ms = 0_u64;

    loop {
        let now_ms = monotonic_ms();

        // Derive the hardware edges from the netif state so the manager sees
        // got-IP and link-lost exactly once each.
        let online = wifi.radio_mut().station_online();
        match wifi.state() {
            ConnectionState::Connecting if online => wifi.got_ip(),
            ConnectionState::Connected if !online => wifi.link_lost(),
            _ => {}
        }

        let state = wifi.handle(now_ms);

        if let Some(notification) = wifi.take_notification() {
            match notification {
                LinkNotification::Connected => {
                    let ssid = wifi.current_ssid().unwrap_or_default();
                    info!("wifi connected: {ssid}");

                    if clock.begin(5_000, monotonic_ms) {
                        info!("[{}] clock synchronized", clock.timestamp(monotonic_ms()));
                    }
                }
                LinkNotification::ConnectionFailed => warn!("unable to connect to network"),
                LinkNotification::ConnectionLost => {
                    warn!(
                        "[{}] lost wifi connection; searching for networks",
                        clock.timestamp(now_ms)
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

                while let Ok(payload) = message_rx.try_recv() {
                    process_payload(&clock, &payload, &mut last_message_id);
                }

                if now_ms.saturating_sub(last_status_publish_ms) >= STATUS_PUBLISH_INTERVAL_MS {
                    last_status_publish_ms = now_ms;
                    publish_status(&mut mqtt_client, state, &wifi, &clock, &last_message_id, now_ms);
                }
            }
            _ => {}
        }

        thread::sleep(Duration::from_millis(CONTROL_LOOP_MS));
    }
}

fn create_mqtt_client(
    network: &tagmachine_common::NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("tag-machine"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    inbound_topic: String,
    message_tx: mpsc::Sender<String>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if topic != inbound_topic {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!("dropping oversized relay payload ({} bytes)", data.len());
                            continue;
                        }
                        if let Ok(payload) = core::str::from_utf8(data) {
                            if message_tx.send(payload.to_string()).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn publish_status(
    mqtt: &mut EspMqttClient<'static>,
    state: ConnectionState,
    wifi: &WifiManager<EspRadio>,
    clock: &MachineClock<WorldTimeAuthority>,
    last_message_id: &Option<String>,
    now_ms: u64,
) {
    let status = MachineStatus {
        connection: state.as_str(),
        ssid: wifi.current_ssid(),
        time_synced: clock.has_synced(),
        timestamp: clock.timestamp(now_ms),
        last_message_id: last_message_id.clone(),
    };

    match serde_json::to_vec(&status) {
        Ok(body) => {
            if let Err(err) = mqtt.publish(TOPIC_MACHINE_STATE, QoS::AtLeastOnce, true, &body) {
                warn!("machine state publish failed: {err:?}");
            }
        }
        Err(err) => warn!("machine state serialization failed: {err}"),
    }
}

/// Renders one relay payload. The thermal printer transport hooks in here;
/// until then every line lands in the log in print order.
fn process_payload(
    clock: &MachineClock<WorldTimeAuthority>,
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

    if let Some(ssid) = option_env!("WIFI_SSID") {
        let password = option_env!("WIFI_PASS").unwrap_or_default();
        runtime.networks.push(NetworkCredential {
            ssid: ssid.to_string(),
            password: password.to_string(),
        });
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
