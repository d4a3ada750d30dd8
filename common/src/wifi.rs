use crate::{
    config::WifiConfig,
    types::{AccessPoint, ConnectionState, LinkNotification, NetworkCredential},
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("join failed: {0}")]
    Join(String),
    #[error("access point failed: {0}")]
    AccessPoint(String),
}

/// Hardware seam for the connection manager. Production implementations wrap
/// the platform wifi driver; tests script one.
///
/// `scan` is blocking and bounded by the driver. `join` only *requests*
/// association; the outcome arrives later through `WifiManager::got_ip` /
/// `WifiManager::link_lost`, which the platform layer calls from its event
/// source.
pub trait Radio {
    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError>;
    fn join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn leave(&mut self);
    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn current_ssid(&self) -> Option<String>;
}

/// Connects to the strongest of multiple known wifi networks, rescans
/// automatically while disconnected, and can switch to access-point mode.
///
/// Call `add_credential` at least once, then `begin` to attempt a first
/// connection. Call `handle` every loop iteration and acknowledge the
/// transient states it reports with `set_connected` / `set_idle`; they are
/// deliberately not self-clearing so the caller observes every transition
/// exactly once, however irregular its polling.
pub struct WifiManager<R: Radio> {
    radio: R,
    config: WifiConfig,
    networks: Vec<NetworkCredential>,
    state: ConnectionState,
    connect_started_ms: Option<u64>,
    pending: Option<LinkNotification>,
}

impl<R: Radio> WifiManager<R> {
    pub fn new(radio: R, mut config: WifiConfig) -> Self {
        config.sanitize();
        Self {
            radio,
            config,
            networks: Vec::new(),
            state: ConnectionState::Idle,
            connect_started_ms: None,
            pending: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn known_networks(&self) -> &[NetworkCredential] {
        &self.networks
    }

    /// The platform layer pumps its own radio (event polling, simulation)
    /// through here.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Appends a credential. Returns false once the capacity is reached; the
    /// list is append-only and never deduplicated.
    pub fn add_credential(&mut self, ssid: impl Into<String>, password: impl Into<String>) -> bool {
        if self.networks.len() >= self.config.max_networks {
            return false;
        }
        self.networks.push(NetworkCredential {
            ssid: ssid.into(),
            password: password.into(),
        });
        true
    }

    /// Consumes the pending edge notification, if any. Each transition is
    /// reported at most once.
    pub fn take_notification(&mut self) -> Option<LinkNotification> {
        self.pending.take()
    }

    /// Bootstrap: scan for a known network and start connecting to it,
    /// retrying the scan once more before giving up. Returns true iff a
    /// connection attempt was initiated. Re-entering `begin` discards any
    /// in-flight attempt.
    pub fn begin(&mut self, now_ms: u64) -> bool {
        self.state = ConnectionState::Idle;
        self.connect_started_ms = None;
        self.pending = None;

        self.scan_and_select(now_ms);
        if self.state != ConnectionState::Connecting {
            self.scan_and_select(now_ms);
        }

        self.state == ConnectionState::Connecting
    }

    /// Must be invoked every loop iteration. Enforces the connect timeout,
    /// rescans while idle, and otherwise just reports the current state.
    pub fn handle(&mut self, now_ms: u64) -> ConnectionState {
        match self.state {
            ConnectionState::Connecting => {
                if let Some(started) = self.connect_started_ms {
                    if now_ms.saturating_sub(started) > self.config.connect_timeout_ms {
                        self.connect_started_ms = None;
                        self.state = ConnectionState::ConnectionFailed;
                        self.pending = Some(LinkNotification::ConnectionFailed);
                    }
                }
            }
            ConnectionState::Idle | ConnectionState::ScanFailed => {
                self.scan_and_select(now_ms);
            }
            _ => {}
        }

        self.state
    }

    /// Switches the radio to access-point mode. On success the manager stays
    /// in HOTSPOT until `begin` is called again.
    pub fn create_hotspot(&mut self, ssid: &str, password: &str) -> bool {
        match self.radio.start_access_point(ssid, password) {
            Ok(()) => {
                self.connect_started_ms = None;
                self.state = ConnectionState::Hotspot;
                true
            }
            Err(_) => false,
        }
    }

    /// Acknowledgement transition after CONNECTION_FAILED / CONNECTION_LOST
    /// (or to abandon any other state); `handle` will scan again from here.
    pub fn set_idle(&mut self) {
        self.connect_started_ms = None;
        self.state = ConnectionState::Idle;
    }

    /// Acknowledgement transition after CONNECTION_SUCCESS.
    pub fn set_connected(&mut self) {
        if self.state == ConnectionState::ConnectionSuccess {
            self.state = ConnectionState::Connected;
        }
    }

    /// SSID reported by the radio; only meaningful while CONNECTED.
    pub fn current_ssid(&self) -> Option<String> {
        self.radio.current_ssid()
    }

    /// Hardware event: the station acquired an IP address.
    pub fn got_ip(&mut self) {
        self.connect_started_ms = None;
        self.state = ConnectionState::ConnectionSuccess;
        self.pending = Some(LinkNotification::Connected);
    }

    /// Hardware event: the station lost its association. Only an established
    /// connection reports CONNECTION_LOST, so the edge fires at most once per
    /// connected session.
    pub fn link_lost(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::ConnectionLost;
            self.pending = Some(LinkNotification::ConnectionLost);
        }
    }

    fn scan_and_select(&mut self, now_ms: u64) {
        self.state = ConnectionState::Scanning;
        self.radio.leave();

        let found = self.radio.scan().unwrap_or_default();
        self.process_scan(&found, now_ms);
    }

    fn process_scan(&mut self, found: &[AccessPoint], now_ms: u64) {
        let mut best: Option<NetworkCredential> = None;
        let mut best_rssi = i32::MIN;

        // Iteration follows scan order, so on equal RSSI the first-seen
        // access point wins.
        for ap in found {
            if ap.rssi <= best_rssi {
                continue;
            }
            if let Some(known) = self.networks.iter().find(|n| n.ssid == ap.ssid) {
                best_rssi = ap.rssi;
                best = Some(known.clone());
            }
        }

        match best {
            Some(credential) => self.connect(&credential, now_ms),
            None => self.state = ConnectionState::ScanFailed,
        }
    }

    fn connect(&mut self, credential: &NetworkCredential, now_ms: u64) {
        self.state = ConnectionState::Connecting;
        self.connect_started_ms = Some(now_ms);

        if self
            .radio
            .join(&credential.ssid, &credential.password)
            .is_err()
        {
            self.connect_started_ms = None;
            self.state = ConnectionState::ConnectionFailed;
            self.pending = Some(LinkNotification::ConnectionFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct FakeRadio {
        scans: VecDeque<Result<Vec<AccessPoint>, RadioError>>,
        scans_run: u32,
        joins: Vec<(String, String)>,
        ap_requests: Vec<(String, String)>,
        ap_fails: bool,
        ssid: Option<String>,
    }

    impl FakeRadio {
        fn new() -> Self {
            Self {
                scans: VecDeque::new(),
                scans_run: 0,
                joins: Vec::new(),
                ap_requests: Vec::new(),
                ap_fails: false,
                ssid: None,
            }
        }

        fn with_scans(scans: Vec<Vec<AccessPoint>>) -> Self {
            let mut radio = Self::new();
            radio.scans = scans.into_iter().map(Ok).collect();
            radio
        }
    }

    impl Radio for FakeRadio {
        fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
            self.scans_run += 1;
            self.scans
                .pop_front()
                .unwrap_or_else(|| Err(RadioError::Scan("no scripted scan".to_string())))
        }

        fn join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
            self.joins.push((ssid.to_string(), password.to_string()));
            Ok(())
        }

        fn leave(&mut self) {}

        fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
            if self.ap_fails {
                return Err(RadioError::AccessPoint("radio busy".to_string()));
            }
            self.ap_requests
                .push((ssid.to_string(), password.to_string()));
            Ok(())
        }

        fn current_ssid(&self) -> Option<String> {
            self.ssid.clone()
        }
    }

    fn ap(ssid: &str, rssi: i32) -> AccessPoint {
        AccessPoint {
            ssid: ssid.to_string(),
            rssi,
        }
    }

    fn manager_with(radio: FakeRadio) -> WifiManager<FakeRadio> {
        let mut manager = WifiManager::new(radio, WifiConfig::default());
        assert!(manager.add_credential("KnownNet", "hunter2"));
        assert!(manager.add_credential("KnownNet2", ""));
        manager
    }

    #[test]
    fn begin_connects_to_strongest_known_network() {
        let radio = FakeRadio::with_scans(vec![vec![
            ap("A", -80),
            ap("KnownNet", -50),
            ap("KnownNet2", -40),
        ]]);
        let mut manager = manager_with(radio);

        assert!(manager.begin(0));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(
            manager.radio.joins,
            vec![("KnownNet2".to_string(), String::new())]
        );
    }

    #[test]
    fn begin_never_joins_an_unknown_network() {
        let radio = FakeRadio::with_scans(vec![
            vec![ap("Stranger", -10), ap("Other", -20)],
            vec![ap("Stranger", -10)],
        ]);
        let mut manager = manager_with(radio);

        assert!(!manager.begin(0));
        assert_eq!(manager.state(), ConnectionState::ScanFailed);
        assert!(manager.radio.joins.is_empty());
    }

    #[test]
    fn begin_retries_the_scan_exactly_once() {
        let radio = FakeRadio::with_scans(vec![Vec::new(), vec![ap("KnownNet", -70)]]);
        let mut manager = manager_with(radio);

        assert!(manager.begin(0));
        assert_eq!(manager.radio.scans_run, 2);
        assert_eq!(
            manager.radio.joins,
            vec![("KnownNet".to_string(), "hunter2".to_string())]
        );
    }

    #[test]
    fn equal_rssi_keeps_the_first_seen_access_point() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet2", -55), ap("KnownNet", -55)]]);
        let mut manager = manager_with(radio);

        assert!(manager.begin(0));
        assert_eq!(manager.radio.joins[0].0, "KnownNet2");
    }

    #[test]
    fn scan_errors_degrade_to_scan_failed() {
        let mut radio = FakeRadio::new();
        radio.scans.push_back(Err(RadioError::Scan("off".to_string())));
        radio.scans.push_back(Err(RadioError::Scan("off".to_string())));
        let mut manager = manager_with(radio);

        assert!(!manager.begin(0));
        assert_eq!(manager.state(), ConnectionState::ScanFailed);
    }

    #[test]
    fn connect_timeout_fires_only_past_the_deadline() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet", -50)]]);
        let mut manager = manager_with(radio);
        assert!(manager.begin(1_000));

        assert_eq!(manager.handle(11_000), ConnectionState::Connecting);
        assert_eq!(manager.take_notification(), None);

        assert_eq!(manager.handle(11_001), ConnectionState::ConnectionFailed);
        assert_eq!(
            manager.take_notification(),
            Some(LinkNotification::ConnectionFailed)
        );
        assert_eq!(manager.take_notification(), None);
    }

    #[test]
    fn failed_state_persists_until_acknowledged() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet", -50)]]);
        let mut manager = manager_with(radio);
        assert!(manager.begin(0));
        manager.handle(20_000);

        // Not self-clearing: repeated polling reports the same state and no
        // further notifications.
        assert_eq!(manager.handle(30_000), ConnectionState::ConnectionFailed);
        assert_eq!(manager.handle(40_000), ConnectionState::ConnectionFailed);

        manager.set_idle();
        manager.radio.scans.push_back(Ok(vec![ap("KnownNet", -48)]));
        assert_eq!(manager.handle(41_000), ConnectionState::Connecting);
    }

    #[test]
    fn got_ip_then_ack_reaches_connected() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet", -50)]]);
        let mut manager = manager_with(radio);
        assert!(manager.begin(0));

        manager.got_ip();
        assert_eq!(manager.state(), ConnectionState::ConnectionSuccess);
        assert_eq!(
            manager.take_notification(),
            Some(LinkNotification::Connected)
        );

        manager.set_connected();
        assert_eq!(manager.handle(5_000), ConnectionState::Connected);
        // No stale timeout: the connect timer was cleared by the IP event.
        assert_eq!(manager.handle(500_000), ConnectionState::Connected);
    }

    #[test]
    fn connection_lost_fires_at_most_once_per_session() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet", -50)]]);
        let mut manager = manager_with(radio);
        assert!(manager.begin(0));
        manager.got_ip();
        manager.take_notification();
        manager.set_connected();

        manager.link_lost();
        assert_eq!(manager.state(), ConnectionState::ConnectionLost);
        assert_eq!(
            manager.take_notification(),
            Some(LinkNotification::ConnectionLost)
        );

        // Repeated disconnect events while already down stay silent.
        manager.link_lost();
        manager.link_lost();
        assert_eq!(manager.state(), ConnectionState::ConnectionLost);
        assert_eq!(manager.take_notification(), None);
    }

    #[test]
    fn idle_rescans_every_iteration() {
        let radio = FakeRadio::with_scans(vec![Vec::new(), Vec::new(), Vec::new()]);
        let mut manager = manager_with(radio);

        manager.handle(0);
        manager.handle(100);
        manager.handle(200);
        assert_eq!(manager.radio.scans_run, 3);
        assert_eq!(manager.state(), ConnectionState::ScanFailed);
    }

    #[test]
    fn add_credential_rejects_past_capacity() {
        let mut manager = WifiManager::new(
            FakeRadio::new(),
            WifiConfig {
                connect_timeout_ms: 10_000,
                max_networks: 32,
            },
        );

        for i in 0..32 {
            assert!(manager.add_credential(format!("net-{i}"), ""));
        }
        assert!(!manager.add_credential("one-too-many", ""));
        assert_eq!(manager.known_networks().len(), 32);
        assert_eq!(manager.known_networks().last().unwrap().ssid, "net-31");
    }

    #[test]
    fn create_hotspot_success_and_failure() {
        let mut manager = manager_with(FakeRadio::new());

        assert!(manager.create_hotspot("tagmachine", "sebastian"));
        assert_eq!(manager.state(), ConnectionState::Hotspot);
        assert_eq!(
            manager.radio.ap_requests,
            vec![("tagmachine".to_string(), "sebastian".to_string())]
        );

        // Hotspot is terminal for handle(); no scanning happens from here.
        assert_eq!(manager.handle(1_000), ConnectionState::Hotspot);
        assert_eq!(manager.radio.scans_run, 0);

        let mut failing = manager_with(FakeRadio::new());
        failing.radio.ap_fails = true;
        assert!(!failing.create_hotspot("tagmachine", "sebastian"));
        assert_eq!(failing.state(), ConnectionState::Idle);
    }

    #[test]
    fn begin_discards_an_in_flight_attempt() {
        let radio = FakeRadio::with_scans(vec![vec![ap("KnownNet", -50)]]);
        let mut manager = manager_with(radio);
        assert!(manager.begin(0));
        manager.handle(20_000);
        assert_eq!(manager.state(), ConnectionState::ConnectionFailed);

        manager.radio.scans.push_back(Ok(vec![ap("KnownNet2", -30)]));
        assert!(manager.begin(21_000));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        // The stale failure notification was discarded by re-entry.
        assert_eq!(manager.take_notification(), None);
    }
}
