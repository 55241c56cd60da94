//! # BLE Device Manager
//!
//! Owns the connection lifecycle of the EMG sensor: scan, select, connect,
//! discover, subscribe, stream and disconnect. Exactly one connection state is
//! live at a time and every transition goes through [`DeviceManager`].
//!
//! ## Event pump
//! The manager is single-owner. Operations take `&mut self`, and
//! [`DeviceManager::next_event`] waits for whatever the current state produces
//! (discoveries and the scan deadline while scanning, notifications or
//! synthetic ticks while streaming). `next_event` is cancel-safe, so a caller
//! can `select!` it against incoming commands and run an operation in between.
//! State changes made by `next_event` itself (scan deadline, link loss) are
//! applied before it returns; the transport teardown they need runs as a
//! background task that the next operation waits for.
//!
//! ## Faults
//! `connect` never returns an error: every fault ends up in
//! [`ConnectResult::error`] and a `Failed` state after the link is torn down.
//! Reconnection after an unexpected drop is left to the caller.

use crate::decoder::{decode, synthetic_sample, SignalSample};
use crate::device_scanner::{PeripheralDescriptor, PeripheralRegistry};
use crate::error::{ConnectError, ScanError, TransportError};
use crate::gatt::{select_target, MatchTier, TargetUuids};
use crate::timeseries::{SampleWindow, DEFAULT_WINDOW_LEN};
use crate::transport::{DiscoveryStream, NotificationStream, Transport};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

// Payloads checked after a first-available selection before trusting the stream
const PROBE_PAYLOADS: u8 = 5;

/// Tunables for the device manager
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub target: TargetUuids,
    pub window_len: usize,
    /// Period of the synthetic stream used for non-notifiable characteristics
    pub synthetic_interval: Duration,
    /// Upper bound for opening the link and for service discovery
    pub connect_timeout: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            target: TargetUuids::default(),
            window_len: DEFAULT_WINDOW_LEN,
            synthetic_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Characteristic change notifications
    Notify,
    /// Fixed-interval synthetic samples
    SyntheticPoll,
}

/// Identifies the characteristic feeding the live stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub mode: StreamMode,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting(PeripheralDescriptor),
    Discovering(PeripheralDescriptor),
    Streaming(PeripheralDescriptor, SubscriptionHandle),
    Disconnecting,
    Failed(String),
}

impl ConnectionState {
    /// Peripheral involved in the current state, if any
    pub fn peripheral(&self) -> Option<&PeripheralDescriptor> {
        match self {
            ConnectionState::Connecting(p)
            | ConnectionState::Discovering(p)
            | ConnectionState::Streaming(p, _) => Some(p),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ConnectionState::Streaming(..))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting(p) => write!(f, "connecting to {}", p.id),
            ConnectionState::Discovering(p) => write!(f, "discovering services of {}", p.id),
            ConnectionState::Streaming(p, _) => write!(f, "streaming from {}", p.id),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Whether a scan has run, so "found nothing" differs from "never scanned"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    NotStarted,
    InProgress,
    Completed { found: usize },
}

/// Outcome of [`DeviceManager::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub success: bool,
    pub device_id: String,
    pub device_name: Option<String>,
    pub error: Option<ConnectError>,
}

impl ConnectResult {
    fn connected(descriptor: &PeripheralDescriptor) -> Self {
        Self {
            success: true,
            device_id: descriptor.id.clone(),
            device_name: descriptor.name.clone(),
            error: None,
        }
    }

    fn failed(descriptor: &PeripheralDescriptor, error: ConnectError) -> Self {
        Self {
            success: false,
            device_id: descriptor.id.clone(),
            device_name: descriptor.name.clone(),
            error: Some(error),
        }
    }
}

/// Something the manager observed while pumping events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A new peripheral entered the registry
    Discovered(PeripheralDescriptor),
    /// The scan timeout elapsed
    ScanFinished { found: usize },
    /// A sample was appended to the window
    Sample(SignalSample),
    /// The link dropped without being asked to
    ConnectionLost { device_id: String, reason: String },
}

struct ScanSession {
    discoveries: DiscoveryStream,
    deadline: Instant,
}

enum SampleSource {
    Notifications(NotificationStream),
    Synthetic(Interval),
}

/// Checks that the first payloads of a fallback-selected characteristic decode
struct CapabilityProbe {
    remaining: u8,
    failures: u8,
}

impl CapabilityProbe {
    fn observe(&mut self, decoded: bool, characteristic: &Uuid) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        if !decoded {
            self.failures += 1;
        }
        if self.remaining == 0 {
            if self.failures > 0 {
                log::warn!(
                    "{} of the first {} payloads from fallback characteristic {} did not decode; \
                     it may not be the sensor stream",
                    self.failures,
                    PROBE_PAYLOADS,
                    characteristic
                );
            } else {
                log::info!("Fallback characteristic {} carries decodable payloads", characteristic);
            }
        }
    }
}

struct ActiveLink {
    device_id: String,
    service: Uuid,
    characteristic: Uuid,
    source: SampleSource,
    probe: CapabilityProbe,
}

/// State machine for one sensor session
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    settings: DeviceSettings,
    state: ConnectionState,
    permissions: Option<bool>,
    registry: PeripheralRegistry,
    window: SampleWindow,
    scan: Option<ScanSession>,
    scan_status: ScanStatus,
    link: Option<ActiveLink>,
    teardown: Option<JoinHandle<()>>,
    rng: StdRng,
}

impl DeviceManager {
    pub fn new(transport: Arc<dyn Transport>, settings: DeviceSettings) -> Self {
        let window = SampleWindow::new(settings.window_len);
        Self {
            transport,
            settings,
            state: ConnectionState::Disconnected,
            permissions: None,
            registry: PeripheralRegistry::new(),
            window,
            scan: None,
            scan_status: ScanStatus::NotStarted,
            link: None,
            teardown: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn scan_status(&self) -> ScanStatus {
        self.scan_status
    }

    /// Copy of the live sample window, oldest first
    pub fn live_samples(&self) -> Vec<u8> {
        self.window.values()
    }

    pub fn scanned_peripherals(&self, priority_id: Option<&str>) -> Vec<PeripheralDescriptor> {
        self.registry.list_ordered(priority_id)
    }

    pub fn find_peripheral(&self, id: &str) -> Option<PeripheralDescriptor> {
        self.registry.get(id).cloned()
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("Connection state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Ask the platform for Bluetooth permissions
    pub async fn request_permissions(&mut self) -> bool {
        let granted = match self.transport.request_permissions().await {
            Ok(granted) => granted,
            Err(e) => {
                log::error!("Permission request failed: {}", e);
                false
            }
        };
        if !granted {
            log::warn!("Bluetooth permissions were not granted");
        }
        self.permissions = Some(granted);
        granted
    }

    async fn ensure_permissions(&mut self) -> bool {
        match self.permissions {
            Some(true) => true,
            _ => self.request_permissions().await,
        }
    }

    /// Start a scan that ends by itself after `timeout`
    ///
    /// Calling this while already scanning only pushes the deadline out.
    pub async fn start_scan(&mut self, timeout: Duration) -> Result<(), ScanError> {
        match &self.state {
            ConnectionState::Scanning => {
                if let Some(scan) = self.scan.as_mut() {
                    scan.deadline = Instant::now() + timeout;
                    log::debug!("Scan already running, deadline reset to {:?} from now", timeout);
                }
                return Ok(());
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
            other => return Err(ScanError::InvalidState(other.to_string())),
        }

        self.settle_teardown().await;
        if !self.ensure_permissions().await {
            return Err(ScanError::PermissionDenied);
        }

        self.registry.clear();
        let discoveries = self.transport.start_scan().await.map_err(ScanError::Transport)?;
        self.scan = Some(ScanSession {
            discoveries,
            deadline: Instant::now() + timeout,
        });
        self.scan_status = ScanStatus::InProgress;
        self.set_state(ConnectionState::Scanning);
        log::info!("Scanning for peripherals for {:?}", timeout);
        Ok(())
    }

    pub async fn stop_scan(&mut self) {
        if self.scan.is_none() {
            log::debug!("stop_scan: no scan in progress");
            return;
        }
        self.finish_scan();
        self.set_state(ConnectionState::Disconnected);
        Self::stop_transport_scan(self.transport.clone()).await;
    }

    fn finish_scan(&mut self) -> usize {
        self.scan = None;
        let found = self.registry.len();
        self.scan_status = ScanStatus::Completed { found };
        found
    }

    async fn stop_transport_scan(transport: Arc<dyn Transport>) {
        if let Err(e) = transport.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
    }

    /// Run transport teardown in the background, after any still pending
    fn spawn_teardown(&mut self, teardown: impl Future<Output = ()> + Send + 'static) {
        let previous = self.teardown.take();
        self.teardown = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            teardown.await;
        }));
    }

    /// Wait for background teardown before the transport is used again
    async fn settle_teardown(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            if let Err(e) = teardown.await {
                log::warn!("Background teardown failed: {}", e);
            }
        }
    }

    /// Connect to a peripheral and start streaming from it
    ///
    /// Any previous connection or running scan is torn down first.
    pub async fn connect(&mut self, descriptor: PeripheralDescriptor) -> ConnectResult {
        self.settle_teardown().await;
        if !matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed(_))
            || self.link.is_some()
        {
            log::info!("Releasing current session before connecting to {}", descriptor.id);
            self.disconnect().await;
        }

        if !self.ensure_permissions().await {
            self.set_state(ConnectionState::Failed(ConnectError::PermissionDenied.to_string()));
            return ConnectResult::failed(&descriptor, ConnectError::PermissionDenied);
        }

        match self.establish(&descriptor).await {
            Ok(handle) => {
                log::info!(
                    "Streaming from {} ({:?}, characteristic {})",
                    descriptor.id,
                    handle.mode,
                    handle.characteristic
                );
                self.set_state(ConnectionState::Streaming(descriptor.clone(), handle));
                ConnectResult::connected(&descriptor)
            }
            Err(e) => {
                log::error!("Connection to {} failed: {}", descriptor.id, e);
                if let Err(teardown) = self.transport.disconnect(&descriptor.id).await {
                    log::warn!("Teardown after failed connect: {}", teardown);
                }
                self.window.clear();
                self.set_state(ConnectionState::Failed(e.to_string()));
                ConnectResult::failed(&descriptor, e)
            }
        }
    }

    async fn establish(
        &mut self,
        descriptor: &PeripheralDescriptor,
    ) -> Result<SubscriptionHandle, ConnectError> {
        let device_id = descriptor.id.as_str();
        let limit = self.settings.connect_timeout;

        self.set_state(ConnectionState::Connecting(descriptor.clone()));
        tokio::time::timeout(limit, self.transport.connect(device_id))
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;

        self.set_state(ConnectionState::Discovering(descriptor.clone()));
        let services = tokio::time::timeout(limit, self.transport.discover(device_id))
            .await
            .map_err(|_| TransportError::Timeout("service discovery"))??;
        log::debug!("{} exposes {} service(s)", device_id, services.len());

        let target = select_target(&services, &self.settings.target).ok_or_else(|| {
            ConnectError::NoCompatiblePeripheral {
                device_id: device_id.to_string(),
            }
        })?;
        if target.tier != MatchTier::Exact {
            log::warn!(
                "{}: using {:?} match service {} / characteristic {}",
                device_id,
                target.tier,
                target.service,
                target.characteristic
            );
        }

        let (source, mode) = if target.notifiable {
            let stream = self
                .transport
                .subscribe(device_id, target.service, target.characteristic)
                .await?;
            (SampleSource::Notifications(stream), StreamMode::Notify)
        } else {
            log::warn!(
                "Characteristic {} cannot notify, generating samples every {:?}",
                target.characteristic,
                self.settings.synthetic_interval
            );
            let mut interval = tokio::time::interval(self.settings.synthetic_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            (SampleSource::Synthetic(interval), StreamMode::SyntheticPoll)
        };

        let probe_payloads = if target.tier == MatchTier::FirstAvailable && mode == StreamMode::Notify {
            PROBE_PAYLOADS
        } else {
            0
        };

        self.window.clear();
        self.link = Some(ActiveLink {
            device_id: device_id.to_string(),
            service: target.service,
            characteristic: target.characteristic,
            source,
            probe: CapabilityProbe {
                remaining: probe_payloads,
                failures: 0,
            },
        });

        Ok(SubscriptionHandle {
            service: target.service,
            characteristic: target.characteristic,
            mode,
            tier: target.tier,
        })
    }

    /// Tear down the current scan or connection
    ///
    /// The subscription or synthetic timer is cancelled before the link is
    /// closed. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.settle_teardown().await;
        if self.state == ConnectionState::Disconnected && self.link.is_none() && self.scan.is_none() {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        if self.scan.is_some() {
            self.finish_scan();
            Self::stop_transport_scan(self.transport.clone()).await;
        }
        if let Some(link) = self.link.take() {
            Self::close_link(self.transport.clone(), link).await;
        }
        self.window.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn close_link(transport: Arc<dyn Transport>, link: ActiveLink) {
        let ActiveLink {
            device_id,
            service,
            characteristic,
            source,
            ..
        } = link;
        match source {
            SampleSource::Notifications(stream) => {
                drop(stream);
                if let Err(e) = transport.unsubscribe(&device_id, service, characteristic).await {
                    log::warn!("Failed to unsubscribe from {}: {}", device_id, e);
                }
            }
            SampleSource::Synthetic(interval) => drop(interval),
        }
        if let Err(e) = transport.disconnect(&device_id).await {
            log::warn!("Failed to disconnect {}: {}", device_id, e);
        } else {
            log::info!("Disconnected from device: {}", device_id);
        }
    }

    /// Run teardown before the manager goes away
    pub async fn shutdown(mut self) {
        self.disconnect().await;
    }

    /// Wait for the next thing the current state produces
    ///
    /// Pending forever while idle. Cancel-safe.
    pub async fn next_event(&mut self) -> ManagerEvent {
        loop {
            if let Some(scan) = self.scan.as_mut() {
                let deadline = scan.deadline;
                tokio::select! {
                    found = scan.discoveries.next() => match found {
                        Some(descriptor) => {
                            if self.registry.add(descriptor.clone()) {
                                log::debug!("Discovered {} ({:?})", descriptor.id, descriptor.name);
                                return ManagerEvent::Discovered(descriptor);
                            }
                        }
                        None => {
                            log::debug!("Discovery stream ended before the scan deadline");
                            if let Some(scan) = self.scan.as_mut() {
                                scan.discoveries = futures::stream::pending().boxed();
                            }
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        let found = self.finish_scan();
                        self.set_state(ConnectionState::Disconnected);
                        let transport = self.transport.clone();
                        self.spawn_teardown(Self::stop_transport_scan(transport));
                        log::info!("Scan finished, {} peripheral(s) found", found);
                        return ManagerEvent::ScanFinished { found };
                    }
                }
                continue;
            }

            if let Some(link) = self.link.as_mut() {
                match &mut link.source {
                    SampleSource::Notifications(stream) => {
                        let next = stream.next().await;
                        return match next {
                            Some(payload) => ManagerEvent::Sample(self.ingest(&payload)),
                            None => self.handle_link_lost(),
                        };
                    }
                    SampleSource::Synthetic(interval) => {
                        interval.tick().await;
                        let sample = synthetic_sample(self.window.last(), &mut self.rng);
                        self.window.push(sample);
                        return ManagerEvent::Sample(sample);
                    }
                }
            }

            return std::future::pending().await;
        }
    }

    fn ingest(&mut self, payload: &[u8]) -> SignalSample {
        let decoded = decode(payload);
        if let Some(link) = self.link.as_mut() {
            link.probe.observe(decoded.is_ok(), &link.characteristic);
        }
        let sample = match decoded {
            Ok(sample) => sample,
            Err(e) => {
                log::debug!("{}, substituting synthetic sample", e);
                synthetic_sample(self.window.last(), &mut self.rng)
            }
        };
        self.window.push(sample);
        sample
    }

    fn handle_link_lost(&mut self) -> ManagerEvent {
        let device_id = self
            .link
            .as_ref()
            .map(|link| link.device_id.clone())
            .unwrap_or_default();
        let reason = format!("Connection to {} was lost", device_id);
        log::warn!("{}", reason);
        if let Some(link) = self.link.take() {
            let transport = self.transport.clone();
            self.spawn_teardown(Self::close_link(transport, link));
        }
        self.window.clear();
        self.set_state(ConnectionState::Failed(reason.clone()));
        ManagerEvent::ConnectionLost { device_id, reason }
    }
}
