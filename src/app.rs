//! # Terminal Front-End
//!
//! Consumer of the connectivity and health core. Keeps the last known
//! connection state, peripherals, live samples and health snapshot, and renders
//! them as text.
//!
//! ## Update Flow
//! `Message::Tick` drains every pending `SensorUpdate` without blocking and
//! picks up a newly published health snapshot. User actions become
//! `ConnectionCommand`s for the connection thread or direct calls on the
//! `HealthAggregator`.

use crate::connection::{ConnectionCommand, SensorUpdate};
use crate::device_scanner::PeripheralDescriptor;
use crate::error::ScanError;
use crate::health::{HealthAggregator, HealthSnapshot};
use crate::health_store::MetricKind;
use crate::sensor::ConnectionState;
use crate::timeseries::display_max;
use crossbeam_channel::Receiver;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

const SPARK_LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Tick,
    RequestPermissions,
    ScanDevices,
    StopScan,
    ConnectDevice(String),
    DisconnectDevice,
    RequestHealthAuthorization,
    RefreshHealth,
    RecordActivity,
    PeriodicHealth(bool),
    Quit,
}

pub struct FitSense {
    receiver: Receiver<SensorUpdate>,
    command_sender: UnboundedSender<ConnectionCommand>,
    health: HealthAggregator,
    health_updates: watch::Receiver<Option<HealthSnapshot>>,
    scan_timeout: Duration,
    enable_autoconnect: bool,
    autoconnect_pending: bool,
    dirty: bool,
    pub connection_state: ConnectionState,
    pub available_devices: Vec<PeripheralDescriptor>,
    pub live_samples: Vec<u8>,
    pub health_snapshot: Option<HealthSnapshot>,
    pub status: Option<String>,
}

impl FitSense {
    pub fn new(
        receiver: Receiver<SensorUpdate>,
        command_sender: UnboundedSender<ConnectionCommand>,
        health: HealthAggregator,
        scan_timeout: Duration,
        enable_autoconnect: bool,
    ) -> Self {
        let health_updates = health.subscribe();
        FitSense {
            receiver,
            command_sender,
            health,
            health_updates,
            scan_timeout,
            enable_autoconnect,
            autoconnect_pending: false,
            dirty: true,
            connection_state: ConnectionState::Disconnected,
            available_devices: Vec::new(),
            live_samples: Vec::new(),
            health_snapshot: None,
            status: None,
        }
    }

    /// Apply one message; returns false once the app should exit
    pub async fn update(&mut self, message: Message) -> bool {
        match message {
            Message::Tick => {
                // Process all pending updates without blocking
                while let Ok(update) = self.receiver.try_recv() {
                    self.handle_sensor_update(update);
                }
                if self.health_updates.has_changed().unwrap_or(false) {
                    self.health_snapshot = self.health_updates.borrow_and_update().clone();
                    self.dirty = true;
                }
            }
            Message::RequestPermissions => self.send_command(ConnectionCommand::RequestPermissions),
            Message::ScanDevices => {
                self.available_devices.clear();
                self.autoconnect_pending = self.enable_autoconnect;
                self.send_command(ConnectionCommand::StartScan(self.scan_timeout));
            }
            Message::StopScan => self.send_command(ConnectionCommand::StopScan),
            Message::ConnectDevice(device_id) => {
                self.autoconnect_pending = false;
                self.send_command(ConnectionCommand::Connect(device_id));
            }
            Message::DisconnectDevice => self.send_command(ConnectionCommand::Disconnect),
            Message::RequestHealthAuthorization => {
                let granted = self.health.request_authorization().await;
                self.set_status(if granted {
                    "Health access granted".to_string()
                } else {
                    "Health access denied".to_string()
                });
            }
            Message::RefreshHealth => match self.health.refresh().await {
                Ok(snapshot) => {
                    self.health_snapshot = Some(snapshot);
                    drop(self.health_updates.borrow_and_update());
                    self.dirty = true;
                }
                Err(e) => self.set_status(e.to_string()),
            },
            Message::RecordActivity => match self.health.record_synthetic_activity().await {
                Ok(workout) => self.set_status(format!(
                    "Recorded {:?} workout: {:.0} kcal, {:.0} m",
                    workout.activity, workout.energy_kcal, workout.distance_m
                )),
                Err(e) => self.set_status(e.to_string()),
            },
            Message::PeriodicHealth(enabled) => {
                if enabled {
                    self.health.start_periodic();
                } else {
                    self.health.stop_periodic();
                }
            }
            Message::Quit => {
                self.health.stop_periodic();
                self.send_command(ConnectionCommand::Shutdown);
                return false;
            }
        }
        true
    }

    fn handle_sensor_update(&mut self, update: SensorUpdate) {
        self.dirty = true;
        match update {
            SensorUpdate::ConnectionStatus(state) => {
                match &state {
                    ConnectionState::Disconnected => self.live_samples.clear(),
                    ConnectionState::Failed(reason) => {
                        self.status = Some(format!("Connection error: {}", reason));
                    }
                    _ => {}
                }
                self.connection_state = state;
            }
            SensorUpdate::Permissions(granted) => {
                self.status = Some(if granted {
                    "Bluetooth permissions granted".to_string()
                } else {
                    "Bluetooth permissions are required to scan for sensors".to_string()
                });
            }
            SensorUpdate::PeripheralFound(descriptor) => {
                if !self.available_devices.iter().any(|d| d.id == descriptor.id) {
                    self.available_devices.push(descriptor);
                }
            }
            SensorUpdate::ScanCompleted(Ok(devices)) => {
                self.available_devices = devices;
                if std::mem::take(&mut self.autoconnect_pending) {
                    if let Some(first) = self.available_devices.first() {
                        log::info!("Auto-connecting to {}", first.id);
                        let command = ConnectionCommand::Connect(first.id.clone());
                        self.send_command(command);
                    }
                }
            }
            SensorUpdate::ScanCompleted(Err(e)) => {
                self.autoconnect_pending = false;
                if e == ScanError::NoPeripheralsFound {
                    self.available_devices.clear();
                }
                self.status = Some(e.to_string());
            }
            SensorUpdate::Connected(result) => {
                self.status = Some(match (&result.error, result.success) {
                    (None, true) => format!(
                        "Connected to {}",
                        result.device_name.as_deref().unwrap_or(&result.device_id)
                    ),
                    (Some(e), _) => format!("Connection failed: {}", e),
                    (None, false) => "Connection failed".to_string(),
                });
            }
            SensorUpdate::Samples(samples) => self.live_samples = samples,
            SensorUpdate::ConnectionLost(reason) => {
                self.status = Some(format!("Connection lost: {}", reason));
            }
        }
    }

    fn send_command(&mut self, command: ConnectionCommand) {
        if self.command_sender.send(command).is_err() {
            log::error!("Connection thread is not running");
            self.set_status("Connection thread is not running".to_string());
        }
    }

    fn set_status(&mut self, status: String) {
        self.status = Some(status);
        self.dirty = true;
    }

    /// True once after anything visible changed
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn view(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Sensor: {}", self.connection_state);

        if !self.available_devices.is_empty() {
            let _ = writeln!(out, "Devices:");
            for (index, device) in self.available_devices.iter().enumerate() {
                let _ = write!(
                    out,
                    "  [{}] {} ({})",
                    index + 1,
                    device.display_name().unwrap_or("(unnamed)"),
                    device.id
                );
                if let Some(rssi) = device.rssi {
                    let _ = write!(out, " {} dBm", rssi);
                }
                out.push('\n');
            }
        }

        if !self.live_samples.is_empty() {
            let last = self.live_samples.last().copied().unwrap_or_default();
            let _ = writeln!(out, "EMG: {} {}", sparkline(&self.live_samples), last);
        }

        match &self.health_snapshot {
            Some(snapshot) => {
                let _ = write!(out, "Health at {}", snapshot.captured_at.format("%H:%M:%S"));
                if let Some(name) = &snapshot.source_device_name {
                    let _ = write!(out, " from {}", name);
                }
                out.push('\n');
                for (label, value, kind) in [
                    ("Heart rate", snapshot.heart_rate, MetricKind::HeartRate),
                    ("Steps", snapshot.steps, MetricKind::Steps),
                    ("Active energy", snapshot.active_energy, MetricKind::ActiveEnergy),
                    ("Exercise", snapshot.exercise_minutes, MetricKind::ExerciseTime),
                ] {
                    let _ = writeln!(out, "  {:<14}{}", label, format_metric(value, kind));
                }
            }
            None => {
                let _ = writeln!(out, "Health: no data");
            }
        }

        if let Some(status) = &self.status {
            let _ = writeln!(out, "Status: {}", status);
        }
        out
    }
}

/// Render a metric value, or an explicit "no data" when it is missing
pub fn format_metric(value: Option<f64>, kind: MetricKind) -> String {
    match value {
        Some(value) => format!("{:.0} {}", value, kind.unit()),
        None => "no data".to_string(),
    }
}

/// One character per sample, scaled against the window's display maximum
pub fn sparkline(values: &[u8]) -> String {
    let max = display_max(values) as usize;
    let top = SPARK_LEVELS.len() - 1;
    values
        .iter()
        .map(|&v| SPARK_LEVELS[(v as usize * top / max).min(top)])
        .collect()
}

/// Parse one line of terminal input
///
/// `connect` takes either a 1-based index into the listed devices or a raw
/// device id.
pub fn parse_command(line: &str, devices: &[PeripheralDescriptor]) -> Option<Message> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_lowercase();
    let argument = words.next();

    match (command.as_str(), argument) {
        ("scan", _) => Some(Message::ScanDevices),
        ("stop", _) => Some(Message::StopScan),
        ("connect", Some(target)) => {
            let id = target
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|index| devices.get(index))
                .map(|d| d.id.clone())
                .unwrap_or_else(|| target.to_string());
            Some(Message::ConnectDevice(id))
        }
        ("disconnect", _) => Some(Message::DisconnectDevice),
        ("permissions", _) => Some(Message::RequestPermissions),
        ("auth", _) => Some(Message::RequestHealthAuthorization),
        ("health" | "refresh", _) => Some(Message::RefreshHealth),
        ("record", _) => Some(Message::RecordActivity),
        ("periodic", Some("on")) => Some(Message::PeriodicHealth(true)),
        ("periodic", Some("off")) => Some(Message::PeriodicHealth(false)),
        ("quit" | "exit", _) => Some(Message::Quit),
        _ => None,
    }
}
