//! # Connection Management Module
//!
//! Runs the BLE device manager on a dedicated thread with its own Tokio
//! runtime and turns UI commands into device-manager operations.
//!
//! ## Key Components
//! - `ConnectionManager`: command loop owning the `DeviceManager`
//! - `ConnectionCommand`: commands sent from the UI to the connection thread
//! - `SensorUpdate`: state, peripherals and samples sent back to the UI
//!
//! ## Ordering
//! Commands are handled one at a time and each operation runs to completion
//! before the next command is read, so concurrent connect requests are
//! serialized: a later `Connect` tears down the earlier peripheral (last caller
//! wins). Between commands the loop pumps device-manager events.

use crate::device_scanner::PeripheralDescriptor;
use crate::error::{ConnectionError, ScanError};
use crate::sensor::{ConnectResult, ConnectionState, DeviceManager, DeviceSettings, ManagerEvent};
use crate::transport::Transport;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    RequestPermissions,
    StartScan(Duration),
    StopScan,
    /// Connect to a peripheral by id, preferably one from the last scan
    Connect(String),
    Disconnect,
    /// Tear everything down and end the loop
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SensorUpdate {
    ConnectionStatus(ConnectionState),
    Permissions(bool),
    PeripheralFound(PeripheralDescriptor),
    /// Ordered peripherals at the end of a scan
    ScanCompleted(Result<Vec<PeripheralDescriptor>, ScanError>),
    Connected(ConnectResult),
    /// Current contents of the sample window, oldest first
    Samples(Vec<u8>),
    ConnectionLost(String),
}

/// Manages the connection lifecycle of the EMG sensor.
///
/// Runs in a dedicated thread with its own Tokio runtime so transport calls
/// never block the UI thread.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: DeviceSettings,
    priority_id: Option<String>,
    command_receiver: mpsc::UnboundedReceiver<ConnectionCommand>,
    sensor_sender: Sender<SensorUpdate>,
}

impl ConnectionManager {
    /// Creates a new ConnectionManager.
    ///
    /// Returns the manager and a sender for issuing commands from the UI thread.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: DeviceSettings,
        priority_id: Option<String>,
        sensor_sender: Sender<SensorUpdate>,
    ) -> (Self, mpsc::UnboundedSender<ConnectionCommand>) {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();

        let manager = ConnectionManager {
            transport,
            settings,
            priority_id,
            command_receiver,
            sensor_sender,
        };

        (manager, command_sender)
    }

    /// Runs the connection management loop.
    ///
    /// This should be called in a spawned thread. It returns once a `Shutdown`
    /// command arrives or the command channel is closed.
    pub fn run(self) {
        let rt = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                let error = ConnectionError::RuntimeCreation(e.to_string());
                log::error!("{}", error);
                let _ = self
                    .sensor_sender
                    .send(SensorUpdate::ConnectionStatus(ConnectionState::Failed(error.to_string())));
                return;
            }
        };

        rt.block_on(self.serve());
    }

    /// Command/event loop; usable directly from an existing runtime.
    pub async fn serve(mut self) {
        let mut device = DeviceManager::new(self.transport.clone(), self.settings.clone());
        let mut last_state = device.state().clone();

        loop {
            tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(ConnectionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(&mut device, command).await,
                },
                event = device.next_event() => self.handle_event(&device, event),
            }
            self.publish_state(&device, &mut last_state);
        }

        log::info!("Connection manager: shutting down");
        device.shutdown().await;
        self.send(SensorUpdate::ConnectionStatus(ConnectionState::Disconnected));
    }

    async fn handle_command(&self, device: &mut DeviceManager, command: ConnectionCommand) {
        match command {
            ConnectionCommand::RequestPermissions => {
                let granted = device.request_permissions().await;
                self.send(SensorUpdate::Permissions(granted));
            }
            ConnectionCommand::StartScan(timeout) => {
                log::info!("Connection manager: scan requested ({:?})", timeout);
                if let Err(e) = device.start_scan(timeout).await {
                    log::error!("{}", e);
                    self.send(SensorUpdate::ScanCompleted(Err(e)));
                }
            }
            ConnectionCommand::StopScan => {
                device.stop_scan().await;
                self.send(SensorUpdate::ScanCompleted(Ok(
                    device.scanned_peripherals(self.priority_id.as_deref())
                )));
            }
            ConnectionCommand::Connect(device_id) => {
                log::info!("Connection manager: Connecting to device: {}", device_id);
                let descriptor = device
                    .find_peripheral(&device_id)
                    .unwrap_or_else(|| PeripheralDescriptor::new(device_id, None, None));
                self.send(SensorUpdate::ConnectionStatus(ConnectionState::Connecting(
                    descriptor.clone(),
                )));
                let result = device.connect(descriptor).await;
                self.send(SensorUpdate::Connected(result));
            }
            ConnectionCommand::Disconnect => {
                log::info!("Connection manager: Disconnect requested");
                device.disconnect().await;
            }
            ConnectionCommand::Shutdown => {}
        }
    }

    fn handle_event(&self, device: &DeviceManager, event: ManagerEvent) {
        match event {
            ManagerEvent::Discovered(descriptor) => {
                self.send(SensorUpdate::PeripheralFound(descriptor));
            }
            ManagerEvent::ScanFinished { found } => {
                let outcome = if found == 0 {
                    Err(ScanError::NoPeripheralsFound)
                } else {
                    Ok(device.scanned_peripherals(self.priority_id.as_deref()))
                };
                self.send(SensorUpdate::ScanCompleted(outcome));
            }
            ManagerEvent::Sample(_) => {
                self.send(SensorUpdate::Samples(device.live_samples()));
            }
            ManagerEvent::ConnectionLost { reason, .. } => {
                self.send(SensorUpdate::ConnectionLost(reason));
            }
        }
    }

    fn publish_state(&self, device: &DeviceManager, last_state: &mut ConnectionState) {
        if device.state() != last_state {
            *last_state = device.state().clone();
            self.send(SensorUpdate::ConnectionStatus(last_state.clone()));
        }
    }

    fn send(&self, update: SensorUpdate) {
        if self.sensor_sender.send(update).is_err() {
            log::debug!("Connection manager: update receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{GattCharacteristic, GattService, UUID_SENSOR_CHARACTERISTIC, UUID_SENSOR_SERVICE};
    use crate::transport::mock::MockTransport;
    use crossbeam_channel::Receiver;
    use std::thread::JoinHandle;

    struct Harness {
        transport: Arc<MockTransport>,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
        updates: Receiver<SensorUpdate>,
        thread: JoinHandle<()>,
    }

    fn spawn_manager(transport: Arc<MockTransport>) -> Harness {
        let (sender, updates) = crossbeam_channel::unbounded();
        let (manager, commands) =
            ConnectionManager::new(transport.clone(), DeviceSettings::default(), None, sender);
        let thread = std::thread::spawn(move || manager.run());
        Harness {
            transport,
            commands,
            updates,
            thread,
        }
    }

    fn wait_for<T>(updates: &Receiver<SensorUpdate>, mut pick: impl FnMut(SensorUpdate) -> Option<T>) -> T {
        loop {
            let update = updates
                .recv_timeout(Duration::from_secs(5))
                .expect("timed out waiting for update");
            if let Some(found) = pick(update) {
                return found;
            }
        }
    }

    fn sensor_services() -> Vec<GattService> {
        vec![GattService {
            uuid: UUID_SENSOR_SERVICE,
            characteristics: vec![GattCharacteristic {
                uuid: UUID_SENSOR_CHARACTERISTIC,
                notifiable: true,
            }],
        }]
    }

    #[test]
    fn test_connection_manager_creation() {
        let (sensor_sender, _sensor_receiver) = crossbeam_channel::unbounded();
        let (_manager, command_sender) = ConnectionManager::new(
            Arc::new(MockTransport::new()),
            DeviceSettings::default(),
            None,
            sensor_sender,
        );

        // Verify we can send commands
        assert!(command_sender.send(ConnectionCommand::Disconnect).is_ok());
    }

    #[test]
    fn test_scan_connect_stream_shutdown() {
        let transport = Arc::new(MockTransport::new());
        transport.advertise(PeripheralDescriptor::new("S1", Some("EMG Sensor".to_string()), Some(-50)));
        transport.set_services("S1", sensor_services());
        let harness = spawn_manager(transport);

        harness
            .commands
            .send(ConnectionCommand::StartScan(Duration::from_millis(50)))
            .expect("send");
        let found = wait_for(&harness.updates, |u| match u {
            SensorUpdate::ScanCompleted(result) => Some(result),
            _ => None,
        })
        .expect("scan result");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "S1");

        harness
            .commands
            .send(ConnectionCommand::Connect("S1".to_string()))
            .expect("send");
        let result = wait_for(&harness.updates, |u| match u {
            SensorUpdate::Connected(result) => Some(result),
            _ => None,
        });
        assert!(result.success);
        assert_eq!(result.device_name.as_deref(), Some("EMG Sensor"));

        assert!(harness.transport.notify("S1", &[77]));
        let samples = wait_for(&harness.updates, |u| match u {
            SensorUpdate::Samples(samples) => Some(samples),
            _ => None,
        });
        assert_eq!(samples, vec![77]);

        harness.commands.send(ConnectionCommand::Shutdown).expect("send");
        harness.thread.join().expect("connection thread");
        assert!(harness.transport.calls().contains(&"disconnect:S1".to_string()));
    }

    #[test]
    fn test_empty_scan_reports_no_peripherals() {
        let harness = spawn_manager(Arc::new(MockTransport::new()));
        harness
            .commands
            .send(ConnectionCommand::StartScan(Duration::from_millis(20)))
            .expect("send");
        let outcome = wait_for(&harness.updates, |u| match u {
            SensorUpdate::ScanCompleted(result) => Some(result),
            _ => None,
        });
        assert_eq!(outcome, Err(ScanError::NoPeripheralsFound));
        drop(harness.commands);
        harness.thread.join().expect("connection thread");
    }

    #[test]
    fn test_connection_loss_is_reported() {
        let transport = Arc::new(MockTransport::new());
        transport.set_services("S1", sensor_services());
        let harness = spawn_manager(transport);

        harness
            .commands
            .send(ConnectionCommand::Connect("S1".to_string()))
            .expect("send");
        wait_for(&harness.updates, |u| match u {
            SensorUpdate::Connected(result) => Some(result),
            _ => None,
        });

        harness.transport.drop_link("S1");
        wait_for(&harness.updates, |u| match u {
            SensorUpdate::ConnectionLost(reason) => Some(reason),
            _ => None,
        });
        let state = wait_for(&harness.updates, |u| match u {
            SensorUpdate::ConnectionStatus(state) => Some(state),
            _ => None,
        });
        assert!(matches!(state, ConnectionState::Failed(_)));

        harness.commands.send(ConnectionCommand::Shutdown).expect("send");
        harness.thread.join().expect("connection thread");
    }
}
