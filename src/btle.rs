//! # btleplug Transport
//!
//! [`Transport`] implementation on top of the platform Bluetooth stack.
//!
//! The adapter is acquired on first use, so the transport can be built
//! synchronously at startup and a missing adapter only surfaces when a scan or
//! connect is attempted. Peripherals are addressed by the platform peripheral
//! id (CoreBluetooth hides addresses) and looked up from the adapter on every
//! call.
//!
//! A notification stream ends when the adapter reports the peripheral as
//! disconnected, since the stream itself may stay open after the link drops.

use crate::device_scanner::PeripheralDescriptor;
use crate::error::TransportError;
use crate::gatt::{GattCharacteristic, GattService};
use crate::transport::{DiscoveryStream, NotificationStream, Transport};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::fmt;
use tokio::sync::OnceCell;
use uuid::Uuid;

#[derive(Default)]
pub struct BtleTransport {
    adapter: OnceCell<Adapter>,
}

impl BtleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await.map_err(|e| {
                    log::error!("Failed to create BLE manager: {}", e);
                    TransportError::NoAdapter
                })?;
                let adapters = manager.adapters().await.map_err(|e| {
                    log::error!("Failed to get adapters: {}", e);
                    TransportError::NoAdapter
                })?;
                adapters.into_iter().next().ok_or(TransportError::NoAdapter)
            })
            .await
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self
            .adapter()
            .await?
            .peripherals()
            .await
            .map_err(scan_error)?;

        peripherals
            .into_iter()
            .find(|p| peripheral_key(p) == device_id)
            .ok_or_else(|| TransportError::UnknownPeripheral(device_id.to_string()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                TransportError::Subscribe(format!("characteristic {} not found", characteristic))
            })
    }
}

// CoreBluetooth reports zeroed addresses, so the platform id is the only unique key
fn peripheral_key(peripheral: &Peripheral) -> String {
    peripheral.id().to_string()
}

async fn describe(peripheral: &Peripheral) -> PeripheralDescriptor {
    let id = peripheral_key(peripheral);
    match peripheral.properties().await {
        Ok(Some(props)) => PeripheralDescriptor::new(id, props.local_name, props.rssi),
        _ => PeripheralDescriptor::new(id, None, None),
    }
}

/// End `values` once `disconnects` reports `peripheral`
fn until_link_drop<I>(
    values: NotificationStream,
    disconnects: impl Stream<Item = I> + Send + 'static,
    peripheral: I,
) -> NotificationStream
where
    I: PartialEq + fmt::Debug + Send + 'static,
{
    let link_dropped = async move {
        futures::pin_mut!(disconnects);
        while let Some(id) = disconnects.next().await {
            if id == peripheral {
                log::info!("Adapter reported {:?} disconnected", id);
                break;
            }
        }
    };
    values.take_until(link_dropped).boxed()
}

fn scan_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
        other => TransportError::Scan(other.to_string()),
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn request_permissions(&self) -> Result<bool, TransportError> {
        // Desktop stacks prompt on first adapter use; a missing adapter is a denial
        match self.adapter().await {
            Ok(_) => Ok(true),
            Err(TransportError::NoAdapter) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start_scan(&self) -> Result<DiscoveryStream, TransportError> {
        let adapter = self.adapter().await?.clone();
        let events = adapter
            .events()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)?;
        log::info!("BLE scan started");

        let discoveries = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                Some(describe(&peripheral).await)
            }
        });
        Ok(discoveries.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter()
            .await?
            .stop_scan()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))
    }

    async fn connect(&self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        peripheral.connect().await.map_err(|e| TransportError::Connect {
            device_id: device_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn discover(&self, device_id: &str) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        notifiable: c
                            .properties
                            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        log::debug!("{}: discovered {} services", device_id, services.len());
        Ok(services)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        let disconnects = self
            .adapter()
            .await?
            .events()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?
            .filter_map(|event| {
                futures::future::ready(match event {
                    CentralEvent::DeviceDisconnected(id) => Some(id),
                    _ => None,
                })
            });

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let values = notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| n.value)
            .boxed();
        Ok(until_link_drop(values, disconnects, peripheral.id()))
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = match self.peripheral(device_id).await {
            Ok(peripheral) => peripheral,
            Err(TransportError::UnknownPeripheral(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}
