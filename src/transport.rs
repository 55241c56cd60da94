//! Wireless transport abstraction
//!
//! The device manager talks to the radio only through [`Transport`], so each
//! session owns an explicitly constructed transport and tests can run against
//! a scripted one. Streams handed out here end when the underlying scan or
//! link ends; dropping a stream cancels it.

use crate::device_scanner::PeripheralDescriptor;
use crate::error::TransportError;
use crate::gatt::GattService;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

/// Stream of peripherals seen while a scan is running
pub type DiscoveryStream = BoxStream<'static, PeripheralDescriptor>;

/// Stream of raw characteristic values
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the platform for scan/connect permissions
    async fn request_permissions(&self) -> Result<bool, TransportError>;

    /// Begin passive discovery
    async fn start_scan(&self) -> Result<DiscoveryStream, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open the link to a peripheral
    async fn connect(&self, device_id: &str) -> Result<(), TransportError>;

    /// Enumerate services and characteristics of a connected peripheral
    async fn discover(&self, device_id: &str) -> Result<Vec<GattService>, TransportError>;

    /// Subscribe to change notifications of one characteristic
    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Close the link; closing an already closed link is not an error
    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError>;
}
