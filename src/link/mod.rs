//! The boundary between the session logic and the radio.
//!
//! A [`Transport`] finds devices and opens connections to them, a [`LinkClient`] is one
//! open connection. [`BluestTransport`] implements both on top of `bluest`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;

use crate::error::Result;

mod bluest_link;
#[cfg(test)]
pub(crate) mod mock;

pub use bluest_link::BluestTransport;

/// Without an advertisement for this long a device is considered unavailable
pub(crate) const UNAVAILABLE_AFTER: Duration = Duration::from_secs(300);

/// Invoked by the link when the device drops the connection
pub type DisconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked by the link with the value of every notification received
pub type NotificationCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// One advertisement as delivered by the discovery layer
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// The address (or platform id) of the advertising device
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether a connectable device with this address is currently known
    fn is_connectable(&self, address: &str) -> bool;

    /// Open a connection to the device at `address`.
    ///
    /// Fails with [`crate::Error::DeviceUnreachable`] when the address is not known.
    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectedCallback,
    ) -> Result<Box<dyn LinkClient>>;
}

#[async_trait]
pub trait LinkClient: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// The characteristics of all services. With `refresh` the service cache is
    /// bypassed and the services are discovered again.
    async fn characteristics(&self, refresh: bool) -> Result<Vec<Uuid>>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Start delivering notifications of `characteristic` to `on_notify`
    async fn subscribe(&self, characteristic: Uuid, on_notify: NotificationCallback) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
