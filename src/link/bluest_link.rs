use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::{Stream, StreamExt};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    Advertisement, DisconnectedCallback, LinkClient, NotificationCallback, Transport, UNAVAILABLE_AFTER,
};
use crate::error::{Error, Result};

/// A [`Transport`] backed by the default Bluetooth adapter.
///
/// Only devices seen by [`BluestTransport::advertisements`] recently can be connected.
pub struct BluestTransport {
    adapter: Adapter,
    devices: Mutex<SeenDevices<Device>>,
}

/// Devices by address, with the time each was last heard from.
///
/// Entries older than `max_age` are ignored and pruned on the next insert.
struct SeenDevices<D> {
    max_age: Duration,
    entries: HashMap<String, (D, Instant)>,
}

impl<D: Clone> SeenDevices<D> {
    fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, address: String, device: D) {
        let now = Instant::now();
        let max_age = self.max_age;
        self.entries
            .retain(|_, (_, seen)| now.duration_since(*seen) <= max_age);
        self.entries.insert(address, (device, now));
    }

    fn get(&self, address: &str) -> Option<D> {
        self.entries
            .get(address)
            .filter(|(_, seen)| seen.elapsed() <= self.max_age)
            .map(|(device, _)| device.clone())
    }

    fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl BluestTransport {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::Transport("Default adapter not found".into()))?;
        adapter.wait_available().await?;

        Ok(Self {
            adapter,
            devices: Mutex::new(SeenDevices::new(UNAVAILABLE_AFTER)),
        })
    }

    /// Scan for advertisements from any device.
    ///
    /// Every advertising device is remembered so that [`Transport::connect`] can
    /// find it by address afterwards, until it has been silent for five minutes.
    pub async fn advertisements(&self) -> Result<impl Stream<Item = Advertisement> + Send + Unpin + '_> {
        let events = self.adapter.scan(&[]).await?;
        Ok(events.map(move |device| self.remember(device)))
    }

    fn remember(&self, advertising: AdvertisingDevice) -> Advertisement {
        let address = advertising.device.id().to_string();
        let mut devices = self.devices.lock();
        devices.insert(address.clone(), advertising.device.clone());
        trace!("Seen {address}, {} devices known", devices.len());
        drop(devices);

        let manufacturer_data = advertising
            .adv_data
            .manufacturer_data
            .iter()
            .map(|m| (m.company_id, m.data.to_vec()))
            .collect();

        Advertisement {
            address,
            local_name: advertising.adv_data.local_name,
            rssi: advertising.rssi,
            manufacturer_data,
        }
    }
}

#[async_trait]
impl Transport for BluestTransport {
    fn is_connectable(&self, address: &str) -> bool {
        self.devices.lock().contains(address)
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectedCallback,
    ) -> Result<Box<dyn LinkClient>> {
        let device = self
            .devices
            .lock()
            .get(address)
            .ok_or_else(|| Error::DeviceUnreachable(address.to_string()))?;

        if !device.is_connected().await {
            self.adapter.connect_device(&device).await?;
        }

        let watcher = tokio::spawn(watch_disconnect(
            self.adapter.clone(),
            device.clone(),
            on_disconnect,
        ));

        Ok(Box::new(BluestClient {
            adapter: self.adapter.clone(),
            device,
            characteristics: Mutex::new(HashMap::new()),
            tasks: Mutex::new(vec![watcher]),
        }))
    }
}

async fn watch_disconnect(adapter: Adapter, device: Device, on_disconnect: DisconnectedCallback) {
    let mut events = match adapter.device_connection_events(&device).await {
        Ok(events) => events,
        Err(err) => {
            warn!("Unable to watch connection state of {}: {err}", device.id());
            return;
        }
    };
    while let Some(event) = events.next().await {
        if matches!(event, bluest::ConnectionEvent::Disconnected) {
            on_disconnect();
            return;
        }
    }
}

struct BluestClient {
    adapter: Adapter,
    device: Device,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BluestClient {
    fn characteristic(&self, uuid: Uuid, role: &'static str) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .get(&uuid)
            .cloned()
            .ok_or(Error::CharacteristicMissing(role))
    }
}

#[async_trait]
impl LinkClient for BluestClient {
    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn characteristics(&self, refresh: bool) -> Result<Vec<Uuid>> {
        let services = if refresh {
            self.device.discover_services().await?
        } else {
            self.device.services().await?
        };

        let mut found = HashMap::new();
        for service in services {
            let characteristics = if refresh {
                service.discover_characteristics().await?
            } else {
                service.characteristics().await?
            };
            for characteristic in characteristics {
                found.insert(characteristic.uuid(), characteristic);
            }
        }

        let uuids = found.keys().copied().collect();
        *self.characteristics.lock() = found;
        Ok(uuids)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(characteristic, "Write")?;
        characteristic.write(data).await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid, on_notify: NotificationCallback) -> Result<()> {
        let characteristic = self.characteristic(characteristic, "Read")?;
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut reader = match characteristic.notify().await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Some(notification) = reader.next().await {
                match notification {
                    Ok(data) => on_notify(data),
                    Err(err) => {
                        warn!("Notification error: {err}");
                        break;
                    }
                }
            }
            debug!("End of notification stream");
        });
        self.tasks.lock().push(task);

        ready_rx
            .await
            .map_err(|_| Error::Transport("notification task ended".into()))??;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.adapter.disconnect_device(&self.device).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        result?;
        Ok(())
    }
}

impl Drop for BluestClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_silent_devices_are_not_connectable() {
        let mut devices = SeenDevices::new(Duration::from_secs(300));
        devices.insert("C8:C9:A3:11:22:33".to_string(), 1);
        assert!(devices.contains("C8:C9:A3:11:22:33"));

        sleep(Duration::from_secs(301)).await;
        assert!(!devices.contains("C8:C9:A3:11:22:33"));
        assert_eq!(devices.get("C8:C9:A3:11:22:33"), None);

        devices.insert("C8:C9:A3:11:22:33".to_string(), 2);
        assert_eq!(devices.get("C8:C9:A3:11:22:33"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotating_addresses_are_pruned() {
        let mut devices = SeenDevices::new(Duration::from_secs(300));
        for i in 0..50 {
            devices.insert(format!("random-{i}"), i);
        }
        assert_eq!(devices.len(), 50);

        sleep(Duration::from_secs(301)).await;
        devices.insert("C8:C9:A3:11:22:33".to_string(), 0);
        assert_eq!(devices.len(), 1);
    }
}
