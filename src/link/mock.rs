//! A scriptable in-memory [`Transport`] for session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;
use parking_lot::Mutex;

use super::{DisconnectedCallback, LinkClient, NotificationCallback, Transport};
use crate::error::{Error, Result};
use crate::protocol::{POSSIBLE_READ_CHARACTERISTIC_UUIDS, POSSIBLE_WRITE_CHARACTERISTIC_UUIDS};

pub(crate) struct MockDevice {
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub characteristic_fetches: AtomicU32,
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub subscribed: Mutex<Option<Uuid>>,
    pub reachable: AtomicBool,
    /// Answer every write with a notification
    pub respond: AtomicBool,
    pub connect_delay: Mutex<Duration>,
    pub connect_errors: Mutex<VecDeque<Error>>,
    pub write_errors: Mutex<VecDeque<Error>>,
    /// Characteristics reported from the service cache
    pub cached: Mutex<Vec<Uuid>>,
    /// Characteristics reported after a forced rediscovery
    pub discovered: Mutex<Vec<Uuid>>,
    connected: AtomicBool,
    on_disconnect: Mutex<Option<DisconnectedCallback>>,
    on_notify: Mutex<Option<NotificationCallback>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        let all = vec![
            POSSIBLE_READ_CHARACTERISTIC_UUIDS[1],
            POSSIBLE_WRITE_CHARACTERISTIC_UUIDS[1],
        ];
        Arc::new(Self {
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            characteristic_fetches: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
            subscribed: Mutex::new(None),
            reachable: AtomicBool::new(true),
            respond: AtomicBool::new(true),
            connect_delay: Mutex::new(Duration::from_millis(100)),
            connect_errors: Mutex::new(VecDeque::new()),
            write_errors: Mutex::new(VecDeque::new()),
            cached: Mutex::new(all.clone()),
            discovered: Mutex::new(all),
            connected: AtomicBool::new(false),
            on_disconnect: Mutex::new(None),
            on_notify: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the link from the device side
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let callback = self.on_disconnect.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Deliver a notification as if the device had sent it
    pub fn notify(&self, data: Vec<u8>) {
        let callback = self.on_notify.lock().clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }
}

pub(crate) struct MockTransport {
    pub address: String,
    pub device: Arc<MockDevice>,
}

impl MockTransport {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            device: MockDevice::new(),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_connectable(&self, address: &str) -> bool {
        address == self.address && self.device.reachable.load(Ordering::SeqCst)
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectedCallback,
    ) -> Result<Box<dyn LinkClient>> {
        let device = &self.device;
        device.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *device.connect_delay.lock();
        tokio::time::sleep(delay).await;

        if !self.is_connectable(address) {
            return Err(Error::DeviceUnreachable(address.to_string()));
        }
        let scripted = device.connect_errors.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        device.connected.store(true, Ordering::SeqCst);
        *device.on_disconnect.lock() = Some(on_disconnect);
        Ok(Box::new(MockClient {
            device: device.clone(),
        }))
    }
}

struct MockClient {
    device: Arc<MockDevice>,
}

#[async_trait]
impl LinkClient for MockClient {
    async fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    async fn characteristics(&self, refresh: bool) -> Result<Vec<Uuid>> {
        self.device.characteristic_fetches.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if refresh {
            Ok(self.device.discovered.lock().clone())
        } else {
            Ok(self.device.cached.lock().clone())
        }
    }

    async fn write(&self, _characteristic: Uuid, data: &[u8]) -> Result<()> {
        tokio::task::yield_now().await;
        let scripted = self.device.write_errors.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.device.writes.lock().push(data.to_vec());

        if self.device.respond.load(Ordering::SeqCst) {
            let mut response = vec![0xaa];
            response.extend_from_slice(data);
            self.device.notify(response);
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid, on_notify: NotificationCallback) -> Result<()> {
        *self.device.subscribed.lock() = Some(characteristic);
        *self.device.on_notify.lock() = Some(on_notify);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnects.fetch_add(1, Ordering::SeqCst);
        self.device.drop_link();
        Ok(())
    }
}
