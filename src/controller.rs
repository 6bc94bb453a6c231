use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bluest::Uuid;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ControllerConfig;
use crate::device_info::{CallbackType, DeviceInfo};
use crate::error::{DecodeError, Error, Result};
use crate::link::{Advertisement, DisconnectedCallback, LinkClient, NotificationCallback, Transport};
use crate::protocol::{
    parse_manufacturer_data, MANUFACTURER_ID, POSSIBLE_READ_CHARACTERISTIC_UUIDS,
    POSSIBLE_WRITE_CHARACTERISTIC_UUIDS,
};
use crate::retry::RetryPolicy;

type Callback = Arc<dyn Fn(&DeviceInfo, CallbackType) + Send + Sync>;

/// An open connection with its resolved characteristics
struct Connection {
    client: Arc<dyn LinkClient>,
    read_char: Uuid,
    write_char: Uuid,
}

/// Tracks one EcoFlow power station: merges its advertisements into a [`DeviceInfo`]
/// and manages the connection used to poll it.
///
/// Connections are short lived. [`EcoflowController::update`] connects and
/// disconnects straight away, and any connection left open by
/// [`EcoflowController::send_command`] is closed after
/// [`ControllerConfig::disconnect_delay`] without activity.
pub struct EcoflowController {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    address: RwLock<String>,
    rssi: Mutex<Option<i16>>,
    state: Mutex<DeviceInfo>,
    // Serialises merge + callback fan-out
    update_lock: Mutex<()>,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_callback_id: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    operation_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Connection>>,
    pending_response: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    disconnect_timer: Mutex<Option<JoinHandle<()>>>,
    expected_disconnect: AtomicBool,
}

impl EcoflowController {
    /// Create a controller from a previously stored record
    pub fn from_state(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        state: DeviceInfo,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            address: RwLock::new(address.into()),
            rssi: Mutex::new(None),
            state: Mutex::new(state),
            update_lock: Mutex::new(()),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            operation_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            pending_response: Mutex::new(None),
            disconnect_timer: Mutex::new(None),
            expected_disconnect: AtomicBool::new(false),
        })
    }

    /// Create a controller from the first advertisement seen from the device
    pub fn from_advertisement(
        transport: Arc<dyn Transport>,
        advertisement: &Advertisement,
        config: ControllerConfig,
    ) -> Result<Arc<Self>> {
        let payload = advertisement
            .manufacturer_data
            .get(&MANUFACTURER_ID)
            .ok_or(DecodeError::NoManufacturerData)?;
        let state = parse_manufacturer_data(payload)?;
        let controller = Self::from_state(transport, advertisement.address.clone(), state, config);
        *controller.rssi.lock() = advertisement.rssi;
        Ok(controller)
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn serial(&self) -> String {
        self.state.lock().serial.clone()
    }

    pub fn model(&self) -> String {
        self.state.lock().model().to_string()
    }

    /// The state of charge in %, if known
    pub fn battery(&self) -> Option<u8> {
        self.state.lock().battery
    }

    /// Signal strength of the latest advertisement
    pub fn rssi(&self) -> Option<i16> {
        *self.rssi.lock()
    }

    pub fn state(&self) -> DeviceInfo {
        self.state.lock().clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Whether the transport currently knows a connectable device at our address
    pub fn is_connectable(&self) -> bool {
        self.transport.is_connectable(&self.address())
    }

    pub async fn is_connected(&self) -> bool {
        let client = self.connection.lock().as_ref().map(|c| c.client.clone());
        match client {
            Some(client) => client.is_connected().await,
            None => false,
        }
    }

    /// Take in a new advertisement: refresh the address and signal strength and
    /// merge the EcoFlow manufacturer data into the current state.
    pub fn set_advertisement(&self, advertisement: &Advertisement) -> std::result::Result<(), DecodeError> {
        *self.address.write() = advertisement.address.clone();
        let payload = advertisement
            .manufacturer_data
            .get(&MANUFACTURER_ID)
            .ok_or(DecodeError::NoManufacturerData)?;
        self.on_advertisement(payload, advertisement.rssi)
    }

    /// Decode `payload` and merge it into the current state.
    ///
    /// Nothing changes when the payload cannot be decoded.
    pub fn on_advertisement(&self, payload: &[u8], rssi: Option<i16>) -> std::result::Result<(), DecodeError> {
        if rssi.is_some() {
            *self.rssi.lock() = rssi;
        }
        let info = parse_manufacturer_data(payload)?;
        self.apply_update(&info, CallbackType::Advertisement);
        Ok(())
    }

    /// Register a callback to be called when the state changes.
    ///
    /// Callbacks run in registration order. The returned closure unregisters it.
    ///
    /// Callbacks are called with the update lock held and must not feed advertisements
    /// back into the same controller, which would deadlock.
    pub fn register_callback(
        self: &Arc<Self>,
        callback: impl Fn(&DeviceInfo, CallbackType) + Send + Sync + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push((id, Arc::new(callback)));

        let controller = Arc::downgrade(self);
        move || {
            if let Some(controller) = controller.upgrade() {
                controller.callbacks.lock().retain(|(other, _)| *other != id);
            }
        }
    }

    fn apply_update(&self, patch: &DeviceInfo, change: CallbackType) {
        let _serial = self.update_lock.lock();
        let state = {
            let mut state = self.state.lock();
            *state = state.merge(patch);
            state.clone()
        };
        self.fire_callbacks(&state, change);
    }

    fn fire_callbacks(&self, state: &DeviceInfo, change: CallbackType) {
        let callbacks: Vec<Callback> = self.callbacks.lock().iter().map(|(_, c)| c.clone()).collect();
        for callback in callbacks {
            callback(state, change);
        }
    }

    /// Poll the device: connect, then release the connection straight away
    pub async fn update(self: &Arc<Self>) -> Result<()> {
        self.ensure_connected().await?;
        debug!("{}: Updating", self.name());
        self.apply_update(&DeviceInfo::default(), CallbackType::Poll);
        self.execute_disconnect().await;
        Ok(())
    }

    /// Disconnect, if connected
    pub async fn stop(&self) {
        debug!("{}: Stop", self.name());
        self.execute_disconnect().await;
    }

    /// Send `command` to the device and return the notification it answers with.
    ///
    /// Transient link errors disconnect, then the command is tried again up to
    /// [`ControllerConfig::command_attempts`] times. Connecting uses the separate
    /// [`ControllerConfig::connect_attempts`] budget once; reconnects between command
    /// attempts get a single try each.
    pub async fn send_command(self: &Arc<Self>, command: &[u8]) -> Result<Vec<u8>> {
        self.ensure_connected().await?;

        let reconnect = RetryPolicy::new(1, Duration::ZERO);
        self.config
            .command_retry()
            .run(Error::is_transient, move || async move {
                self.connect_with(reconnect).await?;
                self.send_command_while_connected(command).await
            })
            .await
    }

    /// Connect unless already connected. Concurrent callers share one attempt.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        self.connect_with(self.config.connect_retry()).await
    }

    async fn connect_with(self: &Arc<Self>, retry: RetryPolicy) -> Result<()> {
        if self.connect_lock.try_lock().is_err() {
            debug!(
                "{}: Connection already in progress, waiting; RSSI: {:?}",
                self.name(),
                self.rssi()
            );
        }
        if self.is_connected().await {
            self.reset_disconnect_timer();
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        // Check again while holding the lock
        if self.is_connected().await {
            self.reset_disconnect_timer();
            return Ok(());
        }

        debug!("{}: Connecting; RSSI: {:?}", self.name(), self.rssi());
        let client: Arc<dyn LinkClient> = Arc::from(self.establish_connection(retry).await?);
        debug!("{}: Connected; RSSI: {:?}", self.name(), self.rssi());

        let connection = match self.prepare_connection(client.clone()).await {
            Ok(connection) => connection,
            Err(err) => {
                self.expected_disconnect.store(true, Ordering::SeqCst);
                if let Err(disconnect_err) = client.disconnect().await {
                    debug!("{}: Failed to disconnect: {disconnect_err}", self.name());
                }
                return Err(err);
            }
        };

        *self.connection.lock() = Some(connection);
        self.reset_disconnect_timer();
        Ok(())
    }

    async fn establish_connection(self: &Arc<Self>, retry: RetryPolicy) -> Result<Box<dyn LinkClient>> {
        let address = self.address();
        let controller = Arc::downgrade(self);
        let on_disconnect: DisconnectedCallback = Arc::new(move || {
            if let Some(controller) = controller.upgrade() {
                controller.handle_disconnected();
            }
        });

        let transport = &self.transport;
        retry
            .run(Error::is_transient, move || {
                let address = address.clone();
                let on_disconnect = on_disconnect.clone();
                async move { transport.connect(&address, on_disconnect).await }
            })
            .await
    }

    /// Resolve the characteristics and subscribe to notifications
    async fn prepare_connection(self: &Arc<Self>, client: Arc<dyn LinkClient>) -> Result<Connection> {
        let mut resolved = resolve_characteristics(&client.characteristics(false).await?);
        if resolved.0.is_none() || resolved.1.is_none() {
            // Try to handle services failing to load
            resolved = resolve_characteristics(&client.characteristics(true).await?);
        }
        let (read_char, write_char) = match resolved {
            (Some(read), Some(write)) => (read, write),
            (None, _) => return Err(Error::CharacteristicMissing("Read")),
            (_, None) => return Err(Error::CharacteristicMissing("Write")),
        };

        debug!("{}: Subscribe to notifications; RSSI: {:?}", self.name(), self.rssi());
        let controller = Arc::downgrade(self);
        let on_notify: NotificationCallback = Arc::new(move |data| {
            if let Some(controller) = controller.upgrade() {
                controller.handle_notification(data);
            }
        });
        client.subscribe(read_char, on_notify).await?;

        Ok(Connection {
            client,
            read_char,
            write_char,
        })
    }

    fn handle_notification(&self, data: Vec<u8>) {
        debug!("{}: Notification received: {}", self.name(), hex::encode(&data));
        let waiting = self.pending_response.lock().take();
        match waiting {
            Some(waiting) => {
                let _ = waiting.send(data);
            }
            None => debug!("{}: No command waiting, dropping notification", self.name()),
        }
    }

    fn handle_disconnected(&self) {
        if self.expected_disconnect.load(Ordering::SeqCst) {
            debug!("{}: Disconnected from device; RSSI: {:?}", self.name(), self.rssi());
            return;
        }
        // Fail a command still waiting for its answer
        self.pending_response.lock().take();
        warn!(
            "{}: Device unexpectedly disconnected; RSSI: {:?}",
            self.name(),
            self.rssi()
        );
    }

    fn reset_disconnect_timer(self: &Arc<Self>) {
        self.expected_disconnect.store(false, Ordering::SeqCst);

        let controller: Weak<Self> = Arc::downgrade(self);
        let delay = self.config.disconnect_delay();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = controller.upgrade() {
                controller.execute_timed_disconnect().await;
            }
        });

        if let Some(previous) = self.disconnect_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    async fn execute_timed_disconnect(&self) {
        // Running inside the timer, which must not abort itself
        self.disconnect_timer.lock().take();
        debug!(
            "{}: Disconnecting after timeout of {:?}",
            self.name(),
            self.config.disconnect_delay()
        );
        self.execute_disconnect().await;
    }

    async fn execute_disconnect(&self) {
        let timer = self.disconnect_timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }

        let _guard = self.connect_lock.lock().await;
        self.expected_disconnect.store(true, Ordering::SeqCst);
        let connection = self.connection.lock().take();
        self.pending_response.lock().take();

        if let Some(connection) = connection {
            if connection.client.is_connected().await {
                if let Err(err) = connection.client.disconnect().await {
                    warn!("{}: Failed to disconnect: {err}", self.name());
                }
            }
        }
    }

    async fn send_command_while_connected(&self, command: &[u8]) -> Result<Vec<u8>> {
        debug!("{}: Sending command {}", self.name(), hex::encode(command));
        if self.operation_lock.try_lock().is_err() {
            debug!(
                "{}: Operation already in progress, waiting; RSSI: {:?}",
                self.name(),
                self.rssi()
            );
        }
        let _guard = self.operation_lock.lock().await;

        match self.send_command_locked(command).await {
            Ok(response) => Ok(response),
            Err(err @ Error::DeviceUnreachable(_)) => {
                error!(
                    "{}: device not found, no longer in range, or poor RSSI: {:?}",
                    self.name(),
                    self.rssi()
                );
                Err(err)
            }
            Err(err @ Error::CharacteristicMissing(_)) => {
                debug!(
                    "{}: characteristic missing: {err}; RSSI: {:?}",
                    self.name(),
                    self.rssi()
                );
                Err(err)
            }
            Err(err) => {
                debug!("{}: communication failed: {err}", self.name());
                Err(err)
            }
        }
    }

    async fn send_command_locked(&self, command: &[u8]) -> Result<Vec<u8>> {
        match self.execute_command_locked(command).await {
            Err(err) if err.is_transient() => {
                // Disconnect so we can reset state and try again
                debug!(
                    "{}: RSSI: {:?}; Disconnecting due to error: {err}",
                    self.name(),
                    self.rssi()
                );
                self.execute_disconnect().await;
                Err(err)
            }
            result => result,
        }
    }

    async fn execute_command_locked(&self, command: &[u8]) -> Result<Vec<u8>> {
        let (client, read_char, write_char) = {
            let connection = self.connection.lock();
            match connection.as_ref() {
                Some(c) => (c.client.clone(), c.read_char, c.write_char),
                None => return Err(Error::Transport("not connected".into())),
            }
        };
        debug!("{}: Writing to {write_char}, expecting response on {read_char}", self.name());

        let (response_tx, response_rx) = oneshot::channel();
        *self.pending_response.lock() = Some(response_tx);

        if let Err(err) = client.write(write_char, command).await {
            self.pending_response.lock().take();
            return Err(err);
        }

        let timeout = self.config.response_timeout();
        let response = tokio::time::timeout(timeout, response_rx).await;
        self.pending_response.lock().take();

        match response {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(Error::Transport("disconnected while waiting for response".into())),
            Err(_) => Err(Error::ResponseTimeout(timeout)),
        }
    }
}

impl Drop for EcoflowController {
    fn drop(&mut self) {
        if let Some(timer) = self.disconnect_timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Pick the first known read and write characteristic present in `available`
fn resolve_characteristics(available: &[Uuid]) -> (Option<Uuid>, Option<Uuid>) {
    let find = |candidates: &[Uuid]| candidates.iter().copied().find(|uuid| available.contains(uuid));
    (
        find(&POSSIBLE_READ_CHARACTERISTIC_UUIDS),
        find(&POSSIBLE_WRITE_CHARACTERISTIC_UUIDS),
    )
}
