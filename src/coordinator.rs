use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::controller::EcoflowController;
use crate::error::Result;
use crate::link::{Advertisement, UNAVAILABLE_AFTER};

/// Lifecycle of the application hosting the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Starting,
    Running,
    Stopping,
}

/// Feeds advertisements to an [`EcoflowController`] and decides when to poll it.
pub struct Coordinator {
    controller: Arc<EcoflowController>,
    host_state: Mutex<HostState>,
    last_poll: Mutex<Option<Instant>>,
    last_advertisement: Mutex<Option<Instant>>,
    was_unavailable: AtomicBool,
    ready: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(controller: Arc<EcoflowController>) -> Self {
        Self {
            controller,
            host_state: Mutex::new(HostState::Starting),
            last_poll: Mutex::new(None),
            last_advertisement: Mutex::new(None),
            was_unavailable: AtomicBool::new(true),
            ready: watch::channel(false).0,
        }
    }

    pub fn controller(&self) -> &Arc<EcoflowController> {
        &self.controller
    }

    pub fn set_host_state(&self, state: HostState) {
        *self.host_state.lock() = state;
    }

    pub fn host_state(&self) -> HostState {
        *self.host_state.lock()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn since_last_poll(&self) -> Option<Duration> {
        self.last_poll.lock().map(|at| at.elapsed())
    }

    /// Only poll if the host is running, the last poll is old enough, and there is
    /// actually a way to connect to the device.
    pub fn needs_poll(&self, since_last_poll: Option<Duration>) -> bool {
        self.host_state() == HostState::Running
            && since_last_poll.map_or(true, |since| since > self.controller.config().poll_interval())
            && self.controller.is_connectable()
    }

    /// Handle an advertisement from the device we track. Advertisements from
    /// other addresses are ignored and `false` is returned.
    pub async fn handle_advertisement(&self, advertisement: &Advertisement) -> bool {
        if advertisement.address != self.controller.address() {
            return false;
        }

        if let Err(err) = self.controller.set_advertisement(advertisement) {
            debug!("{}: Dropping advertisement: {err}", advertisement.address);
            return true;
        }
        *self.last_advertisement.lock() = Some(Instant::now());
        self.mark_ready();
        debug!("{}: Ecoflow data: {:?}", advertisement.address, self.controller.state());

        if self.was_unavailable.swap(false, Ordering::SeqCst) {
            info!("{}: Device is available", advertisement.address);
        }

        self.maybe_poll().await;
        true
    }

    /// Note that the device stopped advertising
    pub fn handle_unavailable(&self) {
        if !self.was_unavailable.swap(true, Ordering::SeqCst) {
            info!("{}: Device is unavailable", self.controller.address());
        }
    }

    pub fn is_available(&self) -> bool {
        !self.was_unavailable.load(Ordering::SeqCst)
    }

    /// Periodic check, for when advertisements are rare
    pub async fn tick(&self) {
        let stale = self
            .last_advertisement
            .lock()
            .map_or(false, |at| at.elapsed() > UNAVAILABLE_AFTER);
        if stale {
            self.handle_unavailable();
        }
        self.maybe_poll().await;
    }

    async fn maybe_poll(&self) {
        if !self.needs_poll(self.since_last_poll()) {
            return;
        }
        if let Err(err) = self.poll().await {
            warn!("{}: Poll failed: {err}", self.controller.name());
        }
    }

    /// Poll the device now, regardless of the policy
    pub async fn poll(&self) -> Result<()> {
        let result = self.controller.update().await;
        *self.last_poll.lock() = Some(Instant::now());
        if result.is_ok() {
            self.mark_ready();
        }
        result
    }

    fn mark_ready(&self) {
        if !self.controller.name().is_empty() {
            self.ready.send_replace(true);
        }
    }

    /// Wait until the device has identified itself.
    ///
    /// Returns `false` when nothing arrived within the startup timeout.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.subscribe();
        let startup_timeout = self.controller.config().startup_timeout();
        let arrived = matches!(
            timeout(startup_timeout, ready.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        arrived
    }

    /// Feed `advertisements` to the controller and tick every poll interval until
    /// the stream ends.
    pub async fn run<S>(&self, mut advertisements: S)
    where
        S: Stream<Item = Advertisement> + Unpin,
    {
        let mut ticker = tokio::time::interval(self.controller.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                advertisement = advertisements.next() => match advertisement {
                    Some(advertisement) => {
                        self.handle_advertisement(&advertisement).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("{}: Advertisement stream ended", self.controller.address());
    }
}
