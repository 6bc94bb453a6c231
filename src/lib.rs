//! Discover, identify and poll EcoFlow portable power stations over Bluetooth Low Energy
//!
//! Written for the River 2. River 3 and Delta 2 units advertise in the same format.
//!
//! Every power station broadcasts its serial number and state of charge in the
//! manufacturer data of its advertisements, so most of the time no connection is
//! needed at all. On top of that the device exposes a notify/write characteristic
//! pair for a request-response protocol, which [`EcoflowController`] connects to on
//! demand and releases again when idle.
//!
//! Currently the following data can be accessed:
//!
//! - Serial number
//! - Model (River 2, River 3, Delta 2)
//! - State of charge (%)
//! - Signal strength (dBm)
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use futures_util::StreamExt;
//! # use ecoflow_ble::{BluestTransport, ControllerConfig, Coordinator, EcoflowController, HostState, MANUFACTURER_ID};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(BluestTransport::new().await?);
//!     let mut advertisements = transport.advertisements().await?;
//!     let first = loop {
//!         let adv = advertisements.next().await.unwrap();
//!         if adv.manufacturer_data.contains_key(&MANUFACTURER_ID) {
//!             break adv;
//!         }
//!     };
//!
//!     let controller = EcoflowController::from_advertisement(transport.clone(), &first, ControllerConfig::default())?;
//!     let _unregister = controller.register_callback(|info, _| println!("{info:?}"));
//!
//!     let coordinator = Coordinator::new(controller);
//!     coordinator.set_host_state(HostState::Running);
//!     coordinator.run(advertisements).await;
//! #   Ok(())
//! # }
//! ```

mod config;
mod controller;
mod coordinator;
mod device_info;
mod error;
mod link;
mod protocol;
mod retry;

pub use config::ControllerConfig;
pub use controller::EcoflowController;
pub use coordinator::{Coordinator, HostState};
pub use device_info::{CallbackType, DeviceInfo, UNKNOWN_MODEL};
pub use error::{DecodeError, Error, Result};
pub use link::{
    Advertisement, BluestTransport, DisconnectedCallback, LinkClient, NotificationCallback, Transport,
};
pub use protocol::{
    infer_model, parse_manufacturer_data, MANUFACTURER_ID, MIN_PAYLOAD_LEN,
    POSSIBLE_READ_CHARACTERISTIC_UUIDS, POSSIBLE_WRITE_CHARACTERISTIC_UUIDS,
};
pub use retry::RetryPolicy;
