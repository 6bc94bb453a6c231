use std::time::Duration;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Why a manufacturer data payload could not be turned into a [`crate::DeviceInfo`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("manufacturer data too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("serial number is not valid UTF-8")]
    InvalidSerial,
    #[error("no EcoFlow manufacturer data in advertisement")]
    NoManufacturerData,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid advertisement: {0}")]
    Decode(#[from] DecodeError),
    /// The device is not known to the adapter or is out of range
    #[error("device not found: {0}")]
    DeviceUnreachable(String),
    /// The connected device does not expose the expected characteristic
    #[error("{0} characteristic missing")]
    CharacteristicMissing(&'static str),
    /// A bus level fault. Worth a short pause before trying again.
    #[error("bluetooth bus error: {0}")]
    Bus(String),
    #[error("bluetooth transport error: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
}

impl Error {
    /// Transient link faults. The session disconnects and the command is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Bus(_) | Error::Transport(_) | Error::ResponseTimeout(_)
        )
    }

    /// Whether the retry loop should sleep before the next attempt
    pub fn wants_backoff(&self) -> bool {
        matches!(self, Error::Bus(_))
    }
}

impl From<bluest::Error> for Error {
    fn from(err: bluest::Error) -> Self {
        use bluest::error::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Error::DeviceUnreachable(err.to_string()),
            ErrorKind::Internal => Error::Bus(err.to_string()),
            _ => Error::Transport(err.to_string()),
        }
    }
}

#[test]
fn test_transient_errors() {
    assert!(Error::Bus("org.bluez.Error.Failed".into()).is_transient());
    assert!(Error::Transport("write failed".into()).is_transient());
    assert!(Error::ResponseTimeout(Duration::from_secs(5)).is_transient());
    assert!(!Error::DeviceUnreachable("AA:BB".into()).is_transient());
    assert!(!Error::CharacteristicMissing("Read").is_transient());
    assert!(!Error::from(DecodeError::InvalidSerial).is_transient());
}

#[test]
fn test_only_bus_errors_back_off() {
    assert!(Error::Bus("org.bluez.Error.InProgress".into()).wants_backoff());
    assert!(!Error::Transport("write failed".into()).wants_backoff());
    assert!(!Error::ResponseTimeout(Duration::from_secs(5)).wants_backoff());
}
