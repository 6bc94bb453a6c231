//! The EcoFlow advertisement format and GATT layout.
//!
//! Manufacturer data is keyed by [`MANUFACTURER_ID`]. The payload layout is:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Unused
//! 1          | 16       | The serial number, 16 ASCII characters, zero padded
//! 17         | 17       | The state of charge in %, when present

use bluest::Uuid;
use log::debug;

use crate::device_info::DeviceInfo;
use crate::error::DecodeError;

/// Company identifier under which EcoFlow devices advertise
pub const MANUFACTURER_ID: u16 = 46517;

const SERIAL_START: usize = 1;
const SERIAL_LEN: usize = 16;
const BATTERY_OFFSET: usize = SERIAL_START + SERIAL_LEN;
/// Shortest payload that still carries a complete serial number
pub const MIN_PAYLOAD_LEN: usize = BATTERY_OFFSET;

// Serial number prefixes and the product family they identify. First match wins.
const MODEL_PREFIXES: [(&str, &str); 3] = [("R60", "River 2"), ("R65", "River 3"), ("R33", "Delta 2")];

/// Characteristics carrying notifications from the device, in order of preference
pub const POSSIBLE_READ_CHARACTERISTIC_UUIDS: [Uuid; 2] = [
    Uuid::from_u128(0x00000003_0000_1000_8000_00805f9b34fb),
    // Nordic UART TX
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
];

/// Characteristics accepting commands, in order of preference
pub const POSSIBLE_WRITE_CHARACTERISTIC_UUIDS: [Uuid; 2] = [
    Uuid::from_u128(0x00000002_0000_1000_8000_00805f9b34fb),
    // Nordic UART RX
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
];

/// Decode the manufacturer data of an EcoFlow advertisement.
///
/// A payload without the battery byte yields a record with `battery: None`, as does
/// a battery byte above 100. A serial number made only of padding means no identity
/// is available yet: the record then has an empty serial and no model.
pub fn parse_manufacturer_data(data: &[u8]) -> Result<DeviceInfo, DecodeError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort {
            len: data.len(),
            min: MIN_PAYLOAD_LEN,
        });
    }

    let serial = std::str::from_utf8(&data[SERIAL_START..BATTERY_OFFSET])
        .map_err(|_| DecodeError::InvalidSerial)?
        .trim_end_matches('\0')
        .to_string();

    let battery = match data.get(BATTERY_OFFSET) {
        Some(&pct) if pct <= 100 => Some(pct),
        Some(&pct) => {
            debug!("Ignoring out of range battery level {pct} in {}", hex::encode(data));
            None
        }
        None => None,
    };

    let model = if serial.is_empty() {
        None
    } else {
        infer_model(&serial).map(str::to_string)
    };

    Ok(DeviceInfo {
        name: serial.clone(),
        serial,
        model,
        battery,
    })
}

/// Map a serial number to its product family
pub fn infer_model(serial: &str) -> Option<&'static str> {
    MODEL_PREFIXES
        .iter()
        .find(|(prefix, _)| serial.starts_with(prefix))
        .map(|&(_, model)| model)
}

#[test]
fn test_parse_river_2() {
    let data = hex::decode(format!("01{}64", hex::encode("R60A1B2C3D4E5F6G"))).unwrap();
    let info = parse_manufacturer_data(&data).unwrap();
    assert_eq!(
        info,
        DeviceInfo {
            name: "R60A1B2C3D4E5F6G".into(),
            serial: "R60A1B2C3D4E5F6G".into(),
            model: Some("River 2".into()),
            battery: Some(100),
        }
    );
}

#[test]
fn test_parse_ignores_trailing_bytes() {
    let data = hex::decode("00523333414141414141414141414141413a0102").unwrap();
    let info = parse_manufacturer_data(&data).unwrap();
    assert_eq!(info.serial, "R33AAAAAAAAAAAAA");
    assert_eq!(info.model(), "Delta 2");
    assert_eq!(info.battery, Some(58));
}

#[test]
fn test_parse_without_battery_byte() {
    let data = hex::decode("00523635414141414141414141414141").unwrap();
    assert_eq!(data.len(), 16);
    assert_eq!(
        parse_manufacturer_data(&data),
        Err(DecodeError::TooShort { len: 16, min: 17 })
    );

    let data = hex::decode("0052363541414141414141414141414141").unwrap();
    let info = parse_manufacturer_data(&data).unwrap();
    assert_eq!(info.serial, "R65AAAAAAAAAAAAA");
    assert_eq!(info.model(), "River 3");
    assert_eq!(info.battery, None);
}

#[test]
fn test_parse_too_short() {
    for len in 0..MIN_PAYLOAD_LEN {
        let data = vec![0x41; len];
        assert_eq!(
            parse_manufacturer_data(&data),
            Err(DecodeError::TooShort { len, min: MIN_PAYLOAD_LEN })
        );
    }
}

#[test]
fn test_parse_invalid_serial() {
    let data = hex::decode("00ff6041414141414141414141414141411e").unwrap();
    assert_eq!(parse_manufacturer_data(&data), Err(DecodeError::InvalidSerial));
}

#[test]
fn test_parse_zero_serial_has_no_identity() {
    let mut data = vec![0u8; 18];
    data[17] = 42;
    let info = parse_manufacturer_data(&data).unwrap();
    assert!(info.serial.is_empty());
    assert!(info.name.is_empty());
    assert_eq!(info.model, None);
    assert_eq!(info.battery, Some(42));
}

#[test]
fn test_parse_out_of_range_battery() {
    let data = hex::decode(format!("01{}c8", hex::encode("R60A1B2C3D4E5F6G"))).unwrap();
    assert_eq!(parse_manufacturer_data(&data).unwrap().battery, None);
}

#[test]
fn test_infer_model() {
    assert_eq!(infer_model("R60XXXXXXXXXXXXX"), Some("River 2"));
    assert_eq!(infer_model("R65XXXXXXXXXXXXX"), Some("River 3"));
    assert_eq!(infer_model("R33XXXXXXXXXXXXX"), Some("Delta 2"));
    assert_eq!(infer_model("P2XXXXXXXXXXXXXX"), None);
    assert_eq!(infer_model(""), None);
}

#[test]
fn test_unknown_model_is_independent_of_battery() {
    for pct in [0u8, 50, 100] {
        let mut data = vec![0x01];
        data.extend_from_slice(b"HW51ZEH4SF6E1234");
        data.push(pct);
        let info = parse_manufacturer_data(&data).unwrap();
        assert_eq!(info.model(), "Unknown");
        assert_eq!(info.battery, Some(pct));
    }
}
