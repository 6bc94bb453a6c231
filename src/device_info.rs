use serde::{Deserialize, Serialize};

/// Model name reported when the serial number matches no known product family
pub const UNKNOWN_MODEL: &str = "Unknown";

/// Identity and state of a power station, as last seen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human readable name. Currently the serial number.
    pub name: String,
    /// The 16 character serial number. Empty when no identity has been seen yet.
    pub serial: String,
    /// Product family inferred from the serial number prefix
    #[serde(default)]
    pub model: Option<String>,
    /// The state of charge of the battery in %
    #[serde(default)]
    pub battery: Option<u8>,
}

impl DeviceInfo {
    /// The product family, or [`UNKNOWN_MODEL`]
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(UNKNOWN_MODEL)
    }

    /// Return a new record with every field known in `patch` taken from `patch`
    /// and everything else kept from `self`.
    ///
    /// Empty strings count as unknown, so an advertisement without an identity
    /// never erases a serial number that was already seen.
    pub fn merge(&self, patch: &DeviceInfo) -> DeviceInfo {
        fn pick(old: &str, new: &str) -> String {
            let value = if new.is_empty() { old } else { new };
            value.to_string()
        }

        DeviceInfo {
            name: pick(&self.name, &patch.name),
            serial: pick(&self.serial, &patch.serial),
            model: patch.model.clone().or_else(|| self.model.clone()),
            battery: patch.battery.or(self.battery),
        }
    }
}

/// What caused the callbacks to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackType {
    Advertisement,
    Poll,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn river() -> DeviceInfo {
        DeviceInfo {
            name: "R60A1B2C3D4E5F6G".into(),
            serial: "R60A1B2C3D4E5F6G".into(),
            model: Some("River 2".into()),
            battery: Some(50),
        }
    }

    #[test]
    fn test_merge_keeps_fields_missing_from_patch() {
        let patch = DeviceInfo {
            battery: Some(80),
            ..Default::default()
        };
        let merged = river().merge(&patch);
        assert_eq!(merged.serial, "R60A1B2C3D4E5F6G");
        assert_eq!(merged.model(), "River 2");
        assert_eq!(merged.battery, Some(80));
    }

    #[test]
    fn test_merge_missing_battery_keeps_last_value() {
        let old = DeviceInfo {
            name: "X".into(),
            serial: "X".into(),
            battery: Some(50),
            ..Default::default()
        };
        let patch = DeviceInfo {
            name: "X".into(),
            serial: "X".into(),
            ..Default::default()
        };
        assert_eq!(old.merge(&patch).battery, Some(50));
    }

    #[test]
    fn test_merge_is_stable_when_repeated() {
        let patch = DeviceInfo {
            name: "R33XXXXXXXXXXXXX".into(),
            serial: "R33XXXXXXXXXXXXX".into(),
            model: Some("Delta 2".into()),
            battery: None,
        };
        let once = river().merge(&patch);
        assert_eq!(once.merge(&patch), once);
        assert_eq!(once.battery, Some(50));
    }

    #[test]
    fn test_merge_leaves_inputs_untouched() {
        let old = river();
        let patch = DeviceInfo {
            battery: Some(1),
            ..Default::default()
        };
        let _ = old.merge(&patch);
        assert_eq!(old, river());
        assert_eq!(patch.battery, Some(1));
        assert!(patch.serial.is_empty());
    }

    #[test]
    fn test_default_model_is_unknown() {
        assert_eq!(DeviceInfo::default().model(), UNKNOWN_MODEL);
    }

    #[test]
    fn test_restore_from_json_without_optional_fields() {
        let info: DeviceInfo =
            serde_json::from_str(r#"{"name":"R65AAAA","serial":"R65AAAA"}"#).unwrap();
        assert_eq!(info.serial, "R65AAAA");
        assert_eq!(info.model, None);
        assert_eq!(info.battery, None);
    }
}
