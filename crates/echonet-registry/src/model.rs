use std::time::{Duration, SystemTime};

use echonet_protocol::DeviceKey;

/// Default time-to-live for a cached property before it's considered
/// stale and due for proactive refresh.
pub const DEFAULT_PROPERTY_TTL: Duration = Duration::from_secs(300);

/// Access rules last advertised by a device for one EPC, taken from its
/// 0x9D/0x9E/0x9F property maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessRules {
    pub get: bool,
    pub set: bool,
    pub announce: bool,
}

/// One cached property value.
#[derive(Debug, Clone)]
pub struct PropertyValue {
    pub edt: Vec<u8>,
    pub observed_at: SystemTime,
    /// `false` once `observed_at` is older than the owning device's TTL.
    pub fresh: bool,
    pub access: AccessRules,
}

impl PropertyValue {
    pub fn new(edt: Vec<u8>, access: AccessRules) -> Self {
        PropertyValue {
            edt,
            observed_at: SystemTime::now(),
            fresh: true,
            access,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.observed_at
            .elapsed()
            .map(|elapsed| elapsed > ttl)
            .unwrap_or(false)
    }
}

/// A manufacturer/product descriptor parsed from the standard
/// properties 0x8A (manufacturer code) and friends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub manufacturer_code: Option<[u8; 3]>,
    pub product_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub key: DeviceKey,
    pub properties: std::collections::HashMap<u8, PropertyValue>,
    pub last_seen: SystemTime,
    pub descriptor: Descriptor,
}

impl Device {
    pub fn new(key: DeviceKey) -> Self {
        Device {
            key,
            properties: std::collections::HashMap::new(),
            last_seen: SystemTime::now(),
            descriptor: Descriptor::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }

    /// Re-derives `descriptor` from the current 0x8A property, if present.
    pub fn refresh_descriptor(&mut self) {
        if let Some(value) = self.properties.get(&0x8A) {
            if value.edt.len() >= 3 {
                self.descriptor.manufacturer_code =
                    Some([value.edt[0], value.edt[1], value.edt[2]]);
            }
        }
    }
}

/// The result of [`crate::Registry::upsert_property`]: which bucket an
/// update landed in, for the hub to build a `deviceChanged` diff from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Changed,
    /// Same bytes as before; only reported when the prior value was stale.
    UnchangedButRefreshed,
    /// Same bytes, prior value was already fresh — suppressed from events.
    UnchangedAndFresh,
}
