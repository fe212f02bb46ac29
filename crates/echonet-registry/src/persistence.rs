use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine;
use echonet_protocol::DeviceKey;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::RegistryError;
use crate::model::{AccessRules, Device, PropertyValue};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedProperty {
    edt: String,
    ts: String,
    #[serde(default)]
    flags: u8,
}

const FLAG_GET: u8 = 0b001;
const FLAG_SET: u8 = 0b010;
const FLAG_ANNOUNCE: u8 = 0b100;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDevice {
    #[serde(rename = "lastSeen")]
    last_seen: String,
    properties: HashMap<String, PersistedProperty>,
}

/// Writes `contents` to `path` via the standard tmp-write, fsync,
/// rename sequence so a crash never leaves `path` partially written.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), RegistryError> {
    let tmp_path = tmp_path_for(path);
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Renames a corrupt persistence file aside so a fresh, empty store can
/// be created in its place, per the startup recovery policy in §4.D.
pub fn quarantine_corrupt_file(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut quarantined = path.as_os_str().to_owned();
    quarantined.push(format!(".corrupt.{now}"));
    std::fs::rename(path, PathBuf::from(quarantined))
}

pub fn serialize_devices(devices: &HashMap<DeviceKey, Device>) -> Result<Vec<u8>, RegistryError> {
    let mut out: HashMap<String, PersistedDevice> = HashMap::with_capacity(devices.len());
    for (key, device) in devices {
        let mut properties = HashMap::with_capacity(device.properties.len());
        for (epc, value) in &device.properties {
            let mut flags = 0u8;
            if value.access.get {
                flags |= FLAG_GET;
            }
            if value.access.set {
                flags |= FLAG_SET;
            }
            if value.access.announce {
                flags |= FLAG_ANNOUNCE;
            }
            properties.insert(
                format!("{epc:02x}"),
                PersistedProperty {
                    edt: BASE64.encode(&value.edt),
                    ts: to_rfc3339(value.observed_at),
                    flags,
                },
            );
        }
        out.insert(
            key.to_string(),
            PersistedDevice {
                last_seen: to_rfc3339(device.last_seen),
                properties,
            },
        );
    }
    serde_json::to_vec_pretty(&out).map_err(|source| RegistryError::CorruptPersistence {
        path: "devices.json".to_owned(),
        source,
    })
}

pub fn deserialize_devices(bytes: &[u8]) -> Result<HashMap<DeviceKey, Device>, serde_json::Error> {
    let raw: HashMap<String, PersistedDevice> = serde_json::from_slice(bytes)?;
    let mut devices = HashMap::with_capacity(raw.len());
    for (key_str, persisted) in raw {
        let Ok(key) = key_str.parse::<DeviceKey>() else {
            continue; // forward-compat: ignore unparsable keys rather than failing the whole load
        };
        let mut device = Device::new(key);
        device.last_seen = from_rfc3339(&persisted.last_seen).unwrap_or_else(SystemTime::now);
        for (epc_str, prop) in persisted.properties {
            let Ok(epc) = u8::from_str_radix(&epc_str, 16) else {
                continue;
            };
            let edt = BASE64.decode(&prop.edt).unwrap_or_default();
            let observed_at = from_rfc3339(&prop.ts).unwrap_or_else(SystemTime::now);
            device.properties.insert(
                epc,
                PropertyValue {
                    edt,
                    observed_at,
                    fresh: true,
                    access: AccessRules {
                        get: prop.flags & FLAG_GET != 0,
                        set: prop.flags & FLAG_SET != 0,
                        announce: prop.flags & FLAG_ANNOUNCE != 0,
                    },
                },
            );
        }
        device.refresh_descriptor();
        devices.insert(device.key, device);
    }
    Ok(devices)
}

pub fn serialize_aliases(aliases: &HashMap<String, DeviceKey>) -> Result<Vec<u8>, RegistryError> {
    let map: HashMap<&String, String> = aliases.iter().map(|(k, v)| (k, v.to_string())).collect();
    serde_json::to_vec_pretty(&map).map_err(|source| RegistryError::CorruptPersistence {
        path: "aliases.json".to_owned(),
        source,
    })
}

pub fn deserialize_aliases(bytes: &[u8]) -> Result<HashMap<String, DeviceKey>, serde_json::Error> {
    let raw: HashMap<String, String> = serde_json::from_slice(bytes)?;
    Ok(raw
        .into_iter()
        .filter_map(|(name, key_str)| key_str.parse().ok().map(|key| (name, key)))
        .collect())
}

pub fn serialize_groups(
    groups: &HashMap<String, std::collections::HashSet<DeviceKey>>,
) -> Result<Vec<u8>, RegistryError> {
    let map: HashMap<&String, Vec<String>> = groups
        .iter()
        .map(|(name, members)| (name, members.iter().map(DeviceKey::to_string).collect()))
        .collect();
    serde_json::to_vec_pretty(&map).map_err(|source| RegistryError::CorruptPersistence {
        path: "groups.json".to_owned(),
        source,
    })
}

pub fn deserialize_groups(
    bytes: &[u8],
) -> Result<HashMap<String, std::collections::HashSet<DeviceKey>>, serde_json::Error> {
    let raw: HashMap<String, Vec<String>> = serde_json::from_slice(bytes)?;
    Ok(raw
        .into_iter()
        .map(|(name, members)| {
            let members = members.into_iter().filter_map(|m| m.parse().ok()).collect();
            (name, members)
        })
        .collect())
}

fn to_rfc3339(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_owned())
}

fn from_rfc3339(s: &str) -> Option<SystemTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok().map(SystemTime::from)
}
