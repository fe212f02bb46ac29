use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use base64::Engine;
use echonet_protocol::{DeviceKey, EventPayload};
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};

use crate::error::RegistryError;
use crate::model::{AccessRules, Device, UpsertOutcome, DEFAULT_PROPERTY_TTL};
use crate::persistence;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct DeviceFilter {
    pub class_group: Option<u8>,
    pub class: Option<u8>,
    pub alias_prefix: Option<String>,
    pub group: Option<String>,
}

/// Thread-safe store of devices, aliases, and groups, with atomic JSON
/// persistence and a broadcast channel of registry change events.
pub struct Registry {
    devices: RwLock<HashMap<DeviceKey, Device>>,
    aliases: RwLock<HashMap<String, DeviceKey>>,
    groups: RwLock<HashMap<String, HashSet<DeviceKey>>>,
    save_lock: AsyncMutex<()>,
    data_dir: PathBuf,
    events: broadcast::Sender<EventPayload>,
}

impl Registry {
    pub fn empty(data_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Registry {
            devices: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            save_lock: AsyncMutex::new(()),
            data_dir: data_dir.into(),
            events,
        }
    }

    /// Loads `devices.json`/`aliases.json`/`groups.json` from `data_dir`.
    /// A missing file is treated as an empty store. A malformed file is
    /// quarantined (renamed to `<name>.corrupt.<unix_ts>`) and replaced
    /// with an empty store for that file only — this is the
    /// `CorruptPersistence` startup recovery path from §4.D.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();

        let devices = load_or_quarantine(&data_dir.join("devices.json"), persistence::deserialize_devices)
            .unwrap_or_default();
        let aliases = load_or_quarantine(&data_dir.join("aliases.json"), persistence::deserialize_aliases)
            .unwrap_or_default();
        let groups = load_or_quarantine(&data_dir.join("groups.json"), persistence::deserialize_groups)
            .unwrap_or_default();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Registry {
            devices: RwLock::new(devices),
            aliases: RwLock::new(aliases),
            groups: RwLock::new(groups),
            save_lock: AsyncMutex::new(()),
            data_dir,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventPayload> {
        self.events.subscribe()
    }

    fn publish(&self, event: EventPayload) {
        let _ = self.events.send(event);
    }

    /// Updates or inserts a property value, creating the device on first
    /// contact. Returns the upsert outcome so the hub can classify the
    /// `deviceChanged` diff it builds from the broadcast event.
    pub async fn upsert_property(
        &self,
        key: DeviceKey,
        epc: u8,
        edt: Vec<u8>,
        access: AccessRules,
    ) -> UpsertOutcome {
        let mut devices = self.devices.write().await;
        let is_new_device = !devices.contains_key(&key);
        let device = devices.entry(key).or_insert_with(|| Device::new(key));
        device.touch();

        let outcome = match device.properties.get(&epc) {
            None => UpsertOutcome::Added,
            Some(existing) if existing.edt == edt => {
                if existing.fresh {
                    UpsertOutcome::UnchangedAndFresh
                } else {
                    UpsertOutcome::UnchangedButRefreshed
                }
            }
            Some(_) => UpsertOutcome::Changed,
        };

        device
            .properties
            .insert(epc, crate::model::PropertyValue::new(edt.clone(), access));
        if epc == 0x8A {
            device.refresh_descriptor();
        }
        drop(devices);

        if is_new_device {
            self.publish(EventPayload::DeviceAdded { device: key });
        }
        if !matches!(outcome, UpsertOutcome::UnchangedAndFresh) {
            let epc_hex = format!("{epc:02x}");
            let encoded = BASE64.encode(&edt);
            let mut added = HashMap::new();
            let mut changed = HashMap::new();
            let mut unchanged = HashMap::new();
            match outcome {
                UpsertOutcome::Added => {
                    added.insert(epc_hex, encoded);
                }
                UpsertOutcome::Changed => {
                    changed.insert(epc_hex, encoded);
                }
                UpsertOutcome::UnchangedButRefreshed => {
                    unchanged.insert(epc_hex, encoded);
                }
                UpsertOutcome::UnchangedAndFresh => unreachable!(),
            }
            self.publish(EventPayload::DeviceChanged {
                device: key,
                added,
                changed,
                unchanged,
            });
        }

        outcome
    }

    /// Registers `key` if it isn't already known, without attaching any
    /// property value. Used by discovery, which learns a device's
    /// existence (from a `Get_Res` against the node profile) before it
    /// has read any of its properties.
    pub async fn touch_device(&self, key: DeviceKey) {
        let mut devices = self.devices.write().await;
        let is_new_device = !devices.contains_key(&key);
        let device = devices.entry(key).or_insert_with(|| Device::new(key));
        device.touch();
        drop(devices);

        if is_new_device {
            self.publish(EventPayload::DeviceAdded { device: key });
        }
    }

    pub async fn mark_stale_if_expired(&self, key: DeviceKey, epc: u8) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(&key) {
            if let Some(value) = device.properties.get_mut(&epc) {
                if value.is_stale(DEFAULT_PROPERTY_TTL) {
                    value.fresh = false;
                }
            }
        }
    }

    pub async fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<DeviceKey>, RegistryError> {
        let devices = self.devices.read().await;
        let group_members = match &filter.group {
            Some(name) => Some(self.resolve_group(name).await?),
            None => None,
        };
        let aliases = self.aliases.read().await;

        let mut keys: Vec<DeviceKey> = devices
            .values()
            .filter(|device| {
                filter
                    .class_group
                    .is_none_or(|cg| device.key.eoj.class_group == cg)
            })
            .filter(|device| filter.class.is_none_or(|c| device.key.eoj.class == c))
            .filter(|device| match &filter.alias_prefix {
                None => true,
                Some(prefix) => aliases
                    .iter()
                    .any(|(alias, target)| *target == device.key && alias.starts_with(prefix.as_str())),
            })
            .filter(|device| match &group_members {
                None => true,
                Some(members) => members.contains(&device.key),
            })
            .map(|device| device.key)
            .collect();

        keys.sort_by_key(|key| {
            (
                key.eoj.class_group,
                key.eoj.class,
                key.eoj.instance,
                key.ip(),
            )
        });
        Ok(keys)
    }

    pub async fn add_alias(&self, name: &str, target: DeviceKey) -> Result<(), RegistryError> {
        validate_alias_name(name)?;
        if !self.devices.read().await.contains_key(&target) {
            return Err(RegistryError::UnknownDevice(target.to_string()));
        }

        let mut aliases = self.aliases.write().await;
        if let Some(existing_target) = aliases.get(name) {
            if *existing_target == target {
                return Ok(());
            }
            return Err(RegistryError::AliasInUse(name.to_owned()));
        }

        // Bijective: drop any prior alias pointing at the same target.
        aliases.retain(|_, existing_target| *existing_target != target);
        aliases.insert(name.to_owned(), target);
        Ok(())
    }

    pub async fn remove_alias(&self, name: &str) -> bool {
        self.aliases.write().await.remove(name).is_some()
    }

    pub async fn list_aliases(&self) -> HashMap<String, DeviceKey> {
        self.aliases.read().await.clone()
    }

    pub async fn add_group(&self, name: &str, members: &[DeviceKey]) -> Result<(), RegistryError> {
        validate_group_name(name)?;
        self.assert_all_known(members).await?;
        self.groups
            .write()
            .await
            .entry(name.to_owned())
            .or_default()
            .extend(members.iter().copied());
        Ok(())
    }

    pub async fn remove_from_group(&self, name: &str, members: &[DeviceKey]) -> Result<(), RegistryError> {
        validate_group_name(name)?;
        self.assert_all_known(members).await?;
        if let Some(set) = self.groups.write().await.get_mut(name) {
            for member in members {
                set.remove(member);
            }
        }
        Ok(())
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), RegistryError> {
        validate_group_name(name)?;
        self.groups.write().await.remove(name);
        Ok(())
    }

    pub async fn list_groups(&self) -> HashMap<String, HashSet<DeviceKey>> {
        self.groups.read().await.clone()
    }

    async fn assert_all_known(&self, members: &[DeviceKey]) -> Result<(), RegistryError> {
        let devices = self.devices.read().await;
        for member in members {
            if !devices.contains_key(member) {
                return Err(RegistryError::UnknownDevice(member.to_string()));
            }
        }
        Ok(())
    }

    async fn resolve_group(&self, name: &str) -> Result<HashSet<DeviceKey>, RegistryError> {
        self.groups
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_owned()))
    }

    /// Resolves a literal device key, an alias, or a `@group` name to an
    /// ordered set of device keys.
    pub async fn resolve(&self, target: &str) -> Result<Vec<DeviceKey>, RegistryError> {
        if let Some(group_name) = target.strip_prefix('@') {
            let _ = group_name;
            let mut members: Vec<DeviceKey> = self.resolve_group(target).await?.into_iter().collect();
            members.sort_by_key(|key| (key.eoj.class_group, key.eoj.class, key.eoj.instance, key.ip()));
            return Ok(members);
        }
        if let Ok(key) = target.parse::<DeviceKey>() {
            if self.devices.read().await.contains_key(&key) {
                return Ok(vec![key]);
            }
            return Err(RegistryError::UnknownDevice(target.to_owned()));
        }
        if let Some(key) = self.aliases.read().await.get(target) {
            return Ok(vec![*key]);
        }
        Err(RegistryError::UnknownDevice(target.to_owned()))
    }

    /// Persists `devices.json`, `aliases.json`, and `groups.json`,
    /// serializing saves so only one write is ever in flight.
    pub async fn save_all(&self) -> Result<(), RegistryError> {
        let _guard = self.save_lock.lock().await;
        let devices_bytes = persistence::serialize_devices(&*self.devices.read().await)?;
        let aliases_bytes = persistence::serialize_aliases(&*self.aliases.read().await)?;
        let groups_bytes = persistence::serialize_groups(&*self.groups.read().await)?;

        persistence::atomic_write(&self.data_dir.join("devices.json"), &devices_bytes)?;
        persistence::atomic_write(&self.data_dir.join("aliases.json"), &aliases_bytes)?;
        persistence::atomic_write(&self.data_dir.join("groups.json"), &groups_bytes)?;
        Ok(())
    }
}

fn validate_alias_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.starts_with('@') || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::AliasInvalid(name.to_owned()));
    }
    Ok(())
}

fn validate_group_name(name: &str) -> Result<(), RegistryError> {
    if !name.starts_with('@') || name.len() < 2 {
        return Err(RegistryError::GroupInvalid(name.to_owned()));
    }
    Ok(())
}

fn load_or_quarantine<T>(
    path: &Path,
    deserialize: impl Fn(&[u8]) -> Result<T, serde_json::Error>,
) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match deserialize(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "corrupt persistence file, quarantining");
            if let Err(rename_err) = persistence::quarantine_corrupt_file(path) {
                tracing::error!(path = %path.display(), error = %rename_err, "failed to quarantine corrupt file");
            }
            None
        }
    }
}
