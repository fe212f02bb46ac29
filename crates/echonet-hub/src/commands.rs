//! Dispatches one decoded [`ClientMessage`] against the engine and
//! registry, returning either a JSON response payload or an error code
//! plus human-readable detail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use echonet_engine::{Engine, EngineError, GetOutcome};
use echonet_protocol::{ClientMessage, DeviceKey, ErrorCode, EventPayload};
use echonet_registry::{DeviceFilter, Registry, RegistryError};
use echonet_transport::Transport;
use serde_json::json;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5000;

pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        CommandError {
            code,
            message: message.into(),
        }
    }
}

pub async fn dispatch<T: Transport>(
    message: ClientMessage,
    registry: &Registry,
    engine: &Arc<Engine<T>>,
) -> Result<serde_json::Value, CommandError> {
    match message {
        ClientMessage::ListDevices { filter } => {
            let devices = registry
                .list_devices(&DeviceFilter {
                    class_group: filter.class_group,
                    class: filter.class,
                    alias_prefix: filter.alias_prefix,
                    group: filter.group,
                })
                .await
                .map_err(registry_error)?;
            Ok(json!({ "devices": devices }))
        }

        ClientMessage::GetProperties { device, epcs } => {
            let device = resolve_single(registry, &device).await?;
            let epcs = parse_epcs(&epcs)?;
            let outcome = engine
                .get(device, &epcs, DEFAULT_REQUEST_TIMEOUT)
                .await
                .map_err(engine_error)?;
            Ok(get_outcome_response(outcome)?)
        }

        ClientMessage::SetProperties { device, properties } => {
            let device = resolve_single(registry, &device).await?;
            let values = decode_properties(properties)?;
            engine
                .set(device, values, DEFAULT_REQUEST_TIMEOUT)
                .await
                .map_err(engine_error)?;
            Ok(json!({}))
        }

        ClientMessage::Discover { timeout_ms } => {
            let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_MS));
            let devices = engine.discover(timeout).await;
            Ok(json!({ "devices": devices }))
        }

        ClientMessage::AddAlias { name, target } => {
            let device = resolve_single(registry, &target).await?;
            registry.add_alias(&name, device).await.map_err(registry_error)?;
            Ok(json!({}))
        }

        ClientMessage::RemoveAlias { name } => {
            let removed = registry.remove_alias(&name).await;
            Ok(json!({ "removed": removed }))
        }

        ClientMessage::ListAliases => {
            let aliases = registry.list_aliases().await;
            Ok(json!({ "aliases": aliases }))
        }

        ClientMessage::AddGroup { name, members } => {
            let keys = resolve_each(registry, &members).await?;
            registry.add_group(&name, &keys).await.map_err(registry_error)?;
            Ok(json!({}))
        }

        ClientMessage::RemoveGroup { name, members } => {
            match members {
                Some(members) => {
                    let keys = resolve_each(registry, &members).await?;
                    registry
                        .remove_from_group(&name, &keys)
                        .await
                        .map_err(registry_error)?;
                }
                None => {
                    registry.delete_group(&name).await.map_err(registry_error)?;
                }
            }
            Ok(json!({}))
        }

        ClientMessage::ListGroups => {
            let groups = registry.list_groups().await;
            Ok(json!({ "groups": groups }))
        }

        ClientMessage::Subscribe { .. } => Ok(json!({})),

        ClientMessage::Ping => Ok(json!({})),
    }
}

async fn resolve_single(registry: &Registry, target: &str) -> Result<DeviceKey, CommandError> {
    let mut keys = registry
        .resolve(target)
        .await
        .map_err(registry_error)?;
    if keys.len() != 1 {
        return Err(CommandError::new(
            ErrorCode::UnknownDevice,
            format!("{target:?} does not resolve to exactly one device"),
        ));
    }
    Ok(keys.remove(0))
}

async fn resolve_each(registry: &Registry, targets: &[String]) -> Result<Vec<DeviceKey>, CommandError> {
    let mut keys = Vec::with_capacity(targets.len());
    for target in targets {
        keys.push(resolve_single(registry, target).await?);
    }
    Ok(keys)
}

fn parse_epcs(epcs: &[String]) -> Result<Vec<u8>, CommandError> {
    epcs.iter()
        .map(|s| {
            u8::from_str_radix(s, 16)
                .map_err(|_| CommandError::new(ErrorCode::MalformedFrame, format!("invalid EPC hex {s:?}")))
        })
        .collect()
}

fn decode_properties(properties: HashMap<String, String>) -> Result<HashMap<u8, Vec<u8>>, CommandError> {
    let mut decoded = HashMap::with_capacity(properties.len());
    for (epc_hex, edt_b64) in properties {
        let epc = u8::from_str_radix(&epc_hex, 16)
            .map_err(|_| CommandError::new(ErrorCode::MalformedFrame, format!("invalid EPC hex {epc_hex:?}")))?;
        let edt = BASE64
            .decode(edt_b64.as_bytes())
            .map_err(|_| CommandError::new(ErrorCode::MalformedFrame, format!("invalid base64 EDT for EPC {epc_hex:?}")))?;
        decoded.insert(epc, edt);
    }
    Ok(decoded)
}

fn get_outcome_response(outcome: GetOutcome) -> Result<serde_json::Value, CommandError> {
    if outcome.is_partial() {
        let missing: Vec<String> = outcome.missing.iter().map(|epc| format!("{epc:02x}")).collect();
        return Err(CommandError::new(
            ErrorCode::PartialResult,
            format!("properties unreadable: {}", missing.join(", ")),
        ));
    }
    let values: HashMap<String, String> = outcome
        .values
        .into_iter()
        .map(|(epc, edt)| (format!("{epc:02x}"), BASE64.encode(edt)))
        .collect();
    let missing: Vec<String> = outcome.missing.iter().map(|epc| format!("{epc:02x}")).collect();
    Ok(json!({ "values": values, "missing": missing }))
}

fn registry_error(err: RegistryError) -> CommandError {
    let code = match &err {
        RegistryError::AliasInvalid(_) => ErrorCode::AliasInvalid,
        RegistryError::AliasInUse(_) => ErrorCode::AliasInUse,
        RegistryError::GroupInvalid(_) => ErrorCode::GroupInvalid,
        RegistryError::UnknownDevice(_) => ErrorCode::UnknownDevice,
        RegistryError::CorruptPersistence { .. } | RegistryError::Io(_) => ErrorCode::CorruptPersistence,
    };
    CommandError::new(code, err.to_string())
}

fn engine_error(err: EngineError) -> CommandError {
    let code = match &err {
        EngineError::Timeout => ErrorCode::Timeout,
        EngineError::Rejected(_) => ErrorCode::Rejected,
        EngineError::Cancelled => ErrorCode::Cancelled,
        EngineError::TransportFatal => ErrorCode::TransportFatal,
    };
    CommandError::new(code, err.to_string())
}

/// A `deviceAdded`/`deviceChanged`/... event is keyed for staging-queue
/// coalescing by the entity it concerns, so newer updates about the
/// same device or alias overwrite older, still-unsent ones.
/// `DeviceAdded` gets its own key distinct from `DeviceChanged`'s so a
/// same-tick change to a freshly-discovered device can't clobber the
/// `deviceAdded` event before it's ever flushed.
pub fn coalescing_key(payload: &EventPayload) -> Option<String> {
    match payload {
        EventPayload::DeviceChanged { device, .. } => Some(format!("device:{device}")),
        EventPayload::DeviceAdded { device } => Some(format!("device-added:{device}")),
        EventPayload::AliasChanged { name, .. } => Some(format!("alias:{name}")),
        EventPayload::GroupChanged { name, .. } => Some(format!("group:{name}")),
        EventPayload::Resync => None,
    }
}

/// Merges `new` into `old` under the same coalescing key — used when a
/// second event lands in the same staging window as a first one still
/// awaiting flush. For `DeviceChanged`, the `added`/`changed`/`unchanged`
/// maps are merged per-EPC (new value wins); every other variant is a
/// plain replace since it carries no per-key diff to preserve.
pub fn merge_staged(old: EventPayload, new: EventPayload) -> EventPayload {
    match (old, new) {
        (
            EventPayload::DeviceChanged {
                device,
                mut added,
                mut changed,
                mut unchanged,
            },
            EventPayload::DeviceChanged {
                added: new_added,
                changed: new_changed,
                unchanged: new_unchanged,
                ..
            },
        ) => {
            added.extend(new_added);
            changed.extend(new_changed);
            unchanged.extend(new_unchanged);
            EventPayload::DeviceChanged {
                device,
                added,
                changed,
                unchanged,
            }
        }
        (_, new) => new,
    }
}
