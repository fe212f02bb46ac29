use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::DeviceKey;

/// The stable `code` string for an `error` envelope. Frozen once published
/// since clients match on these literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    MalformedFrame,
    Timeout,
    Rejected,
    PartialResult,
    UnknownDevice,
    AliasInvalid,
    AliasInUse,
    GroupInvalid,
    CorruptPersistence,
    TransportFatal,
    Cancelled,
}

/// A device target as written by a client: a literal `"ip eojHex"`
/// device key, an alias, or a `@group` name. Resolved by the registry.
pub type Target = String;

/// Client → server envelope. Carries an optional `requestId` alongside
/// the tagged payload; `{type, requestId?, payload}` per the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    ListDevices {
        #[serde(default)]
        filter: DeviceFilter,
    },
    GetProperties {
        device: Target,
        epcs: Vec<String>,
    },
    SetProperties {
        device: Target,
        /// EPC hex string → base64-encoded EDT bytes.
        properties: HashMap<String, String>,
    },
    Discover {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    AddAlias {
        name: String,
        target: Target,
    },
    RemoveAlias {
        name: String,
    },
    ListAliases,
    AddGroup {
        name: String,
        members: Vec<Target>,
    },
    RemoveGroup {
        name: String,
        /// `None` deletes the group outright; `Some` removes just these
        /// members.
        #[serde(default)]
        members: Option<Vec<Target>>,
    },
    ListGroups,
    Subscribe {
        enabled: bool,
    },
    Ping,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    #[serde(default)]
    pub class_group: Option<u8>,
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub alias_prefix: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Server → client envelope variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: serde_json::Value,
    },
    Event {
        seq: u64,
        payload: EventPayload,
    },
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventPayload {
    DeviceChanged {
        device: DeviceKey,
        /// EPC hex → base64 EDT, newly observed this update.
        added: HashMap<String, String>,
        changed: HashMap<String, String>,
        unchanged: HashMap<String, String>,
    },
    DeviceAdded {
        device: DeviceKey,
    },
    AliasChanged {
        name: String,
        target: Option<DeviceKey>,
    },
    GroupChanged {
        name: String,
        members: Vec<DeviceKey>,
    },
    Resync,
}
