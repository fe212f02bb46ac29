#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("alias {0:?} is invalid: must be non-empty, contain no whitespace, and not start with '@'")]
    AliasInvalid(String),
    #[error("alias {0:?} is already in use")]
    AliasInUse(String),
    #[error("group name {0:?} is invalid: must start with '@'")]
    GroupInvalid(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("persistence file {path} is corrupt: {source}")]
    CorruptPersistence {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
