use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("request timed out")]
    Timeout,
    #[error("device rejected properties: {0:?}")]
    Rejected(Vec<u8>),
    #[error("cancelled")]
    Cancelled,
    #[error("both transport sockets were lost")]
    TransportFatal,
}

/// Successful outcome of [`crate::Engine::get`]: every requested EPC that
/// the device answered, the ones it refused via `Get_SNA` (if any).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOutcome {
    pub values: HashMap<u8, Vec<u8>>,
    pub missing: Vec<u8>,
}

impl GetOutcome {
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}
