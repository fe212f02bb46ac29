#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport has been closed")]
    Closed,
    #[error("no interfaces available to send on")]
    NoInterfaces,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
