//! Typed configuration for the controller binary, read from environment
//! variables the way `services/server/src/main.rs` reads `DATABASE_URL`/
//! `BIND_ADDR`/`LOG_LEVEL` — there is no on-disk config file here.

use std::path::PathBuf;

pub struct ControllerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    /// `None` disables the `/ws` bearer-token gate entirely.
    pub auth_token: Option<String>,
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        ControllerConfig {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_owned())
                .into(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            auth_token: std::env::var("AUTH_TOKEN").ok(),
        }
    }
}
