//! Optional bearer-token gate for the `/ws` upgrade.
//!
//! Grounded on the forwarder's own `extract_bearer` header parsing; the
//! token comparison itself is HMAC-based rather than a database lookup
//! since the hub has no token store, only a single configured secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Whether `presented` matches `configured`, compared by hashing both
/// through the same keyed MAC rather than comparing bytes directly.
pub fn tokens_match(configured: &str, presented: &str) -> bool {
    mac_of(configured) == mac_of(presented)
}

fn mac_of(token: &str) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(b"echonet-hub-bearer-token-compare")
        .expect("HMAC accepts keys of any length");
    mac.update(token.as_bytes());
    mac.finalize().into_bytes().into()
}
