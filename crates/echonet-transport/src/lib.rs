//! UDP unicast + multicast transport for ECHONET Lite traffic.
//!
//! Grounded on the per-interface multicast join pattern used for device
//! discovery elsewhere in this codebase: enumerate up, multicast-capable
//! interfaces with `netdev`, configure each socket with `socket2`, then
//! hand it to tokio. Re-scans interfaces every 60 s so a NIC that comes
//! up after startup (or a DHCP lease that moves an address) is picked up
//! without a restart.

mod error;
mod mock;
mod udp;

pub use error::TransportError;
pub use mock::MockTransport;
pub use udp::UdpTransport;

use std::future::Future;
use std::net::IpAddr;

/// ECHONET Lite's well-known multicast group.
pub const MULTICAST_GROUP: [u8; 4] = [224, 0, 23, 0];
/// ECHONET Lite's well-known UDP port.
pub const PORT: u16 = 3610;
/// Cadence at which the real transport re-scans local interfaces.
pub const INTERFACE_RESCAN: std::time::Duration = std::time::Duration::from_secs(60);

/// The three operations the engine needs from a transport. Implemented
/// by [`UdpTransport`] for real sockets and by [`MockTransport`] for
/// tests — the engine is generic over this trait rather than depending
/// on either concretely.
pub trait Transport: Send + Sync + 'static {
    /// Writes `frame` to `dest` on port 3610.
    fn send(
        &self,
        dest: IpAddr,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Writes `frame` to the multicast group once per outbound interface.
    fn send_multicast(
        &self,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Pulls the next `(source IP, frame)` pair. Never restarts once
    /// [`Transport::close`] has been called — callers see
    /// [`TransportError::Closed`] forever after.
    fn recv(&self) -> impl Future<Output = Result<(IpAddr, Vec<u8>), TransportError>> + Send;

    /// Scoped release of every socket owned by this transport.
    fn close(&self);

    /// Whether this transport currently has at least one socket capable
    /// of sending/receiving — used by the hub's `/healthz` to report
    /// unhealthy rather than a blind 200 while no interface is joined.
    fn is_listening(&self) -> bool;
}
