//! The protocol engine: turns `Discover`/`Get`/`Set`/`Subscribe` calls
//! into correlated request/response traffic over a [`Transport`], with
//! retries, a periodic property refresh, and registry updates.
//!
//! Grounded on the request/response loop pattern used for the uplink's
//! own correlated calls, and on the `tokio::select!` loop combining a
//! socket, a heartbeat interval, and a command channel used for session
//! forwarding elsewhere in this codebase.

mod error;
mod pending;

pub use echonet_transport::Transport;
pub use error::{EngineError, GetOutcome};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use echonet_codec::{CodecError, Frame, Property};
use echonet_protocol::{DeviceKey, Eoj, Esv};
use echonet_registry::{AccessRules, Registry};
use echonet_transport::TransportError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use pending::{correlates, PendingKind, PendingMap, PendingSlot};

/// EPC for the node profile's self-node instance list, used to
/// enumerate the objects a node hosts during discovery.
const SELF_NODE_INSTANCE_LIST_S: u8 = 0xD6;
/// EPCs refreshed proactively every [`REFRESH_INTERVAL`] for every
/// known device: operation status, installation location, fault
/// status, and the three property map properties.
const ESSENTIAL_EPCS: [u8; 5] = [0x80, 0x88, 0x9D, 0x9E, 0x9F];
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Delay before each of the 3 retries of a unicast `Get`/`SetC`.
const UNICAST_RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(500), Duration::from_millis(1000), Duration::from_millis(2000)];
/// Delay before each of the 3 retries of a multicast discovery round,
/// suppressed once at least one response has been observed.
const DISCOVERY_RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(1000), Duration::from_millis(2000), Duration::from_millis(4000)];
/// How long a TID is kept parked after its request concludes, so a
/// late-arriving duplicate is recognized and logged rather than
/// mistaken for an unsolicited frame.
const LATE_DUPLICATE_WINDOW: Duration = Duration::from_secs(30);

/// Ties a [`Transport`] to a [`Registry`], correlating requests with
/// responses and feeding every update back into the registry.
pub struct Engine<T: Transport> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    pending: Arc<Mutex<PendingMap>>,
    controller_eoj: Eoj,
    shutdown: CancellationToken,
    announcements: tokio::sync::broadcast::Sender<(DeviceKey, u8, Vec<u8>)>,
}

impl<T: Transport> Engine<T> {
    /// Builds the engine and spawns its receive loop and periodic
    /// refresh scheduler. The returned `Arc` is the handle every caller
    /// (the hub, CLI commands, the refresh scheduler itself) shares.
    pub fn start(transport: Arc<T>, registry: Arc<Registry>, controller_eoj: Eoj) -> Arc<Self> {
        let (announcements, _) = tokio::sync::broadcast::channel(256);
        let engine = Arc::new(Engine {
            transport,
            registry,
            pending: Arc::new(Mutex::new(PendingMap::new())),
            controller_eoj,
            shutdown: CancellationToken::new(),
            announcements,
        });

        tokio::spawn(Engine::receive_loop(engine.clone()));
        tokio::spawn(Engine::refresh_loop(engine.clone()));
        engine
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.transport.close();
    }

    /// Whether the underlying transport currently has a usable socket —
    /// surfaced through `/healthz` rather than queried directly.
    pub fn is_transport_listening(&self) -> bool {
        self.transport.is_listening()
    }

    /// A stream of `(device, epc, edt)` for every unsolicited `INF`/
    /// `INFC` the engine observes, after it has already updated the
    /// registry.
    pub fn subscribe_announcements(&self) -> tokio::sync::broadcast::Receiver<(DeviceKey, u8, Vec<u8>)> {
        self.announcements.subscribe()
    }

    /// Multicasts a `Get` for the node profile's instance list and
    /// collects every device that answers within `timeout`. Retries at
    /// 1s/2s/4s as long as nothing has answered yet; once any response
    /// is seen, no further retry is sent but collection continues for
    /// the rest of `timeout`.
    pub async fn discover(&self, timeout: Duration) -> Vec<DeviceKey> {
        let (collector_tx, mut collector_rx) = mpsc::unbounded_channel();
        let mut tids = Vec::new();
        let mut discovered: Vec<DeviceKey> = Vec::new();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt = 0usize;
        let mut next_retry_at = tokio::time::Instant::now();

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            if now >= next_retry_at && (attempt == 0 || discovered.is_empty()) && attempt <= DISCOVERY_RETRY_DELAYS.len() {
                let tid = {
                    let mut pending = self.pending.lock().await;
                    pending.insert_with_fresh_tid(PendingSlot {
                        // No single device to record — discovery slots
                        // correlate on TID/DEOJ/ESV only, not on IP.
                        device: DeviceKey::new(std::net::Ipv4Addr::UNSPECIFIED.into(), Eoj::NODE_PROFILE),
                        controller_eoj: self.controller_eoj,
                        request_esv: Esv::Get,
                        kind: PendingKind::Discovery {
                            reply: collector_tx.clone(),
                        },
                    })
                };
                tids.push(tid);
                let frame = Frame::new(
                    tid,
                    self.controller_eoj,
                    Eoj::NODE_PROFILE,
                    Esv::Get,
                    vec![Property::new(SELF_NODE_INSTANCE_LIST_S, vec![])],
                );
                if let Ok(bytes) = frame.encode() {
                    let _ = self.transport.send_multicast(bytes).await;
                }
                next_retry_at = now
                    + DISCOVERY_RETRY_DELAYS
                        .get(attempt)
                        .copied()
                        .unwrap_or(Duration::from_secs(u64::MAX));
                attempt += 1;
            }

            let wait_until = next_retry_at.min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wait_until) => {}
                received = collector_rx.recv() => {
                    if let Some((source_ip, frame)) = received {
                        for key in decode_instance_list(source_ip, &frame) {
                            self.registry.touch_device(key).await;
                            if !discovered.contains(&key) {
                                discovered.push(key);
                            }
                        }
                    }
                }
            }
        }

        self.park_tids_for_late_duplicates(tids);
        discovered
    }

    /// Requests `epcs` from `device`, retrying at 500ms/1s/2s. Returns
    /// [`GetOutcome`] with any EPCs the device refused via `Get_SNA`
    /// listed in `missing`.
    pub async fn get(
        &self,
        device: DeviceKey,
        epcs: &[u8],
        timeout: Duration,
    ) -> Result<GetOutcome, EngineError> {
        let properties = epcs.iter().map(|&epc| Property::new(epc, vec![])).collect();
        let frame = self.request_with_retries(device, Esv::Get, properties, timeout).await?;

        let mut outcome = GetOutcome::default();
        match frame.esv {
            Esv::GetRes => {
                for property in &frame.properties {
                    self.registry
                        .upsert_property(
                            device,
                            property.epc,
                            property.edt.clone(),
                            AccessRules { get: true, ..Default::default() },
                        )
                        .await;
                    outcome.values.insert(property.epc, property.edt.clone());
                }
            }
            Esv::GetSna => {
                for property in &frame.properties {
                    if property.edt.is_empty() {
                        outcome.missing.push(property.epc);
                    } else {
                        self.registry
                            .upsert_property(
                                device,
                                property.epc,
                                property.edt.clone(),
                                AccessRules { get: true, ..Default::default() },
                            )
                            .await;
                        outcome.values.insert(property.epc, property.edt.clone());
                    }
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Writes `values` to `device` via `SetC`. Any EPC the device
    /// rejects (nonzero PDC in the `Set_Res`/`SetC_SNA`) is reported in
    /// [`EngineError::Rejected`]; on success every EPC is written
    /// through to the registry's cache immediately.
    pub async fn set(
        &self,
        device: DeviceKey,
        values: HashMap<u8, Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let properties: Vec<Property> = values
            .iter()
            .map(|(&epc, edt)| Property::new(epc, edt.clone()))
            .collect();
        let frame = self.request_with_retries(device, Esv::SetC, properties, timeout).await?;

        let rejected: Vec<u8> = frame
            .properties
            .iter()
            .filter(|property| !property.edt.is_empty())
            .map(|property| property.epc)
            .collect();
        if !rejected.is_empty() || frame.esv == Esv::SetCSna {
            let rejected = if rejected.is_empty() {
                values.keys().copied().collect()
            } else {
                rejected
            };
            return Err(EngineError::Rejected(rejected));
        }

        for (epc, edt) in values {
            self.registry
                .upsert_property(device, epc, edt, AccessRules { set: true, ..Default::default() })
                .await;
        }
        Ok(())
    }

    /// Sends one request and retries at the unicast schedule until a
    /// correlated response arrives or `timeout` elapses.
    async fn request_with_retries(
        &self,
        device: DeviceKey,
        esv: Esv,
        properties: Vec<Property>,
        timeout: Duration,
    ) -> Result<Frame, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut tids = Vec::new();
        let result = 'attempts: loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            let tid = {
                let mut pending = self.pending.lock().await;
                pending.insert_with_fresh_tid(PendingSlot {
                    device,
                    controller_eoj: self.controller_eoj,
                    request_esv: esv,
                    kind: PendingKind::Request { reply: Some(reply_tx) },
                })
            };
            tids.push(tid);

            let frame = Frame::new(tid, self.controller_eoj, device.eoj, esv, properties.clone());
            let send_result = match frame.encode() {
                Ok(bytes) => self.transport.send(device.ip(), bytes).await,
                Err(err) => break 'attempts Err(codec_send_error(err)),
            };
            if let Err(TransportError::Closed) = send_result {
                break 'attempts Err(EngineError::TransportFatal);
            }

            let attempt = tids.len() - 1;
            let attempt_delay = UNICAST_RETRY_DELAYS.get(attempt).copied();
            let attempt_deadline = match attempt_delay {
                Some(delay) => (tokio::time::Instant::now() + delay).min(deadline),
                None => deadline,
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break 'attempts Err(EngineError::Cancelled),
                response = reply_rx => {
                    match response {
                        Ok(frame) => break 'attempts Ok(frame),
                        Err(_) => break 'attempts Err(EngineError::Cancelled),
                    }
                }
                _ = tokio::time::sleep_until(attempt_deadline) => {
                    if attempt_deadline >= deadline || attempt + 1 > UNICAST_RETRY_DELAYS.len() {
                        break 'attempts Err(EngineError::Timeout);
                    }
                    // fresh TID next loop iteration
                }
            }
        };

        self.park_tids_for_late_duplicates(tids);
        result
    }

    /// Keeps `tids` registered for [`LATE_DUPLICATE_WINDOW`] past the
    /// conclusion of the call that used them, then drops them from the
    /// pending map.
    fn park_tids_for_late_duplicates(&self, tids: Vec<u16>) {
        if tids.is_empty() {
            return;
        }
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LATE_DUPLICATE_WINDOW).await;
            let mut pending = pending.lock().await;
            for tid in tids {
                pending.remove(tid);
            }
        });
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.transport.recv() => {
                    match received {
                        Ok((source_ip, bytes)) => self.handle_inbound(source_ip, bytes).await,
                        Err(_) => {
                            tracing::error!("transport closed, stopping engine receive loop");
                            self.shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, source_ip: IpAddr, bytes: Vec<u8>) {
        let frame = match Frame::parse(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%err, "dropping malformed frame");
                return;
            }
        };

        let delivered = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(frame.tid) {
                Some(slot) => {
                    // Discovery slots have no single device to match
                    // against (they're answered by whoever is out
                    // there), so they correlate on TID, DEOJ, and ESV
                    // only; unicast requests use the full rule.
                    let matches = match &slot.kind {
                        PendingKind::Discovery { .. } => {
                            frame.deoj == slot.controller_eoj && slot.request_esv.matches_response(frame.esv)
                        }
                        PendingKind::Request { .. } => correlates(slot, source_ip, &frame),
                    };
                    if matches {
                        match &mut slot.kind {
                            PendingKind::Request { reply } => match reply.take() {
                                Some(tx) => {
                                    let _ = tx.send(frame.clone());
                                }
                                None => {
                                    tracing::debug!(tid = frame.tid, "late duplicate response ignored");
                                }
                            },
                            PendingKind::Discovery { reply } => {
                                let _ = reply.send((source_ip, frame.clone()));
                            }
                        }
                    }
                    matches
                }
                None => false,
            }
        };
        if delivered {
            return;
        }

        if matches!(frame.esv, Esv::Inf | Esv::InfC) {
            let device = DeviceKey::new(source_ip, frame.seoj);
            for property in &frame.properties {
                self.registry
                    .upsert_property(
                        device,
                        property.epc,
                        property.edt.clone(),
                        AccessRules { announce: true, ..Default::default() },
                    )
                    .await;
                let _ = self.announcements.send((device, property.epc, property.edt.clone()));
            }
        } else {
            tracing::debug!(tid = frame.tid, esv = %frame.esv, "unmatched frame dropped");
        }
    }

    /// Every [`REFRESH_INTERVAL`], re-reads [`ESSENTIAL_EPCS`] for each
    /// known device whose cached value has gone stale, one outstanding
    /// request per device at a time.
    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh_stale_devices().await,
            }
        }
    }

    async fn refresh_stale_devices(&self) {
        let filter = echonet_registry::DeviceFilter {
            class_group: None,
            class: None,
            alias_prefix: None,
            group: None,
        };
        let devices = match self.registry.list_devices(&filter).await {
            Ok(devices) => devices,
            Err(err) => {
                tracing::warn!(%err, "could not list devices for refresh");
                return;
            }
        };
        for device in devices {
            for &epc in &ESSENTIAL_EPCS {
                self.registry.mark_stale_if_expired(device, epc).await;
            }
            if let Err(err) = self.get(device, &ESSENTIAL_EPCS, Duration::from_secs(5)).await {
                tracing::debug!(%device, %err, "periodic refresh did not complete");
            }
        }
    }

}

fn codec_send_error(err: CodecError) -> EngineError {
    tracing::warn!(%err, "failed to encode outbound frame");
    EngineError::TransportFatal
}

/// Decodes a `Get_Res`/`Get_SNA` against the self-node instance list
/// property into the `DeviceKey`s it advertises: one byte count
/// followed by that many 3-byte EOJs.
fn decode_instance_list(source_ip: IpAddr, frame: &Frame) -> Vec<DeviceKey> {
    let mut keys = Vec::new();
    for property in &frame.properties {
        if property.epc != SELF_NODE_INSTANCE_LIST_S {
            continue;
        }
        let edt = &property.edt;
        if edt.is_empty() {
            continue;
        }
        let count = edt[0] as usize;
        for i in 0..count {
            let offset = 1 + i * 3;
            if offset + 3 > edt.len() {
                break;
            }
            let eoj = Eoj::from_bytes([edt[offset], edt[offset + 1], edt[offset + 2]]);
            keys.push(DeviceKey::new(source_ip, eoj));
        }
    }
    keys
}
