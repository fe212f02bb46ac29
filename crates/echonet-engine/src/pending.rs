use std::collections::HashMap;

use echonet_codec::Frame;
use echonet_protocol::{DeviceKey, Eoj, Esv};
use tokio::sync::{mpsc, oneshot};

/// What a TID's outstanding request was, and how to deliver its answer.
pub enum PendingKind {
    /// A `Get`/`SetC` request awaiting exactly one correlated response.
    /// `None` once delivered — a second correlated frame for the same
    /// TID is a late duplicate and is logged, not redelivered.
    Request {
        reply: Option<oneshot::Sender<Frame>>,
    },
    /// One multicast discovery attempt; several TIDs (one per retry) can
    /// feed the same collector during a single `Discover` call.
    Discovery {
        reply: mpsc::UnboundedSender<(std::net::IpAddr, Frame)>,
    },
}

pub struct PendingSlot {
    pub device: DeviceKey,
    /// The controller's own EOJ used as SEOJ on the outbound request; a
    /// correlated response must carry this as its DEOJ.
    pub controller_eoj: Eoj,
    pub request_esv: Esv,
    pub kind: PendingKind,
}

/// The TID → PendingSlot map plus the monotonic, wraparound, skip-
/// occupied-slots TID generator. Guarded by a single lock, held only
/// for insert/remove, per the concurrency design.
#[derive(Default)]
pub struct PendingMap {
    slots: HashMap<u16, PendingSlot>,
    next_tid: u16,
}

impl PendingMap {
    pub fn new() -> Self {
        PendingMap::default()
    }

    /// Allocates a TID not currently in use and reserves it with `slot`.
    pub fn insert_with_fresh_tid(&mut self, slot: PendingSlot) -> u16 {
        let tid = self.next_free_tid();
        self.slots.insert(tid, slot);
        tid
    }

    fn next_free_tid(&mut self) -> u16 {
        loop {
            let candidate = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.slots.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn remove(&mut self, tid: u16) -> Option<PendingSlot> {
        self.slots.remove(&tid)
    }

    pub fn get(&self, tid: u16) -> Option<&PendingSlot> {
        self.slots.get(&tid)
    }

    pub fn get_mut(&mut self, tid: u16) -> Option<&mut PendingSlot> {
        self.slots.get_mut(&tid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Whether `frame` satisfies the correlation rule in §4.C against the
/// request recorded in `slot` from source address `source_ip`.
pub fn correlates(slot: &PendingSlot, source_ip: std::net::IpAddr, frame: &Frame) -> bool {
    source_ip == slot.device.ip()
        && frame.deoj == slot.controller_eoj
        && frame.seoj == slot.device.eoj
        && slot.request_esv.matches_response(frame.esv)
}
