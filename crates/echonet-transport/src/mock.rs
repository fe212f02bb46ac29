use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::{Transport, TransportError};

/// In-memory transport for engine tests. Outbound frames land on
/// `sent`/`sent_multicast`; inbound frames are injected with
/// [`MockTransport::push_inbound`] and delivered in order by [`recv`].
pub struct MockTransport {
    inbound_tx: mpsc::Sender<(IpAddr, Vec<u8>)>,
    inbound_rx: Mutex<mpsc::Receiver<(IpAddr, Vec<u8>)>>,
    sent_tx: mpsc::UnboundedSender<(IpAddr, Vec<u8>)>,
    sent_multicast_tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (sent_multicast_tx, sent_multicast_rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            sent_tx,
            sent_multicast_tx,
            closed: AtomicBool::new(false),
        };
        let handle = MockTransportHandle {
            sent_rx: Mutex::new(sent_rx),
            sent_multicast_rx: Mutex::new(sent_multicast_rx),
        };
        (transport, handle)
    }

    /// Feeds `(source, frame)` as if it had just arrived over the wire.
    pub async fn push_inbound(&self, source: IpAddr, frame: Vec<u8>) {
        let _ = self.inbound_tx.send((source, frame)).await;
    }
}

impl Transport for MockTransport {
    async fn send(&self, dest: IpAddr, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let _ = self.sent_tx.send((dest, frame));
        Ok(())
    }

    async fn send_multicast(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let _ = self.sent_multicast_tx.send(frame);
        Ok(())
    }

    async fn recv(&self) -> Result<(IpAddr, Vec<u8>), TransportError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_listening(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// The test-side handle for observing what a [`MockTransport`] sent.
pub struct MockTransportHandle {
    sent_rx: Mutex<mpsc::UnboundedReceiver<(IpAddr, Vec<u8>)>>,
    sent_multicast_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MockTransportHandle {
    pub async fn next_sent(&self) -> Option<(IpAddr, Vec<u8>)> {
        self.sent_rx.lock().await.recv().await
    }

    pub async fn next_multicast(&self) -> Option<Vec<u8>> {
        self.sent_multicast_rx.lock().await.recv().await
    }
}
