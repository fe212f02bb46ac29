use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{TransportError, Transport, INTERFACE_RESCAN, MULTICAST_GROUP, PORT};

const INBOUND_BUFFER: usize = 1024;
const RECV_BUF_LEN: usize = 2048;

/// Real UDP transport: one ephemeral-port unicast socket, plus one
/// multicast socket per up, non-loopback IPv4 interface.
pub struct UdpTransport {
    unicast: Arc<UdpSocket>,
    multicast_sockets: Arc<StdMutex<Vec<Arc<UdpSocket>>>>,
    joined_addrs: Arc<StdMutex<HashSet<Ipv4Addr>>>,
    inbound_tx: mpsc::Sender<(IpAddr, Vec<u8>)>,
    inbound_rx: AsyncMutex<mpsc::Receiver<(IpAddr, Vec<u8>)>>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let unicast = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(spawn_listener(
            unicast.clone(),
            inbound_tx.clone(),
            cancel.clone(),
        ));

        let transport = UdpTransport {
            unicast,
            multicast_sockets: Arc::new(StdMutex::new(Vec::new())),
            joined_addrs: Arc::new(StdMutex::new(HashSet::new())),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            cancel,
            tasks: StdMutex::new(tasks),
        };

        transport.join_new_interfaces();
        transport.spawn_rescan_task();

        Ok(transport)
    }

    /// Enumerates local interfaces and joins the multicast group on any
    /// up, non-loopback IPv4 address not already joined.
    fn join_new_interfaces(&self) {
        for addr in multicast_capable_addrs() {
            let already_joined = self.joined_addrs.lock().unwrap().contains(&addr);
            if already_joined {
                continue;
            }
            match make_multicast_socket(addr) {
                Ok(std_socket) => match UdpSocket::from_std(std_socket) {
                    Ok(socket) => {
                        let socket = Arc::new(socket);
                        self.multicast_sockets.lock().unwrap().push(socket.clone());
                        self.joined_addrs.lock().unwrap().insert(addr);
                        let handle = spawn_multicast_listener(
                            socket,
                            addr,
                            self.inbound_tx.clone(),
                            self.cancel.clone(),
                            self.multicast_sockets.clone(),
                            self.joined_addrs.clone(),
                        );
                        self.tasks.lock().unwrap().push(handle);
                        tracing::info!(interface_addr = %addr, "joined ECHONET Lite multicast group");
                    }
                    Err(err) => {
                        tracing::warn!(interface_addr = %addr, error = %err, "failed to adopt multicast socket into tokio");
                    }
                },
                Err(err) => {
                    tracing::warn!(interface_addr = %addr, error = %err, "failed to join multicast group on interface");
                }
            }
        }
    }

    fn spawn_rescan_task(&self) {
        let multicast_sockets = self.multicast_sockets.clone();
        let joined_addrs = self.joined_addrs.clone();
        let inbound_tx = self.inbound_tx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(INTERFACE_RESCAN);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for addr in multicast_capable_addrs() {
                            if joined_addrs.lock().unwrap().contains(&addr) {
                                continue;
                            }
                            if let Ok(std_socket) = make_multicast_socket(addr) {
                                if let Ok(socket) = UdpSocket::from_std(std_socket) {
                                    let socket = Arc::new(socket);
                                    multicast_sockets.lock().unwrap().push(socket.clone());
                                    joined_addrs.lock().unwrap().insert(addr);
                                    let _ = spawn_multicast_listener(
                                        socket,
                                        addr,
                                        inbound_tx.clone(),
                                        cancel.clone(),
                                        multicast_sockets.clone(),
                                        joined_addrs.clone(),
                                    );
                                    tracing::info!(interface_addr = %addr, "joined newly observed interface");
                                }
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }
}

impl Transport for UdpTransport {
    async fn send(&self, dest: IpAddr, frame: Vec<u8>) -> Result<(), TransportError> {
        self.unicast
            .send_to(&frame, SocketAddr::new(dest, PORT))
            .await?;
        Ok(())
    }

    async fn send_multicast(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let sockets = self.multicast_sockets.lock().unwrap().clone();
        if sockets.is_empty() {
            return Err(TransportError::NoInterfaces);
        }
        let group = SocketAddr::from((Ipv4Addr::from(MULTICAST_GROUP), PORT));
        // Best-effort: one dead interface must not stop the frame from
        // reaching every other still-healthy interface.
        let mut last_err = None;
        let mut sent = false;
        for socket in sockets {
            match socket.send_to(&frame, group).await {
                Ok(_) => sent = true,
                Err(err) => {
                    tracing::warn!(error = %err, "multicast send failed on one interface, continuing with the rest");
                    last_err = Some(err);
                }
            }
        }
        if sent {
            Ok(())
        } else {
            Err(last_err.map_or(TransportError::NoInterfaces, Into::into))
        }
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
        self.cancel.cancel();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    fn is_listening(&self) -> bool {
        !self.cancel.is_cancelled() && !self.multicast_sockets.lock().unwrap().is_empty()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn multicast_capable_addrs() -> Vec<Ipv4Addr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && iface.is_multicast() && !iface.is_loopback())
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr()))
        .collect()
}

fn make_multicast_socket(addr: Ipv4Addr) -> std::io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT).into())?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_if_v4(&addr)?;
    socket.join_multicast_v4(&Ipv4Addr::from(MULTICAST_GROUP), &addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn spawn_listener(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(IpAddr, Vec<u8>)>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(listen_loop(socket, tx, cancel))
}

/// Spawns a multicast listener and, once its `listen_loop` exits (whether
/// from cancellation or a socket error), removes the interface's address
/// and socket from the shared bookkeeping. Without this, an interface
/// whose socket errors out stays marked "joined" forever and the 60s
/// rescan never re-adopts it; the dead socket would also linger in
/// `multicast_sockets` and keep failing every future multicast send.
fn spawn_multicast_listener(
    socket: Arc<UdpSocket>,
    addr: Ipv4Addr,
    tx: mpsc::Sender<(IpAddr, Vec<u8>)>,
    cancel: CancellationToken,
    multicast_sockets: Arc<StdMutex<Vec<Arc<UdpSocket>>>>,
    joined_addrs: Arc<StdMutex<HashSet<Ipv4Addr>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        listen_loop(socket.clone(), tx, cancel).await;
        joined_addrs.lock().unwrap().remove(&addr);
        multicast_sockets
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, &socket));
        tracing::info!(interface_addr = %addr, "multicast listener exited, interface will be re-joined on next rescan");
    })
}

async fn listen_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<(IpAddr, Vec<u8>)>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        if src.ip().is_loopback() {
                            continue;
                        }
                        if tx.send((src.ip(), buf[..len].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "transport socket error, stopping listener");
                        break;
                    }
                }
            }
        }
    }
}
