//! The socket multiplexer: one UDP socket fronting every uTP connection
//! in the process.
//!
//! The multiplexer owns the connection table and the lifetime of the
//! connections in it; connections hold a non-owning send capability on
//! the shared [`BoundSocket`]. Inbound datagrams are routed by the
//! `(remote address, connection id)` pair the datagram carries, falling
//! back to the pending table for handshake traffic, and finally to the
//! passive-accept path for fresh SYNs.
//!
//! A connection failure never touches its siblings, and a malformed
//! datagram is logged and dropped without disturbing the receive loop.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::Connection;
use super::error::Error;
use super::packet::{Packet, PacketType, HEADER_SIZE};
use super::{MAX_DATAGRAM_SIZE, UTP_TRANSPORT_LOG_TARGET};
use crate::config::UtpConfig;

/// Connection ids are drawn uniformly from this closed range; zero and
/// 0xFFFF are reserved.
const CONNECTION_ID_RANGE: std::ops::RangeInclusive<u16> = 0x0001..=0xFFFE;

/// Attempts before id generation gives up with `NoFreeId`.
const CONNECTION_ID_ATTEMPTS: u32 = 100;

/// Incoming connections parked until `accept` picks them up.
const ACCEPT_BACKLOG: usize = 32;

/// Wrapper for a Tokio [`UdpSocket`][`tokio::net::UdpSocket`] that is
/// bound to a particular socket and counts traffic in both directions.
pub struct BoundSocket {
    socket: tokio::net::UdpSocket,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl BoundSocket {
    /// # Errors
    ///
    /// Will return an error if the socket can't be bound to the provided
    /// address.
    pub async fn new(addr: SocketAddr) -> Result<BoundSocket, Error> {
        let bind_addr = format!("udp://{addr}");
        debug!(target: UTP_TRANSPORT_LOG_TARGET, bind_addr, "BoundSocket::new (binding)");

        let socket = tokio::net::UdpSocket::bind(addr).await?;

        // Reception of the IP TOS byte (for congestion-experienced
        // marks) is not exposed by the runtime socket; continuing
        // without it is the documented non-fatal path.
        debug!(target: UTP_TRANSPORT_LOG_TARGET, bind_addr, "congestion-mark reception unavailable, continuing without");

        Ok(BoundSocket {
            socket,
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// # Panics
    ///
    /// Will panic if the socket can't get the address it was bound to.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.socket.local_addr().expect("it should get local address")
    }

    /// Sends one datagram, counting it.
    ///
    /// # Errors
    ///
    /// Will return an error if the underlying socket refuses the send.
    pub async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        let sent = self.socket.send_to(payload, addr).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn statistics(&self) -> SocketStatistics {
        SocketStatistics {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Deref for BoundSocket {
    type Target = tokio::net::UdpSocket;

    fn deref(&self) -> &Self::Target {
        &self.socket
    }
}

impl Debug for BoundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let local_addr = match self.socket.local_addr() {
            Ok(socket) => format!("Receiving From: {socket}"),
            Err(err) => format!("Socket Broken: {err}"),
        };

        f.debug_struct("BoundSocket").field("addr", &local_addr).finish_non_exhaustive()
    }
}

/// Per-direction traffic counters of the shared socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One datagram as it came off the socket.
#[derive(Debug)]
pub struct RawDatagram {
    pub payload: Vec<u8>,
    pub from: SocketAddr,
    /// The IP layer delivered the datagram with a congestion-experienced
    /// mark. Always `false` from the runtime socket today; tests and
    /// alternative socket backends set it.
    pub ecn_ce: bool,
}

/// Stream of inbound datagrams from the bound socket.
pub struct Receiver {
    pub bound_socket: Arc<BoundSocket>,
    data: RefCell<[u8; MAX_DATAGRAM_SIZE]>,
}

impl Receiver {
    #[must_use]
    pub fn new(bound_socket: Arc<BoundSocket>) -> Self {
        Receiver {
            bound_socket,
            data: RefCell::new([0; MAX_DATAGRAM_SIZE]),
        }
    }
}

impl Stream for Receiver {
    type Item = std::io::Result<RawDatagram>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut buf = *self.data.borrow_mut();
        let mut buf = tokio::io::ReadBuf::new(&mut buf);

        let Poll::Ready(ready) = self.bound_socket.poll_recv_from(cx, &mut buf) else {
            return Poll::Pending;
        };

        let res = match ready {
            Ok(from) => {
                let payload = buf.filled().to_vec();
                Some(Ok(RawDatagram {
                    payload,
                    from,
                    ecn_ce: false,
                }))
            }
            Err(err) => Some(Err(err)),
        };

        Poll::Ready(res)
    }
}

/// The connection tables, guarded by one short-lived lock. Mutated only
/// on the receive path and on register/unregister.
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    /// Fully-identified flows, keyed by the id inbound datagrams from
    /// that peer carry.
    flows: HashMap<(SocketAddr, u16), Arc<Connection>>,
    /// Connections that sent a SYN and still await the peer's id,
    /// keyed by our freshly-issued local id.
    pending: HashMap<u16, Arc<Connection>>,
    /// Every local id currently in use.
    active_ids: HashSet<u16>,
}

impl Registry {
    fn new() -> Arc<Registry> {
        Arc::new(Registry {
            inner: Mutex::new(RegistryInner {
                flows: HashMap::new(),
                pending: HashMap::new(),
                active_ids: HashSet::new(),
            }),
        })
    }

    /// Draws a fresh local connection id and reserves it.
    ///
    /// # Errors
    ///
    /// Will return `Error::NoFreeId` when the bounded number of attempts
    /// is exhausted.
    fn reserve_id<R: Rng>(&self, rng: &mut R) -> Result<u16, Error> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let id = generate_connection_id(&inner.active_ids, rng)?;
        inner.active_ids.insert(id);
        Ok(id)
    }

    fn register_initiator(&self, addr: SocketAddr, local_id: u16, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.flows.insert((addr, local_id), Arc::clone(connection));
        inner.pending.insert(local_id, Arc::clone(connection));
        inner.active_ids.insert(local_id);
    }

    fn register_acceptor(&self, addr: SocketAddr, local_id: u16, remote_id: u16, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.flows.insert((addr, remote_id), Arc::clone(connection));
        inner.flows.insert((addr, local_id), Arc::clone(connection));
        inner.active_ids.insert(local_id);
    }

    /// Records the peer's id for a flow once the handshake revealed it.
    pub(crate) fn bind_remote(&self, addr: SocketAddr, remote_id: u16, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.flows.insert((addr, remote_id), Arc::clone(connection));
    }

    fn lookup_flow(&self, addr: SocketAddr, id: u16) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.flows.get(&(addr, id)).cloned()
    }

    fn lookup_pending(&self, id: u16) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.pending.get(&id).cloned()
    }

    /// The connection awaiting a SYN-ACK from this address, if any.
    fn pending_syn_target(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .pending
            .values()
            .find(|connection| connection.remote_addr() == addr)
            .cloned()
    }

    fn is_active(&self, id: u16) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.active_ids.contains(&id)
    }

    pub(crate) fn unregister(&self, addr: SocketAddr, local_id: u16, remote_id: u16) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.flows.remove(&(addr, local_id));
        inner.flows.remove(&(addr, remote_id));
        inner.pending.remove(&local_id);
        inner.active_ids.remove(&local_id);
    }

    fn active_connection_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.active_ids.len()
    }
}

/// Draws an id uniformly from `[0x0001, 0xFFFE]`, rejecting active ones.
///
/// # Errors
///
/// Will return `Error::NoFreeId` when the bounded number of attempts is
/// exhausted.
fn generate_connection_id<R: Rng>(active_ids: &HashSet<u16>, rng: &mut R) -> Result<u16, Error> {
    for _ in 0..CONNECTION_ID_ATTEMPTS {
        let id = rng.gen_range(CONNECTION_ID_RANGE);
        if !active_ids.contains(&id) {
            return Ok(id);
        }
    }
    Err(Error::NoFreeId {
        attempts: CONNECTION_ID_ATTEMPTS,
    })
}

/// Unregisters a connect-in-progress when its future is dropped before
/// the handshake resolves.
struct ConnectGuard {
    registry: Arc<Registry>,
    addr: SocketAddr,
    local_id: u16,
    connection: Option<Arc<Connection>>,
}

impl ConnectGuard {
    fn disarm(&mut self) {
        self.connection = None;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.registry.unregister(self.addr, self.local_id, 0);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    connection.close().await;
                });
            }
        }
    }
}

/// One UDP socket fronting all uTP connections in the process.
pub struct UtpSocketMux {
    socket: Arc<BoundSocket>,
    registry: Arc<Registry>,
    config: UtpConfig,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
}

impl Debug for UtpSocketMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpSocketMux").field("socket", &self.socket).finish_non_exhaustive()
    }
}

impl UtpSocketMux {
    /// Binds the shared socket.
    ///
    /// # Errors
    ///
    /// Will return an error if the socket can't be bound to the provided
    /// address.
    pub async fn bind(addr: SocketAddr, config: UtpConfig) -> Result<Arc<UtpSocketMux>, Error> {
        let socket = Arc::new(BoundSocket::new(addr).await?);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        Ok(Arc::new(UtpSocketMux {
            socket,
            registry: Registry::new(),
            config,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }))
    }

    /// # Panics
    ///
    /// Will panic if the socket can't get the address it was bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.address()
    }

    /// Starts the receive loop as a background task.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            mux.run_receive_loop().await;
        })
    }

    /// Opens a connection to a peer and completes the handshake.
    ///
    /// # Errors
    ///
    /// Will return `Error::NoFreeId` if every connection id is taken,
    /// `Error::Timeout` if the peer never answers, or the close reason
    /// if the connection dies during the handshake.
    pub async fn connect(self: &Arc<Self>, remote_addr: SocketAddr) -> Result<Arc<Connection>, Error> {
        let local_id = self.registry.reserve_id(&mut rand::thread_rng())?;

        let connection = Connection::new(
            remote_addr,
            local_id,
            Arc::clone(&self.socket),
            Arc::downgrade(&self.registry),
            self.config.clone(),
        );
        self.registry.register_initiator(remote_addr, local_id, &connection);

        let mut guard = ConnectGuard {
            registry: Arc::clone(&self.registry),
            addr: remote_addr,
            local_id,
            connection: Some(Arc::clone(&connection)),
        };

        let result = connection.start_connect().await;
        guard.disarm();

        match result {
            Ok(()) => Ok(connection),
            Err(e) => {
                // The connection's teardown already unregistered it.
                Err(e)
            }
        }
    }

    /// Waits for the next passively accepted connection. `None` once the
    /// receive loop is gone.
    pub async fn accept(&self) -> Option<Arc<Connection>> {
        self.accept_rx.lock().await.recv().await
    }

    /// Traffic counters plus the number of live connections.
    #[must_use]
    pub fn statistics(&self) -> MuxStatistics {
        MuxStatistics {
            socket: self.socket.statistics(),
            active_connections: self.registry.active_connection_count(),
        }
    }

    async fn run_receive_loop(self: Arc<Self>) {
        let local_addr = format!("udp://{}", self.socket.address());
        let mut receiver = Receiver::new(Arc::clone(&self.socket));

        debug!(target: UTP_TRANSPORT_LOG_TARGET, local_addr, "UtpSocketMux::run_receive_loop (listening...)");

        loop {
            if let Some(datagram) = receiver.next().await {
                let datagram = match datagram {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::Interrupted {
                            warn!(target: UTP_TRANSPORT_LOG_TARGET, local_addr, err = %e, "UtpSocketMux::run_receive_loop (interrupted)");
                            return;
                        }
                        warn!(target: UTP_TRANSPORT_LOG_TARGET, local_addr, err = %e, "UtpSocketMux::run_receive_loop (transient receive error)");
                        continue;
                    }
                };

                self.socket.record_received(datagram.payload.len());
                self.dispatch(datagram).await;
            } else {
                debug!(target: UTP_TRANSPORT_LOG_TARGET, local_addr, "UtpSocketMux::run_receive_loop (ran dry)");
                break;
            }
        }
    }

    /// Routes one datagram to its connection, or to the passive-accept
    /// path, or to the floor.
    async fn dispatch(&self, datagram: RawDatagram) {
        if datagram.payload.len() < HEADER_SIZE {
            debug!(target: UTP_TRANSPORT_LOG_TARGET, len = datagram.payload.len(), from = %datagram.from, "datagram too small to be uTP");
            return;
        }

        let Some(connection_id) = Packet::peek_connection_id(&datagram.payload) else {
            return;
        };

        if let Some(connection) = self.registry.lookup_flow(datagram.from, connection_id) {
            connection.handle_datagram(&datagram.payload, datagram.ecn_ce).await;
            return;
        }

        // Our own freshly-issued id receiving a first response.
        if let Some(connection) = self.registry.lookup_pending(connection_id) {
            connection.handle_datagram(&datagram.payload, datagram.ecn_ce).await;
            return;
        }

        if Packet::peek_packet_type(&datagram.payload) == Some(PacketType::Syn) {
            // A SYN from an address we are dialing is the answer to our
            // SYN (it carries the peer's fresh id, which no table knows
            // yet); anything else is a new incoming connection.
            if let Some(connection) = self.registry.pending_syn_target(datagram.from) {
                connection.handle_datagram(&datagram.payload, datagram.ecn_ce).await;
            } else {
                self.accept_incoming(datagram, connection_id).await;
            }
            return;
        }

        if self.registry.is_active(connection_id) {
            // Same id, different address: a genuine collision. The SYN
            // retry elsewhere resolves with a different id.
            warn!(
                target: UTP_TRANSPORT_LOG_TARGET,
                connection_id,
                from = %datagram.from,
                "connection id collision, dropping datagram"
            );
            return;
        }

        debug!(target: UTP_TRANSPORT_LOG_TARGET, connection_id, from = %datagram.from, "dropping datagram for unknown connection");
    }

    /// Creates a passive connection for a fresh SYN and parks it for
    /// `accept`.
    async fn accept_incoming(&self, datagram: RawDatagram, remote_id: u16) {
        let local_id = match self.registry.reserve_id(&mut rand::thread_rng()) {
            Ok(id) => id,
            Err(e) => {
                warn!(target: UTP_TRANSPORT_LOG_TARGET, from = %datagram.from, err = %e, "cannot accept incoming connection");
                return;
            }
        };

        let connection = Connection::new(
            datagram.from,
            local_id,
            Arc::clone(&self.socket),
            Arc::downgrade(&self.registry),
            self.config.clone(),
        );
        self.registry.register_acceptor(datagram.from, local_id, remote_id, &connection);

        connection.handle_datagram(&datagram.payload, datagram.ecn_ce).await;

        debug!(
            target: UTP_TRANSPORT_LOG_TARGET,
            from = %datagram.from,
            local_id,
            remote_id,
            "accepted incoming uTP connection"
        );

        if self.accept_tx.try_send(connection).is_err() {
            warn!(target: UTP_TRANSPORT_LOG_TARGET, from = %datagram.from, "accept backlog full, incoming connection not surfaced");
        }
    }
}

/// Multiplexer-level statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxStatistics {
    pub socket: SocketStatistics,
    pub active_connections: usize,
}
