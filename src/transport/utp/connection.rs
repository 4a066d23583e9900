//! A single uTP connection.
//!
//! The connection owns the whole per-flow protocol state: the handshake
//! state machine, the reliability engine (send/receive buffers,
//! cumulative and selective acknowledgment, retransmission, RTT
//! estimation) and the congestion controller. Higher layers only see the
//! byte-stream facade: [`Connection::send`], [`Connection::recv`] and
//! [`Connection::close`].
//!
//! All mutable state lives behind one async mutex, so packet handling,
//! acknowledgment processing and close delivery are serialized per
//! connection. Two background tasks run while the connection is up: a
//! retransmission ticker and a delayed-acknowledgment ticker. Both are
//! aborted on close and neither can outlive the connection's teardown.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use torrkit_clock::clock::Time;
use torrkit_clock::{conv, MonotonicTimestamp};

use super::congestion::CongestionController;
use super::error::Error;
use super::extensions::{self, Extension, SackBlock};
use super::mux::{BoundSocket, Registry};
use super::packet::{Packet, PacketType, HEADER_SIZE};
use super::seq;
use super::{CurrentClock, UTP_TRANSPORT_LOG_TARGET};

/// Lower bound for the retransmission timeout.
const RTO_MIN: Duration = Duration::from_millis(100);
/// Upper bound for the retransmission timeout.
const RTO_MAX: Duration = Duration::from_secs(60);
/// Duplicate ACKs that trigger a fast retransmit.
const FAST_RETRANSMIT_THRESHOLD: u32 = 3;
/// In-order packets acknowledged immediately instead of delayed.
const IMMEDIATE_ACK_EVERY: u32 = 2;
/// Poll interval of the retransmission ticker.
const RETRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// EWMA weight of a new RTT sample in SRTT.
const RTT_ALPHA: f64 = 1.0 / 8.0;
/// EWMA weight of a new deviation sample in RTTVAR.
const RTT_BETA: f64 = 1.0 / 4.0;
/// Received-set size that triggers pruning of already-acked entries.
const RECEIVED_SET_PRUNE_THRESHOLD: usize = 4096;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    SynSent,
    SynReceived,
    Connected,
    FinSent,
    FinReceived,
    Closed,
    Reset,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::SynSent => "syn_sent",
            ConnectionState::SynReceived => "syn_received",
            ConnectionState::Connected => "connected",
            ConnectionState::FinSent => "fin_sent",
            ConnectionState::FinReceived => "fin_received",
            ConnectionState::Closed => "closed",
            ConnectionState::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Why a connection left the `Connected` state, when it did not close
/// gracefully. Surfaced as the error of any `send`/`recv` that comes
/// after.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Reset,
    MaxRetransmits { seq: u16, max: u32 },
}

/// Extensions both sides agreed on during the handshake.
#[derive(Debug, Clone, Copy, Default)]
struct NegotiatedExtensions {
    selective_ack: bool,
    ecn: bool,
    window_shift: u8,
}

/// Per-connection traffic counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_retransmitted: u64,
}

/// A packet waiting for acknowledgment.
#[derive(Debug, Clone)]
struct InFlight {
    packet: Packet,
    sent_at: MonotonicTimestamp,
    retries: u32,
}

/// The mutable half of a connection. Everything here is guarded by one
/// mutex; see the module docs for the serialization guarantees.
struct Inner {
    state: ConnectionState,
    /// Our 16-bit id; every packet we send carries it.
    connection_id: u16,
    /// The peer's id, captured during the handshake.
    remote_connection_id: u16,
    /// Next outgoing sequence number.
    seq_nr: u16,
    /// Highest received sequence number (wrap-aware).
    ack_nr: u16,
    /// Next contiguous sequence number the reassembly buffer waits for.
    expected_seq: u16,
    /// Epoch the wire timestamps of this connection count from.
    epoch: MonotonicTimestamp,
    /// Peer-advertised receive window, after scaling.
    send_window: u32,
    send_buffer: BTreeMap<u16, InFlight>,
    bytes_in_flight: usize,
    /// Out-of-order arrivals waiting for the gap to fill.
    out_of_order: BTreeMap<u16, Vec<u8>>,
    /// In-order bytes ready for the consumer.
    reassembled: Vec<u8>,
    /// Peer sent FIN; the stream ends after `reassembled` drains.
    eof: bool,
    /// Every sequence number received, for SACK synthesis.
    received_seqs: BTreeSet<u16>,
    /// Karn's rule: packets that were retransmitted never yield RTT samples.
    retransmitted: HashSet<u16>,
    duplicate_acks: u32,
    /// The ack_nr of the last State packet, for duplicate detection.
    last_ack_received: u16,
    /// Single-slot delayed acknowledgment; newer replaces older.
    pending_ack: Option<Packet>,
    /// In-order packets since the last acknowledgment went out.
    ack_packet_count: u32,
    srtt: Option<Duration>,
    rttvar: Duration,
    /// Our measured one-way delay, echoed in outgoing packets.
    reply_delay_micros: u32,
    congestion: CongestionController,
    negotiated: NegotiatedExtensions,
    /// A congestion-experienced mark arrived; echo it on the next ACK.
    ecn_echo_pending: bool,
    stats: ConnectionStatistics,
    tasks: Vec<JoinHandle<()>>,
    close_reason: Option<CloseReason>,
}

/// One uTP connection over the shared socket.
///
/// The facade is single-consumer: one task reading and one task writing
/// at a time. The wake-up signals store a single permit, which is all a
/// byte stream with one reader and one writer needs.
pub struct Connection {
    remote_addr: SocketAddr,
    socket: Arc<BoundSocket>,
    registry: Weak<Registry>,
    config: crate::config::UtpConfig,
    inner: Mutex<Inner>,
    /// Signaled when reassembled data (or EOF) becomes available.
    readable: Notify,
    /// Signaled when send-window or unacked-packet budget frees up.
    writable: Notify,
    /// Signaled on handshake completion and on teardown.
    state_change: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        connection_id: u16,
        socket: Arc<BoundSocket>,
        registry: Weak<Registry>,
        config: crate::config::UtpConfig,
    ) -> Arc<Connection> {
        let congestion = CongestionController::new(config.max_window, config.max_rate, config.min_rate);

        Arc::new(Connection {
            remote_addr,
            socket,
            registry,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                connection_id,
                remote_connection_id: 0,
                seq_nr: 0,
                ack_nr: 0,
                expected_seq: 0,
                epoch: CurrentClock::now(),
                send_window: 0,
                send_buffer: BTreeMap::new(),
                bytes_in_flight: 0,
                out_of_order: BTreeMap::new(),
                reassembled: Vec::new(),
                eof: false,
                received_seqs: BTreeSet::new(),
                retransmitted: HashSet::new(),
                duplicate_acks: 0,
                last_ack_received: 0,
                pending_ack: None,
                ack_packet_count: 0,
                srtt: None,
                rttvar: Duration::ZERO,
                reply_delay_micros: 0,
                congestion,
                negotiated: NegotiatedExtensions::default(),
                ecn_echo_pending: false,
                stats: ConnectionStatistics::default(),
                tasks: Vec::new(),
                close_reason: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            state_change: Notify::new(),
        })
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn local_connection_id(&self) -> u16 {
        self.inner.lock().await.connection_id
    }

    pub async fn remote_connection_id(&self) -> u16 {
        self.inner.lock().await.remote_connection_id
    }

    pub async fn statistics(&self) -> ConnectionStatistics {
        self.inner.lock().await.stats.clone()
    }

    /// Initiates the handshake and waits for it to complete.
    ///
    /// # Errors
    ///
    /// Will return `Error::Timeout` if no SYN-ACK arrives within the
    /// configured deadline, or the close reason if the connection dies
    /// while waiting.
    pub(crate) async fn start_connect(self: &Arc<Self>) -> Result<(), Error> {
        let timeout = self.config.connect_timeout();

        {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::SynSent;
            inner.epoch = CurrentClock::now();

            let mut syn = Packet::new(PacketType::Syn, inner.connection_id);
            syn.wnd_size = self.config.recv_window;
            syn.extensions = self.advertised_extensions();

            inner.send_buffer.insert(
                0,
                InFlight {
                    packet: syn.clone(),
                    sent_at: CurrentClock::now(),
                    retries: 0,
                },
            );
            self.send_packet(&mut inner, syn).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state_change.notified();
            {
                let inner = self.inner.lock().await;
                match inner.state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed | ConnectionState::Reset => {
                        return Err(self.closed_error(&inner));
                    }
                    _ => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut inner = self.inner.lock().await;
                if inner.state == ConnectionState::Connected {
                    return Ok(());
                }
                warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, "connect timed out waiting for SYN-ACK");
                self.teardown(&mut inner, ConnectionState::Closed).await;
                return Err(Error::Timeout { after: timeout });
            }
        }
    }

    /// Extensions we announce in SYN and SYN-ACK packets: selective
    /// acknowledgment, window scaling (when the configured window needs
    /// it) and ECN.
    fn advertised_extensions(&self) -> Vec<Extension> {
        let mut advertised = vec![Extension::SelectiveAck { blocks: Vec::new() }];

        let shift = self.config.window_scale_shift();
        if shift > 0 {
            advertised.push(Extension::WindowScale { shift });
        }

        advertised.push(Extension::Ecn {
            echo: false,
            cwr: false,
        });
        advertised
    }

    /// Handles one inbound datagram addressed to this connection.
    ///
    /// `ecn_ce` marks that the IP layer delivered the datagram with a
    /// congestion-experienced mark.
    pub(crate) async fn handle_datagram(self: &Arc<Self>, data: &[u8], ecn_ce: bool) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, err = %e, "dropping invalid uTP packet");
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        inner.stats.packets_received += 1;
        inner.stats.bytes_received += data.len() as u64;

        // Our one-way delay sample for this packet; echoed back so the
        // peer can feed its own delay-based controller.
        let now_micros = wire_now(inner.epoch);
        inner.reply_delay_micros = now_micros.wrapping_sub(packet.timestamp_micros);

        if ecn_ce && inner.negotiated.ecn {
            inner.ecn_echo_pending = true;
            inner.congestion.on_congestion_event();
        }

        match packet.packet_type {
            PacketType::Syn => self.handle_syn(&mut inner, packet).await,
            PacketType::State => self.handle_state(&mut inner, packet).await,
            PacketType::Data => self.handle_data(&mut inner, packet).await,
            PacketType::Fin => self.handle_fin(&mut inner, &packet).await,
            PacketType::Reset => self.handle_reset(&mut inner).await,
        }
    }

    /// A SYN packet: either the SYN-ACK answering our SYN, or the
    /// opening packet of a passive connection.
    async fn handle_syn(self: &Arc<Self>, inner: &mut Inner, packet: Packet) {
        match inner.state {
            ConnectionState::SynSent => {
                // Only a SYN acknowledging our SYN (seq 0) completes the
                // handshake; anything else is a crossed dial.
                if packet.ack_nr != 0 {
                    warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, ack_nr = packet.ack_nr, "ignoring SYN that does not acknowledge ours");
                    return;
                }

                inner.remote_connection_id = packet.connection_id;
                self.negotiate_extensions(inner, &packet.extensions);
                inner.send_window = scale_window(packet.wnd_size, inner.negotiated.window_shift);
                inner.ack_nr = packet.seq_nr;
                inner.expected_seq = seq::next(packet.seq_nr);

                // Bind the peer's id in the demultiplexer so the rest of
                // the flow routes by exact (addr, id) lookup.
                if let Some(registry) = self.registry.upgrade() {
                    registry.bind_remote(self.remote_addr, packet.connection_id, self);
                }

                let mut ack = Packet::new(PacketType::State, inner.connection_id);
                ack.seq_nr = 1;
                ack.ack_nr = 1;
                ack.wnd_size = self.receive_window_to_advertise(inner);
                self.send_packet(inner, ack).await;

                self.complete_handshake(inner);
            }
            ConnectionState::Idle | ConnectionState::SynReceived => {
                // Passive side: answer with a SYN-ACK and wait for the
                // final ACK of the three-way handshake.
                inner.remote_connection_id = packet.connection_id;
                inner.ack_nr = packet.seq_nr;
                inner.expected_seq = seq::next(packet.seq_nr);
                self.negotiate_extensions(inner, &packet.extensions);
                inner.send_window = scale_window(packet.wnd_size, inner.negotiated.window_shift);

                let mut syn_ack = Packet::new(PacketType::Syn, inner.connection_id);
                syn_ack.ack_nr = packet.seq_nr;
                syn_ack.wnd_size = self.receive_window_to_advertise(inner);
                syn_ack.extensions = self.advertised_extensions();

                inner.send_buffer.insert(
                    0,
                    InFlight {
                        packet: syn_ack.clone(),
                        sent_at: CurrentClock::now(),
                        retries: 0,
                    },
                );
                self.send_packet(inner, syn_ack).await;

                if inner.state == ConnectionState::Idle {
                    inner.state = ConnectionState::SynReceived;
                }
            }
            other => {
                warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, state = %other, "ignoring SYN in unexpected state");
            }
        }
    }

    /// A State packet: pure acknowledgment, possibly with SACK and ECN
    /// extensions.
    async fn handle_state(self: &Arc<Self>, inner: &mut Inner, packet: Packet) {
        // The final ACK of a passive handshake. The active side numbers
        // it ack_nr 1 (its next data packet is seq 1); tolerate 0 for
        // peers that acknowledge the SYN-ACK's own sequence number.
        if inner.state == ConnectionState::SynReceived && matches!(packet.ack_nr, 0 | 1) {
            inner.send_buffer.remove(&0);
            self.complete_handshake(inner);
            return;
        }

        for extension in &packet.extensions {
            match extension {
                Extension::SelectiveAck { blocks } => {
                    if inner.negotiated.selective_ack {
                        Self::process_sack_blocks(inner, blocks);
                    }
                }
                Extension::Ecn { echo, cwr } => {
                    if inner.negotiated.ecn && *echo {
                        inner.congestion.on_congestion_event();
                    }
                    if *cwr {
                        // Informational: the peer already backed off.
                        debug!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, "peer reduced its congestion window");
                    }
                }
                Extension::WindowScale { .. } => {
                    // Window scaling is only meaningful during the handshake.
                }
            }
        }

        inner.send_window = scale_window(packet.wnd_size, inner.negotiated.window_shift);

        // Duplicate cumulative ACKs signal a hole at the peer.
        if packet.ack_nr == inner.last_ack_received {
            inner.duplicate_acks += 1;
            if inner.duplicate_acks >= FAST_RETRANSMIT_THRESHOLD {
                self.fast_retransmit(inner).await;
            }
        } else {
            inner.duplicate_acks = 0;
            inner.last_ack_received = packet.ack_nr;
        }

        Self::update_rtt(inner, &packet);

        let acked: Vec<u16> = inner
            .send_buffer
            .keys()
            .copied()
            .filter(|sequence| seq::is_acked(*sequence, packet.ack_nr))
            .collect();
        for sequence in &acked {
            if let Some(in_flight) = inner.send_buffer.remove(sequence) {
                inner.bytes_in_flight = inner.bytes_in_flight.saturating_sub(in_flight.packet.payload.len());
            }
        }
        // Acked packets free budget, and the advertised window may have
        // opened; either way a blocked sender gets another look.
        self.writable.notify_one();

        // The peer's reported one-way delay drives the LEDBAT window and
        // the secondary rate estimator.
        if packet.timestamp_difference_micros > 0 {
            let delay = conv::wire_micros_to_duration(packet.timestamp_difference_micros);
            let srtt = inner.srtt;
            inner.congestion.on_delay_sample(delay, srtt);
            inner.congestion.update_rate(delay, srtt, CurrentClock::now());
        }

        debug!(
            target: UTP_TRANSPORT_LOG_TARGET,
            remote_addr = %self.remote_addr,
            ack_nr = packet.ack_nr,
            acked = acked.len(),
            "processed state packet"
        );
    }

    /// A Data packet: reliability engine ingress.
    async fn handle_data(self: &Arc<Self>, inner: &mut Inner, packet: Packet) {
        if seq::is_newer(packet.seq_nr, inner.ack_nr) {
            inner.ack_nr = packet.seq_nr;
        }

        if inner.negotiated.selective_ack {
            inner.received_seqs.insert(packet.seq_nr);
        }

        let cumulative = inner.expected_seq.wrapping_sub(1);
        let duplicate = seq::is_acked(packet.seq_nr, cumulative);
        let in_order = packet.seq_nr == inner.expected_seq;

        if in_order {
            inner.reassembled.extend_from_slice(&packet.payload);
            inner.expected_seq = seq::next(inner.expected_seq);
            Self::drain_out_of_order(inner);
        } else if !duplicate {
            // A gap: park the payload until the hole fills.
            inner.out_of_order.entry(packet.seq_nr).or_insert(packet.payload);
            debug!(
                target: UTP_TRANSPORT_LOG_TARGET,
                remote_addr = %self.remote_addr,
                seq_nr = packet.seq_nr,
                expected = inner.expected_seq,
                "buffered out-of-order packet"
            );
        }

        // Out-of-order and duplicate arrivals are acknowledged at once so
        // the sender's SACK picture stays fresh; in-order traffic batches
        // under the two-packet rule.
        let immediate = if in_order {
            inner.ack_packet_count += 1;
            inner.ack_packet_count >= IMMEDIATE_ACK_EVERY
        } else {
            true
        };
        self.send_ack(inner, immediate).await;

        if !inner.reassembled.is_empty() {
            self.readable.notify_one();
        }
    }

    /// The peer closed its half of the stream.
    async fn handle_fin(self: &Arc<Self>, inner: &mut Inner, packet: &Packet) {
        if inner.state != ConnectionState::Connected {
            return;
        }

        inner.state = ConnectionState::FinReceived;
        if seq::is_newer(packet.seq_nr, inner.ack_nr) {
            inner.ack_nr = packet.seq_nr;
        }
        inner.eof = true;

        let mut fin_ack = Packet::new(PacketType::Fin, inner.connection_id);
        fin_ack.seq_nr = inner.seq_nr;
        fin_ack.ack_nr = inner.ack_nr;
        fin_ack.wnd_size = self.receive_window_to_advertise(inner);
        self.send_packet(inner, fin_ack).await;

        self.teardown(inner, ConnectionState::Closed).await;
    }

    /// The peer tore the connection down.
    async fn handle_reset(self: &Arc<Self>, inner: &mut Inner) {
        warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, "connection reset by peer");
        inner.close_reason = Some(CloseReason::Reset);
        self.teardown(inner, ConnectionState::Reset).await;
    }

    /// Transition into `Connected` and start the background tickers.
    fn complete_handshake(self: &Arc<Self>, inner: &mut Inner) {
        inner.state = ConnectionState::Connected;
        inner.seq_nr = 1;
        inner.send_buffer.remove(&0);

        let retransmitter = Arc::clone(self);
        inner.tasks.push(tokio::spawn(async move {
            retransmitter.retransmission_loop().await;
        }));

        let delayed_acker = Arc::clone(self);
        inner.tasks.push(tokio::spawn(async move {
            delayed_acker.delayed_ack_loop().await;
        }));

        self.state_change.notify_one();

        debug!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, connection_id = inner.connection_id, remote_connection_id = inner.remote_connection_id, "connection established");
    }

    fn negotiate_extensions(&self, inner: &mut Inner, peer_extensions: &[Extension]) {
        for extension in peer_extensions {
            match extension {
                Extension::SelectiveAck { .. } => inner.negotiated.selective_ack = true,
                Extension::WindowScale { shift } => {
                    let ours = self.config.window_scale_shift();
                    inner.negotiated.window_shift = extensions::negotiate_window_scale(ours, *shift);
                    inner.congestion.set_window_shift(inner.negotiated.window_shift);
                }
                Extension::Ecn { .. } => inner.negotiated.ecn = true,
            }
        }
    }

    /// Sends bytes over the connection, reliably and in order.
    ///
    /// Applies backpressure: the call suspends while the peer's window
    /// or the unacknowledged-packet budget is exhausted.
    ///
    /// # Errors
    ///
    /// Will return `Error::NotConnected` (or the terminal close reason)
    /// if the connection is not, or stops being, connected.
    pub async fn send(self: &Arc<Self>, data: &[u8]) -> Result<(), Error> {
        let payload_size = self.config.mtu.saturating_sub(HEADER_SIZE).max(1);

        for chunk in data.chunks(payload_size) {
            loop {
                let notified = self.writable.notified();
                {
                    let mut inner = self.inner.lock().await;
                    if inner.state != ConnectionState::Connected {
                        return Err(self.closed_error(&inner));
                    }
                    if self.can_send(&inner, chunk.len()) {
                        self.transmit_chunk(&mut inner, chunk).await;
                        break;
                    }
                }
                notified.await;
            }
        }

        Ok(())
    }

    fn can_send(&self, inner: &Inner, chunk_len: usize) -> bool {
        if inner.send_buffer.len() >= self.config.max_unacked_packets {
            return false;
        }
        let effective_window = inner.congestion.window().min(inner.send_window);
        inner.bytes_in_flight + chunk_len <= effective_window as usize
    }

    async fn transmit_chunk(&self, inner: &mut Inner, chunk: &[u8]) {
        // Data consumes the current sequence number; the first data
        // packet after the handshake goes out as seq 1.
        let sequence = inner.seq_nr;
        inner.seq_nr = seq::next(inner.seq_nr);

        let mut packet = Packet::new(PacketType::Data, inner.connection_id);
        packet.seq_nr = sequence;
        packet.ack_nr = inner.ack_nr;
        packet.wnd_size = self.receive_window_to_advertise(inner);
        packet.payload = chunk.to_vec();

        inner.send_buffer.insert(
            sequence,
            InFlight {
                packet: packet.clone(),
                sent_at: CurrentClock::now(),
                retries: 0,
            },
        );
        inner.bytes_in_flight += chunk.len();

        self.send_packet(inner, packet).await;
    }

    /// Receives up to `max_bytes` from the stream. Suspends while no
    /// bytes are available; a short (or empty) read only happens at EOF.
    ///
    /// # Errors
    ///
    /// Will return the terminal close reason if the connection died
    /// without delivering a FIN.
    pub async fn recv(self: &Arc<Self>, max_bytes: usize) -> Result<Vec<u8>, Error> {
        loop {
            let notified = self.readable.notified();
            {
                let mut inner = self.inner.lock().await;
                if !inner.reassembled.is_empty() {
                    let take = max_bytes.min(inner.reassembled.len());
                    let data: Vec<u8> = inner.reassembled.drain(..take).collect();
                    if !inner.reassembled.is_empty() {
                        self.readable.notify_one();
                    }
                    return Ok(data);
                }
                if inner.eof {
                    return Ok(Vec::new());
                }
                // Handshaking connections park here until data flows.
                match inner.state {
                    ConnectionState::Closed | ConnectionState::Reset => {
                        return Err(self.closed_error(&inner));
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Receives everything currently buffered, suspending only while the
    /// buffer is empty.
    ///
    /// # Errors
    ///
    /// Will return the terminal close reason if the connection died
    /// without delivering a FIN.
    pub async fn recv_all(self: &Arc<Self>) -> Result<Vec<u8>, Error> {
        self.recv(usize::MAX).await
    }

    /// Closes the connection gracefully. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;

        match inner.state {
            ConnectionState::Closed | ConnectionState::Reset | ConnectionState::Idle => return,
            ConnectionState::Connected => {
                let mut fin = Packet::new(PacketType::Fin, inner.connection_id);
                fin.seq_nr = inner.seq_nr;
                fin.ack_nr = inner.ack_nr;
                fin.wnd_size = self.receive_window_to_advertise(&inner);
                self.send_packet(&mut inner, fin).await;
                inner.state = ConnectionState::FinSent;
            }
            _ => {}
        }

        self.teardown(&mut inner, ConnectionState::Closed).await;
    }

    /// Final teardown: flush the delayed acknowledgment, stop the
    /// tickers, leave the demultiplexer and wake every waiter.
    async fn teardown(self: &Arc<Self>, inner: &mut Inner, final_state: ConnectionState) {
        if let Some(pending) = inner.pending_ack.take() {
            self.flush_ack(inner, pending).await;
        }

        inner.state = final_state;

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(
                self.remote_addr,
                inner.connection_id,
                inner.remote_connection_id,
            );
        }

        self.readable.notify_one();
        self.writable.notify_one();
        self.state_change.notify_one();

        // Aborting last: one of the aborted tasks may be the caller, and
        // an abort lands at its next await point.
        for task in inner.tasks.drain(..) {
            task.abort();
        }

        debug!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, state = %final_state, "connection torn down");
    }

    fn closed_error(&self, inner: &Inner) -> Error {
        match inner.close_reason {
            Some(CloseReason::Reset) => Error::Reset {
                addr: self.remote_addr,
            },
            Some(CloseReason::MaxRetransmits { seq, max }) => Error::MaxRetransmits { seq, max },
            None => Error::NotConnected { state: inner.state },
        }
    }

    /// Moves now-contiguous out-of-order packets into the reassembly
    /// buffer.
    fn drain_out_of_order(inner: &mut Inner) {
        while let Some(payload) = inner.out_of_order.remove(&inner.expected_seq) {
            inner.reassembled.extend_from_slice(&payload);
            inner.expected_seq = seq::next(inner.expected_seq);
        }
    }

    /// Emits (or schedules) an acknowledgment for the current receive
    /// state.
    async fn send_ack(&self, inner: &mut Inner, immediate: bool) {
        let ack = self.build_ack(inner);

        if immediate {
            inner.pending_ack = None;
            inner.ack_packet_count = 0;
            self.flush_ack(inner, ack).await;
        } else {
            // Single slot: only the newest acknowledgment state matters.
            inner.pending_ack = Some(ack);
        }
    }

    fn build_ack(&self, inner: &mut Inner) -> Packet {
        let mut ack = Packet::new(PacketType::State, inner.connection_id);
        ack.seq_nr = inner.seq_nr;
        ack.ack_nr = inner.expected_seq.wrapping_sub(1);
        ack.wnd_size = self.receive_window_to_advertise(inner);

        if inner.negotiated.selective_ack {
            let blocks = Self::synthesize_sack_blocks(inner);
            if !blocks.is_empty() {
                ack.extensions.push(Extension::SelectiveAck { blocks });
            }
        }

        ack
    }

    /// Sends an acknowledgment, attaching the ECN flags at the last
    /// moment. A queued acknowledgment can be replaced before it goes
    /// out, so consuming the one-shot flags any earlier would lose them.
    async fn flush_ack(&self, inner: &mut Inner, mut ack: Packet) {
        if inner.negotiated.ecn {
            let echo = std::mem::take(&mut inner.ecn_echo_pending);
            let cwr = inner.congestion.take_cwr();
            if echo || cwr {
                ack.extensions.push(Extension::Ecn { echo, cwr });
            }
        }
        self.send_packet(inner, ack).await;
    }

    /// The receive window to advertise, shifted down by the negotiated
    /// scale so the peer recovers the effective value.
    fn receive_window_to_advertise(&self, inner: &Inner) -> u32 {
        let available = self
            .config
            .recv_window
            .saturating_sub(u32::try_from(inner.reassembled.len()).unwrap_or(u32::MAX));
        available >> inner.negotiated.window_shift
    }

    /// Builds up to four SACK blocks from the received-set: maximal
    /// contiguous runs in ascending order, skipping runs the cumulative
    /// acknowledgment already covers. A run that touches the top of the
    /// sequence space is truncated at 0xFFFF because the exclusive end
    /// cannot express the wrap.
    fn synthesize_sack_blocks(inner: &mut Inner) -> Vec<SackBlock> {
        let cumulative = inner.expected_seq.wrapping_sub(1);

        if inner.received_seqs.len() > RECEIVED_SET_PRUNE_THRESHOLD {
            inner.received_seqs.retain(|sequence| !seq::is_acked(*sequence, cumulative));
        }

        let mut blocks: Vec<SackBlock> = Vec::new();
        let mut run: Option<(u16, u16)> = None; // (start, last), inclusive

        for &sequence in &inner.received_seqs {
            match run {
                Some((start, last)) if sequence == last.wrapping_add(1) && last != u16::MAX => {
                    run = Some((start, sequence));
                }
                Some(finished) => {
                    Self::push_sack_run(&mut blocks, finished, cumulative);
                    run = Some((sequence, sequence));
                }
                None => run = Some((sequence, sequence)),
            }
        }
        if let Some(finished) = run {
            Self::push_sack_run(&mut blocks, finished, cumulative);
        }

        blocks.truncate(extensions::MAX_SACK_BLOCKS);
        blocks
    }

    fn push_sack_run(blocks: &mut Vec<SackBlock>, (start, last): (u16, u16), cumulative: u16) {
        // Runs the cumulative ACK covers carry no extra information.
        if seq::is_acked(last, cumulative) {
            return;
        }
        // Truncate at the top of the sequence space; the block format
        // cannot express an exclusive end beyond 0xFFFF.
        let end = if last == u16::MAX { u16::MAX } else { last.wrapping_add(1) };
        if start < end {
            blocks.push(SackBlock { start, end });
        }
    }

    /// Removes individually acknowledged packets named by SACK blocks
    /// from the send buffer.
    fn process_sack_blocks(inner: &mut Inner, blocks: &[SackBlock]) {
        for block in blocks {
            let mut sequence = block.start;
            while sequence != block.end {
                if let Some(in_flight) = inner.send_buffer.remove(&sequence) {
                    inner.bytes_in_flight = inner.bytes_in_flight.saturating_sub(in_flight.packet.payload.len());
                    debug!(target: UTP_TRANSPORT_LOG_TARGET, seq_nr = sequence, "packet selectively acknowledged");
                }
                sequence = sequence.wrapping_add(1);
            }
        }
    }

    /// RTT estimation per RFC 6298, with Karn's rule: retransmitted
    /// packets never produce samples.
    fn update_rtt(inner: &mut Inner, packet: &Packet) {
        let acked_seq = packet.ack_nr;

        if inner.retransmitted.contains(&acked_seq) {
            debug!(target: UTP_TRANSPORT_LOG_TARGET, seq_nr = acked_seq, "skipping RTT sample for retransmitted packet");
            return;
        }

        let Some(in_flight) = inner.send_buffer.get(&acked_seq) else {
            return;
        };

        if packet.timestamp_difference_micros == 0 {
            return;
        }

        let measured = CurrentClock::elapsed_since(in_flight.sent_at) * 2;
        if measured.is_zero() {
            return;
        }

        match inner.srtt {
            Some(srtt) => {
                let deviation = if measured > srtt { measured - srtt } else { srtt - measured };
                inner.rttvar = inner.rttvar.mul_f64(1.0 - RTT_BETA) + deviation.mul_f64(RTT_BETA);
                inner.srtt = Some(srtt.mul_f64(1.0 - RTT_ALPHA) + measured.mul_f64(RTT_ALPHA));
            }
            None => {
                inner.srtt = Some(measured);
                inner.rttvar = measured / 2;
            }
        }
    }

    /// `clamp(SRTT + 4 RTTVAR, 100 ms, 60 s)`, with the conservative
    /// bootstrap before the first sample.
    fn retransmission_timeout(inner: &Inner) -> Duration {
        let rto = inner.srtt.map_or(RTO_MIN, |srtt| srtt + 4 * inner.rttvar);
        rto.clamp(RTO_MIN, RTO_MAX)
    }

    /// Retransmits the oldest unacknowledged packet after three
    /// duplicate acknowledgments.
    async fn fast_retransmit(&self, inner: &mut Inner) {
        let Some((&oldest, _)) = inner.send_buffer.iter().next() else {
            return;
        };

        inner.retransmitted.insert(oldest);
        let packet = inner.send_buffer.get(&oldest).map(|in_flight| in_flight.packet.clone());
        if let Some(packet) = packet {
            self.send_packet(inner, packet).await;
        }
        if let Some(in_flight) = inner.send_buffer.get_mut(&oldest) {
            in_flight.sent_at = CurrentClock::now();
            in_flight.retries += 1;
        }
        inner.stats.packets_retransmitted += 1;
        inner.duplicate_acks = 0;

        debug!(target: UTP_TRANSPORT_LOG_TARGET, seq_nr = oldest, "fast retransmit");
    }

    /// The retransmission ticker body. Returns `false` when the
    /// connection left `Connected` and the loop should stop.
    async fn check_retransmissions(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state != ConnectionState::Connected {
            return false;
        }

        let rto = Self::retransmission_timeout(&inner);
        let max_retransmits = self.config.max_retransmits;

        let mut exhausted: Option<u16> = None;
        let mut expired: Vec<u16> = Vec::new();
        for (&sequence, in_flight) in &inner.send_buffer {
            let backoff = rto.saturating_mul(1u32 << in_flight.retries.min(16));
            if CurrentClock::elapsed_since(in_flight.sent_at) > backoff {
                if in_flight.retries >= max_retransmits {
                    exhausted = Some(sequence);
                    break;
                }
                expired.push(sequence);
            }
        }

        if let Some(sequence) = exhausted {
            warn!(
                target: UTP_TRANSPORT_LOG_TARGET,
                remote_addr = %self.remote_addr,
                seq_nr = sequence,
                "packet exhausted its retransmission budget, failing the connection"
            );
            inner.close_reason = Some(CloseReason::MaxRetransmits {
                seq: sequence,
                max: max_retransmits,
            });
            self.teardown(&mut inner, ConnectionState::Closed).await;
            return false;
        }

        for sequence in expired {
            inner.retransmitted.insert(sequence);
            let packet = inner.send_buffer.get(&sequence).map(|in_flight| in_flight.packet.clone());
            if let Some(packet) = packet {
                self.send_packet(&mut inner, packet).await;
            }
            if let Some(in_flight) = inner.send_buffer.get_mut(&sequence) {
                in_flight.sent_at = CurrentClock::now();
                in_flight.retries += 1;
            }
            inner.stats.packets_retransmitted += 1;
        }

        true
    }

    async fn retransmission_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RETRANSMIT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.check_retransmissions().await {
                break;
            }
        }
    }

    /// Flushes the delayed-acknowledgment slot on a fixed cadence.
    async fn delayed_ack_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ack_delay());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Connected {
                if let Some(pending) = inner.pending_ack.take() {
                    self.flush_ack(&mut inner, pending).await;
                }
                break;
            }
            if let Some(pending) = inner.pending_ack.take() {
                inner.ack_packet_count = 0;
                self.flush_ack(&mut inner, pending).await;
            }
        }
    }

    /// Stamps and transmits one packet on the shared socket.
    async fn send_packet(&self, inner: &mut Inner, mut packet: Packet) {
        packet.timestamp_micros = wire_now(inner.epoch);
        packet.timestamp_difference_micros = inner.reply_delay_micros;

        match packet.encode() {
            Ok(bytes) => {
                // Losing a datagram here is the same as losing it on the
                // wire; the retransmission engine covers both.
                drop(self.socket.send_to(&bytes, self.remote_addr).await);
                inner.stats.packets_sent += 1;
                inner.stats.bytes_sent += bytes.len() as u64;
            }
            Err(e) => {
                warn!(target: UTP_TRANSPORT_LOG_TARGET, remote_addr = %self.remote_addr, err = %e, "failed to encode outgoing packet");
            }
        }
    }
}

/// Applies the negotiated scale shift to a wire window value.
fn scale_window(wire_window: u32, shift: u8) -> u32 {
    wire_window.checked_shl(u32::from(shift)).unwrap_or(u32::MAX)
}

/// Microseconds since the connection epoch, wrapped to the 32-bit wire
/// counter.
fn wire_now(epoch: MonotonicTimestamp) -> u32 {
    conv::timestamp_to_wire_micros(CurrentClock::elapsed_since(epoch))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use super::{Connection, ConnectionState, InFlight};
    use crate::config::UtpConfig;
    use crate::transport::utp::error::Error;
    use crate::transport::utp::extensions::{Extension, SackBlock};
    use crate::transport::utp::mux::BoundSocket;
    use crate::transport::utp::packet::{Packet, PacketType};

    const REMOTE_ID: u16 = 54321;
    const LOCAL_ID: u16 = 12345;

    async fn peer_and_connection(config: UtpConfig) -> (tokio::net::UdpSocket, Arc<Connection>) {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let socket = Arc::new(
            BoundSocket::new("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let connection = Connection::new(peer_addr, LOCAL_ID, socket, Weak::new(), config);
        (peer, connection)
    }

    /// A connection forced straight into `Connected`, bypassing the
    /// handshake, with the post-handshake sequence state.
    async fn connected(config: UtpConfig) -> (tokio::net::UdpSocket, Arc<Connection>) {
        let (peer, connection) = peer_and_connection(config).await;
        {
            let mut inner = connection.inner.lock().await;
            inner.state = ConnectionState::Connected;
            inner.remote_connection_id = REMOTE_ID;
            inner.seq_nr = 1;
            inner.expected_seq = 1;
            inner.send_window = 65_535;
        }
        (peer, connection)
    }

    fn data_packet(seq_nr: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Packet::new(PacketType::Data, REMOTE_ID);
        packet.seq_nr = seq_nr;
        packet.wnd_size = 65_535;
        packet.payload = payload.to_vec();
        packet.encode().unwrap()
    }

    fn state_packet(ack_nr: u16, wnd_size: u32) -> Vec<u8> {
        let mut packet = Packet::new(PacketType::State, REMOTE_ID);
        packet.ack_nr = ack_nr;
        packet.wnd_size = wnd_size;
        packet.timestamp_difference_micros = 1_000;
        packet.encode().unwrap()
    }

    async fn recv_packet(peer: &tokio::net::UdpSocket) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("the peer should receive a packet")
            .unwrap();
        Packet::decode(&buf[..len]).unwrap()
    }

    mod handshake {
        use super::*;

        #[tokio::test]
        async fn it_should_complete_the_active_handshake_on_a_syn_ack() {
            let (peer, connection) = peer_and_connection(UtpConfig::default()).await;
            connection.inner.lock().await.state = ConnectionState::SynSent;

            let mut syn_ack = Packet::new(PacketType::Syn, REMOTE_ID);
            syn_ack.wnd_size = 60_000;
            connection
                .handle_datagram(&syn_ack.encode().unwrap(), false)
                .await;

            assert_eq!(connection.state().await, ConnectionState::Connected);
            assert_eq!(connection.remote_connection_id().await, REMOTE_ID);

            let ack = recv_packet(&peer).await;
            assert_eq!(ack.packet_type, PacketType::State);
            assert_eq!(ack.seq_nr, 1);
            assert_eq!(ack.ack_nr, 1);

            {
                let inner = connection.inner.lock().await;
                assert_eq!(inner.send_window, 60_000);
                assert_eq!(inner.seq_nr, 1);
                assert_eq!(inner.expected_seq, 1);
            }

            connection.close().await;
        }

        #[tokio::test]
        async fn it_should_ignore_a_syn_that_does_not_acknowledge_ours() {
            let (_peer, connection) = peer_and_connection(UtpConfig::default()).await;
            connection.inner.lock().await.state = ConnectionState::SynSent;

            let mut crossed = Packet::new(PacketType::Syn, REMOTE_ID);
            crossed.ack_nr = 7;
            connection
                .handle_datagram(&crossed.encode().unwrap(), false)
                .await;

            assert_eq!(connection.state().await, ConnectionState::SynSent);
        }

        #[tokio::test]
        async fn it_should_answer_an_incoming_syn_with_a_syn_ack() {
            let (peer, connection) = peer_and_connection(UtpConfig::default()).await;

            let mut syn = Packet::new(PacketType::Syn, REMOTE_ID);
            syn.wnd_size = 32_768;
            syn.extensions = vec![Extension::SelectiveAck { blocks: Vec::new() }];
            connection.handle_datagram(&syn.encode().unwrap(), false).await;

            assert_eq!(connection.state().await, ConnectionState::SynReceived);

            let syn_ack = recv_packet(&peer).await;
            assert_eq!(syn_ack.packet_type, PacketType::Syn);
            assert_eq!(syn_ack.seq_nr, 0);
            assert_eq!(syn_ack.ack_nr, 0);
            assert_eq!(syn_ack.connection_id, LOCAL_ID);

            // The final ACK of the three-way handshake connects us.
            connection.handle_datagram(&state_packet(1, 65_535), false).await;
            assert_eq!(connection.state().await, ConnectionState::Connected);

            connection.close().await;
        }
    }

    mod reliability {
        use super::*;

        #[tokio::test]
        async fn it_should_fast_retransmit_after_three_duplicate_acks() {
            let (peer, connection) = connected(UtpConfig::default()).await;

            connection.send(b"payload one").await.unwrap();
            let first = recv_packet(&peer).await;
            assert_eq!(first.packet_type, PacketType::Data);
            assert_eq!(first.seq_nr, 1);

            for _ in 0..3 {
                connection
                    .handle_datagram(&state_packet(0, 65_535), false)
                    .await;
            }

            let retransmitted = recv_packet(&peer).await;
            assert_eq!(retransmitted.packet_type, PacketType::Data);
            assert_eq!(retransmitted.seq_nr, 1);
            assert_eq!(retransmitted.payload, b"payload one");

            let inner = connection.inner.lock().await;
            assert_eq!(inner.duplicate_acks, 0);
            assert_eq!(inner.stats.packets_retransmitted, 1);
            // Karn: the packet can no longer produce RTT samples.
            assert!(inner.retransmitted.contains(&1));
        }

        #[tokio::test]
        async fn it_should_reassemble_any_arrival_order_into_the_original_byte_stream() {
            let chunks: [&[u8]; 4] = [b"alpha ", b"beta ", b"gamma ", b"delta"];
            let orders = [
                [0usize, 1, 2, 3],
                [3, 2, 1, 0],
                [1, 0, 3, 2],
                [2, 3, 0, 1],
                [0, 2, 1, 3],
            ];

            for order in orders {
                let (_peer, connection) = connected(UtpConfig::default()).await;
                for &index in &order {
                    let seq_nr = 1 + u16::try_from(index).unwrap();
                    connection
                        .handle_datagram(&data_packet(seq_nr, chunks[index]), false)
                        .await;
                }

                let received = connection.recv(1024).await.unwrap();
                assert_eq!(received, b"alpha beta gamma delta", "order {order:?}");
            }
        }

        #[tokio::test]
        async fn it_should_tolerate_duplicate_deliveries_without_duplicating_bytes() {
            let (_peer, connection) = connected(UtpConfig::default()).await;

            connection.handle_datagram(&data_packet(1, b"once"), false).await;
            connection.handle_datagram(&data_packet(1, b"once"), false).await;
            connection.handle_datagram(&data_packet(2, b"twice"), false).await;

            let received = connection.recv(1024).await.unwrap();
            assert_eq!(received, b"oncetwice");
        }

        #[tokio::test]
        async fn it_should_track_gaps_in_the_received_set_and_announce_them_via_sack() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            {
                let mut inner = connection.inner.lock().await;
                inner.negotiated.selective_ack = true;
                inner.expected_seq = 100;
                inner.ack_nr = 99;
            }

            connection.handle_datagram(&data_packet(100, b"first"), false).await;
            connection.handle_datagram(&data_packet(102, b"third"), false).await;
            connection.handle_datagram(&data_packet(103, b"fourth"), false).await;

            let mut inner = connection.inner.lock().await;
            assert_eq!(inner.reassembled, b"first");
            assert_eq!(inner.expected_seq, 101);
            assert_eq!(
                inner.received_seqs.iter().copied().collect::<Vec<u16>>(),
                vec![100, 102, 103]
            );

            let blocks = Connection::synthesize_sack_blocks(&mut inner);
            assert_eq!(blocks, vec![SackBlock { start: 102, end: 104 }]);
        }

        #[tokio::test]
        async fn it_should_emit_at_most_four_sack_blocks_in_ascending_order() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            let mut inner = connection.inner.lock().await;
            inner.negotiated.selective_ack = true;
            inner.expected_seq = 10;
            // Six runs beyond the cumulative ack: 20, 30-31, 40, 50, 60, 70.
            for sequence in [20u16, 30, 31, 40, 50, 60, 70] {
                inner.received_seqs.insert(sequence);
            }

            let blocks = Connection::synthesize_sack_blocks(&mut inner);

            assert_eq!(
                blocks,
                vec![
                    SackBlock { start: 20, end: 21 },
                    SackBlock { start: 30, end: 32 },
                    SackBlock { start: 40, end: 41 },
                    SackBlock { start: 50, end: 51 },
                ]
            );
        }

        #[tokio::test]
        async fn it_should_truncate_a_sack_run_at_the_top_of_the_sequence_space() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            let mut inner = connection.inner.lock().await;
            inner.negotiated.selective_ack = true;
            inner.expected_seq = 0xFF00;
            inner.received_seqs.insert(0xFFFE);
            inner.received_seqs.insert(0xFFFF);

            let blocks = Connection::synthesize_sack_blocks(&mut inner);

            // The exclusive end cannot express the wrap; 0xFFFF is lost.
            assert_eq!(blocks, vec![SackBlock { start: 0xFFFE, end: 0xFFFF }]);
        }

        #[tokio::test]
        async fn it_should_remove_selectively_acknowledged_packets_from_the_send_buffer() {
            let (peer, connection) = connected(UtpConfig::default()).await;
            {
                let mut inner = connection.inner.lock().await;
                inner.negotiated.selective_ack = true;
            }

            connection.send(b"one").await.unwrap();
            connection.send(b"two").await.unwrap();
            connection.send(b"three").await.unwrap();
            for _ in 0..3 {
                recv_packet(&peer).await;
            }

            let mut sack = Packet::new(PacketType::State, REMOTE_ID);
            sack.ack_nr = 0;
            sack.wnd_size = 65_535;
            sack.extensions = vec![Extension::SelectiveAck {
                blocks: vec![SackBlock { start: 2, end: 4 }],
            }];
            connection.handle_datagram(&sack.encode().unwrap(), false).await;

            let inner = connection.inner.lock().await;
            let outstanding: Vec<u16> = inner.send_buffer.keys().copied().collect();
            assert_eq!(outstanding, vec![1]);
        }

        #[tokio::test]
        async fn it_should_apply_backpressure_until_the_peer_window_opens() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            connection.inner.lock().await.send_window = 0;

            let sender = Arc::clone(&connection);
            let send_future = sender.send(b"parked until the window opens");
            tokio::pin!(send_future);

            // Nothing can go out while the peer advertises zero.
            assert!(
                tokio::time::timeout(Duration::from_millis(100), send_future.as_mut())
                    .await
                    .is_err()
            );
            assert_eq!(connection.statistics().await.packets_sent, 0);

            connection
                .handle_datagram(&state_packet(0, 65_535), false)
                .await;

            tokio::time::timeout(Duration::from_secs(2), send_future)
                .await
                .expect("the opened window should release the sender")
                .unwrap();
            assert_eq!(connection.statistics().await.packets_sent, 1);
        }
    }

    mod rtt_estimation {
        use torrkit_clock::clock::stopped::Stopped as _;
        use torrkit_clock::clock::Stopped;

        use super::*;

        fn parked_packet(seq_nr: u16, sent_at: Duration) -> InFlight {
            let mut packet = Packet::new(PacketType::Data, LOCAL_ID);
            packet.seq_nr = seq_nr;
            packet.payload = b"x".to_vec();
            InFlight {
                packet,
                sent_at,
                retries: 0,
            }
        }

        #[tokio::test]
        async fn it_should_seed_the_estimator_from_the_first_sample() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            Stopped::local_set(&Duration::from_secs(1));
            {
                let mut inner = connection.inner.lock().await;
                inner.send_buffer.insert(3, parked_packet(3, Duration::from_millis(500)));
            }

            connection
                .handle_datagram(&state_packet(3, 65_535), false)
                .await;

            let inner = connection.inner.lock().await;
            // measured = 2 x (1000ms - 500ms)
            assert_eq!(inner.srtt, Some(Duration::from_secs(1)));
            assert_eq!(inner.rttvar, Duration::from_millis(500));
            Stopped::local_reset();
        }

        #[tokio::test]
        async fn it_should_not_take_rtt_samples_from_retransmitted_packets() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            Stopped::local_set(&Duration::from_secs(2));
            {
                let mut inner = connection.inner.lock().await;
                inner.srtt = Some(Duration::from_millis(500));
                inner.rttvar = Duration::from_millis(100);
                inner.retransmitted.insert(7);
                inner.send_buffer.insert(7, parked_packet(7, Duration::from_millis(100)));
            }

            connection
                .handle_datagram(&state_packet(7, 65_535), false)
                .await;

            let inner = connection.inner.lock().await;
            assert_eq!(inner.srtt, Some(Duration::from_millis(500)));
            assert_eq!(inner.rttvar, Duration::from_millis(100));
            Stopped::local_reset();
        }

        #[tokio::test]
        async fn it_should_clamp_the_retransmission_timeout_between_100ms_and_60s() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            let mut inner = connection.inner.lock().await;

            inner.srtt = None;
            assert_eq!(
                Connection::retransmission_timeout(&inner),
                Duration::from_millis(100)
            );

            inner.srtt = Some(Duration::from_millis(1));
            inner.rttvar = Duration::ZERO;
            assert_eq!(
                Connection::retransmission_timeout(&inner),
                Duration::from_millis(100)
            );

            inner.srtt = Some(Duration::from_secs(1));
            inner.rttvar = Duration::from_millis(250);
            assert_eq!(
                Connection::retransmission_timeout(&inner),
                Duration::from_secs(2)
            );

            inner.srtt = Some(Duration::from_secs(3600));
            assert_eq!(
                Connection::retransmission_timeout(&inner),
                Duration::from_secs(60)
            );
        }
    }

    mod extensions_and_congestion {
        use super::*;

        #[tokio::test]
        async fn it_should_negotiate_the_minimum_window_scale_and_apply_it() {
            // A 200 KB window needs a shift of 2 to fit the 16-bit field.
            let config = UtpConfig {
                max_window: 200_000,
                ..UtpConfig::default()
            };
            assert_eq!(config.window_scale_shift(), 2);

            let (_peer, connection) = peer_and_connection(config).await;
            connection.inner.lock().await.state = ConnectionState::SynSent;

            let mut syn_ack = Packet::new(PacketType::Syn, REMOTE_ID);
            syn_ack.wnd_size = 1_000;
            syn_ack.extensions = vec![Extension::WindowScale { shift: 3 }];
            connection
                .handle_datagram(&syn_ack.encode().unwrap(), false)
                .await;

            {
                let inner = connection.inner.lock().await;
                assert_eq!(inner.negotiated.window_shift, 2);
                assert_eq!(inner.send_window, 1_000 << 2);
            }

            // Subsequent window advertisements are scaled the same way.
            connection.handle_datagram(&state_packet(1, 2_000), false).await;
            assert_eq!(connection.inner.lock().await.send_window, 2_000 << 2);

            connection.close().await;
        }

        #[tokio::test]
        async fn it_should_shrink_the_window_on_an_ecn_echo_from_the_peer() {
            let (_peer, connection) = connected(UtpConfig::default()).await;
            connection.inner.lock().await.negotiated.ecn = true;
            let before = connection.inner.lock().await.congestion.window();

            let mut echo = Packet::new(PacketType::State, REMOTE_ID);
            echo.wnd_size = 65_535;
            echo.extensions = vec![Extension::Ecn {
                echo: true,
                cwr: false,
            }];
            connection.handle_datagram(&echo.encode().unwrap(), false).await;

            let inner = connection.inner.lock().await;
            assert!(inner.congestion.window() < before);
        }

        #[tokio::test]
        async fn it_should_echo_a_congestion_mark_back_to_the_sender() {
            let (peer, connection) = connected(UtpConfig::default()).await;
            connection.inner.lock().await.negotiated.ecn = true;

            // A marked datagram, then a second packet to force the
            // two-packet immediate acknowledgment.
            connection.handle_datagram(&data_packet(1, b"marked"), true).await;
            connection.handle_datagram(&data_packet(2, b"more"), false).await;

            let ack = recv_packet(&peer).await;
            assert_eq!(ack.packet_type, PacketType::State);
            assert!(ack
                .extensions
                .iter()
                .any(|extension| matches!(extension, Extension::Ecn { echo: true, cwr: true })));
        }
    }

    mod stream_facade {
        use super::*;

        #[tokio::test]
        async fn it_should_fail_sends_on_a_connection_that_is_not_connected() {
            let (_peer, connection) = peer_and_connection(UtpConfig::default()).await;

            let result = connection.send(b"never").await;

            assert!(matches!(result.unwrap_err(), Error::NotConnected { .. }));
        }

        #[tokio::test]
        async fn it_should_chunk_large_writes_at_the_mtu() {
            let config = UtpConfig {
                mtu: 120,
                ..UtpConfig::default()
            };
            let (peer, connection) = connected(config).await;

            // 250 bytes over a 100-byte payload budget: three packets.
            let data = vec![0xABu8; 250];
            connection.send(&data).await.unwrap();

            let mut total = Vec::new();
            for expected_seq in 1..=3u16 {
                let packet = recv_packet(&peer).await;
                assert_eq!(packet.seq_nr, expected_seq);
                total.extend_from_slice(&packet.payload);
            }
            assert_eq!(total, data);
        }

        #[tokio::test]
        async fn it_should_deliver_eof_after_the_peer_fin() {
            let (peer, connection) = connected(UtpConfig::default()).await;

            connection.handle_datagram(&data_packet(1, b"tail"), false).await;
            let mut fin = Packet::new(PacketType::Fin, REMOTE_ID);
            fin.seq_nr = 2;
            connection.handle_datagram(&fin.encode().unwrap(), false).await;

            // Buffered bytes drain first, then the stream ends.
            assert_eq!(connection.recv(1024).await.unwrap(), b"tail");
            assert_eq!(connection.recv(1024).await.unwrap(), b"");
            assert_eq!(connection.state().await, ConnectionState::Closed);

            // The peer got an acknowledgment for its FIN.
            loop {
                let packet = recv_packet(&peer).await;
                if packet.packet_type == PacketType::Fin {
                    break;
                }
            }
        }

        #[tokio::test]
        async fn it_should_surface_a_peer_reset_to_pending_operations() {
            let (_peer, connection) = connected(UtpConfig::default()).await;

            let reset = Packet::new(PacketType::Reset, REMOTE_ID);
            connection.handle_datagram(&reset.encode().unwrap(), false).await;

            assert!(matches!(
                connection.send(b"late").await.unwrap_err(),
                Error::Reset { .. }
            ));
            assert!(matches!(
                connection.recv(16).await.unwrap_err(),
                Error::Reset { .. }
            ));
        }

        #[tokio::test]
        async fn it_should_be_idempotent_to_close() {
            let (peer, connection) = connected(UtpConfig::default()).await;

            connection.close().await;
            connection.close().await;

            assert_eq!(connection.state().await, ConnectionState::Closed);

            // Exactly one FIN went out.
            let fin = recv_packet(&peer).await;
            assert_eq!(fin.packet_type, PacketType::Fin);
            let mut buf = [0u8; 64];
            assert!(
                tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf))
                    .await
                    .is_err()
            );
        }

        #[tokio::test]
        async fn it_should_return_partial_reads_up_to_the_requested_length() {
            let (_peer, connection) = connected(UtpConfig::default()).await;

            connection
                .handle_datagram(&data_packet(1, b"abcdefgh"), false)
                .await;

            assert_eq!(connection.recv(3).await.unwrap(), b"abc");
            assert_eq!(connection.recv_all().await.unwrap(), b"defgh");
        }
    }
}
