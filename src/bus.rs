//! The bus core: socket I/O, outbound sequencing, NAK/retransmit servicing
//! and dispatch to subscriptions.
//!
//! A single receive task owns all per-peer state and drives packet intake,
//! tracker updates and user dispatch in order; its `select!` also services
//! the timer tick for NAK emission, loss deadlines and peer GC. A separate
//! task drives sender heartbeats. The publish path may be called from any
//! task and synchronizes only on the send-side sequence counter and
//! retransmit ring.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::cipher::{Cleartext, MessageCipher, PayloadCipher};
use crate::config::BusConfig;
use crate::dispatcher::{Delivery, Dispatcher, Loss, MessageHandler, SubscriptionId};
use crate::error::{BusError, BusResult};
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::packet::{Packet, PacketBody, PacketHeader, FLAG_ENCRYPTED, FLAG_UNRECOVERABLE, HEADER_LEN};
use crate::peer_tracker::{HeldData, PeerTracker, TrackerOutput, FIRST_SEQ};
use crate::retransmit::RetransmitRing;
use crate::send_pipeline::SendPipeline;
use crate::seq::{Seq, SeqRange};
use crate::topic;

/// A bus endpoint: one joined multicast group, one outbound sequence space.
///
/// Dropping the bus aborts its tasks; [`Bus::close`] additionally leaves the
/// multicast group and makes subsequent operations fail with
/// [`BusError::Closed`].
pub struct Bus {
    shared: Arc<BusShared>,
}

struct BusShared {
    config: Arc<BusConfig>,
    peer_id: u32,
    session_id: u16,
    group: SocketAddr,
    recv_socket: Option<Arc<UdpSocket>>,
    send_pipeline: Arc<SendPipeline>,
    cipher: Arc<dyn PayloadCipher>,
    dispatcher: Dispatcher,
    send_state: tokio::sync::Mutex<SendState>,
    nak_request_id: AtomicU32,
    metrics: Arc<BusMetrics>,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct SendState {
    next_seq: Seq,
    /// only meaningful while `published_since_heartbeat` is set
    last_assigned: Seq,
    published_since_heartbeat: bool,
    ring: RetransmitRing,
}

impl Bus {
    /// Join the multicast group, bind the sockets and start the receive and
    /// heartbeat tasks.
    pub async fn open(config: BusConfig) -> BusResult<Bus> {
        config.validate()?;
        let config = Arc::new(config);

        let recv_socket = Arc::new(UdpSocket::bind((config.bind_addr, config.group_port)).await?);
        recv_socket.join_multicast_v4(config.group_addr, config.bind_addr)?;

        let send_socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        send_socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        send_socket.set_multicast_loop_v4(config.multicast_loop)?;

        let cipher: Arc<dyn PayloadCipher> = match &config.cipher_key {
            Some(key) => {
                info!("payload encryption enabled");
                Arc::new(MessageCipher::new(key)?)
            }
            None => {
                debug!("no cipher key configured - payloads are sent in cleartext");
                Arc::new(Cleartext)
            }
        };

        let mut rng = rand::thread_rng();
        let peer_id: u32 = rng.gen();
        let session_id: u16 = rng.gen();
        info!(
            "joined multicast group {}:{} as peer {:08x} session {:04x}",
            config.group_addr, config.group_port, peer_id, session_id
        );

        let metrics = Arc::new(BusMetrics::default());
        let shared = Arc::new(BusShared {
            group: SocketAddr::from((config.group_addr, config.group_port)),
            peer_id,
            session_id,
            recv_socket: Some(recv_socket.clone()),
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(send_socket), metrics.clone())),
            cipher,
            dispatcher: Dispatcher::new(metrics.clone()),
            send_state: tokio::sync::Mutex::new(SendState {
                next_seq: FIRST_SEQ,
                last_assigned: FIRST_SEQ,
                published_since_heartbeat: false,
                ring: RetransmitRing::new(config.retransmit_ring_size),
            }),
            nak_request_id: AtomicU32::new(1),
            metrics,
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            config,
        });

        let recv_handle = tokio::spawn(recv_loop(shared.clone(), recv_socket));
        let heartbeat_handle = tokio::spawn(heartbeat_loop(shared.clone()));
        shared.tasks.lock().expect("task list lock poisoned")
            .extend([recv_handle, heartbeat_handle]);

        Ok(Bus { shared })
    }

    /// Publish a payload to a concrete topic. Returns the assigned sequence
    /// number. A socket-level send failure is absorbed: the packet is
    /// retained in the retransmit ring and recovered via NAK.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> BusResult<Seq> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        topic::require_concrete(topic)?;

        let mut flags = 0u16;
        let wire_payload = if self.shared.cipher.is_active() {
            flags |= FLAG_ENCRYPTED;
            self.shared.cipher.encrypt(payload)
        }
        else {
            payload.to_vec()
        };

        let packet_len = HEADER_LEN + 2 + topic.len() + 4 + wire_payload.len();
        if packet_len > self.shared.config.max_packet_bytes {
            return Err(BusError::PayloadTooLarge(payload.len()));
        }

        // the lock is held across the send so packets leave in sequence order
        let mut state = self.shared.send_state.lock().await;
        let sequence = state.next_seq;
        state.next_seq = sequence.next();
        state.last_assigned = sequence;
        state.published_since_heartbeat = true;

        let packet = Packet {
            header: PacketHeader {
                peer_id: self.shared.peer_id,
                session_id: self.shared.session_id,
                sequence,
                flags,
            },
            body: PacketBody::Data { topic: topic.to_owned(), payload: wire_payload },
        };
        let bytes = packet.to_bytes();
        state.ring.insert(sequence, bytes.clone());

        trace!("publishing #{} to {:?} ({} bytes)", sequence, topic, bytes.len());
        self.shared.send_pipeline.send(self.shared.group, &bytes).await;
        Ok(sequence)
    }

    /// Compile `pattern` and register `handler` for matching deliveries.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> BusResult<SubscriptionId> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.shared.dispatcher.subscribe(pattern, handler)
    }

    /// Remove a subscription. A dispatch already in flight may still fire.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop the receive and heartbeat tasks and leave the group. Idempotent;
    /// pending deliveries are dropped.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing bus");
        for handle in self.shared.tasks.lock().expect("task list lock poisoned").drain(..) {
            handle.abort();
        }
        if let Some(socket) = &self.shared.recv_socket {
            if let Err(e) = socket.leave_multicast_v4(self.shared.config.group_addr, self.shared.config.bind_addr) {
                debug!("error leaving multicast group: {}", e);
            }
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        for handle in self.shared.tasks.lock().expect("task list lock poisoned").drain(..) {
            handle.abort();
        }
    }
}

async fn recv_loop(shared: Arc<BusShared>, socket: Arc<UdpSocket>) {
    info!("starting receive loop");

    let mut context = ReceiveContext::new(shared.clone());
    let mut tick = interval(shared.config.timer_tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; shared.config.max_packet_bytes];

    loop {
        select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        let correlation_id = Uuid::new_v4();
                        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                        context.on_datagram(from, &buf[..len], Instant::now())
                            .instrument(span)
                            .await;
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
            _ = tick.tick() => {
                context.on_tick(Instant::now()).await;
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<BusShared>) {
    let mut tick = interval(shared.config.heartbeat_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        maybe_send_heartbeat(&shared).await;
    }
}

/// Announce the highest assigned sequence, but only when DATA has been
/// published since the previous heartbeat.
async fn maybe_send_heartbeat(shared: &Arc<BusShared>) {
    let highest = {
        let mut state = shared.send_state.lock().await;
        if !state.published_since_heartbeat {
            return;
        }
        state.published_since_heartbeat = false;
        state.last_assigned
    };

    let packet = Packet {
        header: PacketHeader {
            peer_id: shared.peer_id,
            session_id: shared.session_id,
            sequence: highest,
            flags: 0,
        },
        body: PacketBody::Heartbeat,
    };
    trace!("sending heartbeat with highest assigned #{}", highest);
    shared.send_pipeline.send(shared.group, &packet.to_bytes()).await;
}

/// Receive-side protocol logic, separated from socket intake so the
/// scenarios can be driven packet by packet in tests. Owned exclusively by
/// the receive task; the tracker map needs no lock.
struct ReceiveContext {
    shared: Arc<BusShared>,
    trackers: FxHashMap<(u32, u16), PeerTracker>,
}

impl ReceiveContext {
    fn new(shared: Arc<BusShared>) -> ReceiveContext {
        ReceiveContext {
            shared,
            trackers: FxHashMap::default(),
        }
    }

    async fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        let packet = match Packet::deser(&mut &datagram[..]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping undecodable datagram from {:?}: {}", from, e);
                BusMetrics::bump(&self.shared.metrics.malformed_packets);
                return;
            }
        };

        // own multicast loopback
        if packet.header.peer_id == self.shared.peer_id
            && packet.header.session_id == self.shared.session_id
        {
            return;
        }

        let encrypted = packet.is_encrypted();
        let unrecoverable = packet.is_unrecoverable();
        let header = packet.header;

        match packet.body {
            PacketBody::Data { topic, payload } => {
                let key = (header.peer_id, header.session_id);
                let data = HeldData { topic, payload, encrypted };
                let tracker = self.tracker(key, from, now);
                let output = tracker.on_data(header.sequence, data, from, now);
                let addr = tracker.addr;
                self.process_output(key, addr, output).await;
            }
            PacketBody::Heartbeat => {
                let key = (header.peer_id, header.session_id);
                let tracker = self.tracker(key, from, now);
                let output = tracker.on_heartbeat(header.sequence, from, now);
                let addr = tracker.addr;
                self.process_output(key, addr, output).await;
            }
            PacketBody::Nak { target_peer_id, target_session_id, ranges } => {
                if unrecoverable {
                    // a sender's reply to one of our NAKs: the ranges are gone
                    let key = (target_peer_id, target_session_id);
                    if let Some(tracker) = self.trackers.get_mut(&key) {
                        let output = tracker.on_unrecoverable(&ranges, now);
                        let addr = tracker.addr;
                        self.process_output(key, addr, output).await;
                    }
                }
                else if target_peer_id == self.shared.peer_id
                    && target_session_id == self.shared.session_id
                {
                    self.serve_retransmits(from, &ranges).await;
                }
            }
        }
    }

    fn tracker(&mut self, key: (u32, u16), from: SocketAddr, now: Instant) -> &mut PeerTracker {
        let shared = &self.shared;
        self.trackers.entry(key).or_insert_with(|| {
            debug!("first contact with peer {:08x} session {:04x} at {:?}", key.0, key.1, from);
            PeerTracker::new(shared.config.clone(), from, now)
        })
    }

    /// Timer tick: per-peer NAK emission and loss deadlines, then GC of
    /// idle peers.
    async fn on_tick(&mut self, now: Instant) {
        let keys: Vec<(u32, u16)> = self.trackers.keys().copied().collect();
        for key in keys {
            let Some(tracker) = self.trackers.get_mut(&key) else { continue };
            let output = tracker.poll(now);
            let addr = tracker.addr;
            self.process_output(key, addr, output).await;
        }

        self.trackers.retain(|key, tracker| {
            if tracker.is_idle(now) {
                debug!("reclaiming state of idle peer {:08x} session {:04x}", key.0, key.1);
                false
            }
            else {
                true
            }
        });
    }

    /// Act on a tracker's verdict: announce losses first, then dispatch
    /// deliveries in sequence order, then request retransmits.
    async fn process_output(&self, key: (u32, u16), addr: SocketAddr, output: TrackerOutput) {
        if output.duplicate {
            BusMetrics::bump(&self.shared.metrics.duplicate_packets);
        }

        if let Some(ranges) = output.lost {
            warn!("declaring sequences {:?} from peer {:08x} permanently lost", ranges, key.0);
            self.shared.dispatcher.dispatch_loss(Loss {
                peer_id: key.0,
                session_id: key.1,
                ranges,
            }).await;
        }

        for deliverable in output.deliveries {
            let payload = if deliverable.data.encrypted {
                if !self.shared.cipher.is_active() {
                    warn!("dropping encrypted payload from peer {:08x}: no cipher key configured", key.0);
                    BusMetrics::bump(&self.shared.metrics.decrypt_failures);
                    continue;
                }
                match self.shared.cipher.decrypt(&deliverable.data.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("dropping undecryptable payload from peer {:08x}: {}", key.0, e);
                        BusMetrics::bump(&self.shared.metrics.decrypt_failures);
                        continue;
                    }
                }
            }
            else {
                deliverable.data.payload
            };

            self.shared.dispatcher.dispatch(Delivery {
                topic: deliverable.data.topic,
                payload,
                peer_id: key.0,
                session_id: key.1,
                sequence: deliverable.sequence,
            }).await;
        }

        if !output.nak_ranges.is_empty() {
            self.send_naks(key, addr, &output.nak_ranges).await;
        }
    }

    /// Request retransmission, unicast to the publisher. Splits the range
    /// list so every NAK fits a single packet.
    async fn send_naks(&self, target: (u32, u16), to: SocketAddr, ranges: &[SeqRange]) {
        let max_ranges = ((self.shared.config.max_packet_bytes - HEADER_LEN - 8) / 8).max(1);
        for chunk in ranges.chunks(max_ranges) {
            let packet = Packet {
                header: PacketHeader {
                    peer_id: self.shared.peer_id,
                    session_id: self.shared.session_id,
                    sequence: Seq::from_raw(self.shared.nak_request_id.fetch_add(1, Ordering::Relaxed)),
                    flags: 0,
                },
                body: PacketBody::Nak {
                    target_peer_id: target.0,
                    target_session_id: target.1,
                    ranges: chunk.to_vec(),
                },
            };
            trace!("requesting retransmit of {:?} from {:?}", chunk, to);
            self.shared.send_pipeline.send(to, &packet.to_bytes()).await;
            BusMetrics::bump(&self.shared.metrics.naks_sent);
        }
    }

    /// We are the publisher a NAK asks about: resend the exact original
    /// bytes, unicast back to the requester. Sequences no longer in the ring
    /// are answered with an unrecoverable echo so the requester stops asking.
    async fn serve_retransmits(&self, to: SocketAddr, ranges: &[SeqRange]) {
        let mut unrecoverable: Vec<SeqRange> = Vec::new();

        let state = self.shared.send_state.lock().await;
        for range in ranges {
            // a range wider than the ring cannot have more hits than the ring
            let count = range.len().min(state.ring.capacity() as u32);
            for offset in 0..count {
                let sequence = Seq::from_raw(range.from.to_raw().wrapping_add(offset));
                if let Some(bytes) = state.ring.get(sequence) {
                    trace!("retransmitting #{} to {:?}", sequence, to);
                    self.shared.send_pipeline.send(to, bytes).await;
                    BusMetrics::bump(&self.shared.metrics.retransmits_served);
                }
                else {
                    push_coalesced(&mut unrecoverable, sequence);
                }
            }
        }
        drop(state);

        if !unrecoverable.is_empty() {
            debug!("answering NAK from {:?} with unrecoverable ranges {:?}", to, unrecoverable);
            let packet = Packet {
                header: PacketHeader {
                    peer_id: self.shared.peer_id,
                    session_id: self.shared.session_id,
                    sequence: Seq::from_raw(self.shared.nak_request_id.fetch_add(1, Ordering::Relaxed)),
                    flags: FLAG_UNRECOVERABLE,
                },
                body: PacketBody::Nak {
                    target_peer_id: self.shared.peer_id,
                    target_session_id: self.shared.session_id,
                    ranges: unrecoverable,
                },
            };
            self.shared.send_pipeline.send(to, &packet.to_bytes()).await;
        }
    }
}

fn push_coalesced(ranges: &mut Vec<SeqRange>, sequence: Seq) {
    if let Some(last) = ranges.last_mut() {
        if sequence.diff(last.to) == 1 {
            last.to = sequence;
            return;
        }
    }
    ranges.push(SeqRange::single(sequence));
}
