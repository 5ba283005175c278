//! # Gossip Engine
//!
//! The engine binds the membership and dissemination machinery together:
//! authenticated heartbeats, the multi-hop relay fabric with duplicate
//! suppression, liveness eviction, and chat propagation riding the same
//! fabric.
//!
//! ## Actor Model
//!
//! All shared state (peer table, relay filter, rate limits, diagnostics)
//! is owned by a private actor task; the public [`Engine`] handle is cheap
//! to clone and communicates via an async command channel. The actor is
//! driven by `tokio::select!` over three sources:
//!
//! | Source | Work |
//! |--------|------|
//! | command channel | registration, chat submission, queries, shutdown |
//! | inbound channel | decoded frames and close events from socket readers |
//! | heartbeat ticker | self-heartbeat broadcast, eviction sweep, filter rotation |
//!
//! At any instant at most one routine mutates engine state; socket I/O runs
//! on independent reader/writer tasks per connection. Writes to a peer go
//! through a bounded queue with drop-on-full, so a slow peer can never
//! stall the engine loop.
//!
//! ## Relay Policy
//!
//! Every relay decision excludes the socket the message arrived on, and the
//! dedup filter is marked BEFORE transmission so an in-flight echo cannot
//! re-arm it. A message whose `hops` field exceeds the budget is dropped
//! outright; one at the budget is processed but not forwarded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::dedup::{RelayFilter, RelayMark};
use crate::diagnostics::Diagnostics;
use crate::events::{ChatEvent, EngineEvent, EventBus, MembershipUpdate, PeerSummary};
use crate::identity::{now_ms, verify_signature, Keypair, NodeId, PowProof};
use crate::limiter::{ChatRateLimiter, SlidingWindow};
use crate::peers::{AdmitOutcome, PeerTable};
use crate::wire::{
    chat_content_id, chat_signing_payload, heartbeat_signing_payload, leave_signing_payload,
    read_frame, Chat, ChatScope, FrameRead, Heartbeat, Leave, SigBytes, WireMessage,
    MAX_CHAT_CONTENT_CHARS,
};

/// Derive the 32-byte overlay topic for a topic name.
pub fn topic_hash(name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

/// Identifier for one peer socket within this engine.
type ConnId = u64;

/// Structured rejection for locally submitted chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRejection {
    /// Content empty after trimming, or longer than 140 characters.
    InvalidContent,
    /// Scope string did not parse (surface for callers parsing user input).
    InvalidScope,
    /// Chat is disabled by configuration.
    Disabled,
    /// The local submission window is exhausted.
    RateLimited,
}

impl std::fmt::Display for ChatRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRejection::InvalidContent => write!(f, "invalid content"),
            ChatRejection::InvalidScope => write!(f, "invalid scope"),
            ChatRejection::Disabled => write!(f, "chat is disabled"),
            ChatRejection::RateLimited => write!(f, "rate limit exceeded"),
        }
    }
}

impl std::error::Error for ChatRejection {}

// ============================================================================
// Channel plumbing
// ============================================================================

/// Events from socket reader tasks into the actor.
enum Inbound {
    Frame(ConnId, Vec<u8>),
    Oversized(ConnId),
    Closed(ConnId),
}

/// Commands from the handle into the actor.
enum Command {
    Register {
        outbound: mpsc::Sender<Vec<u8>>,
        remote_ip: Option<IpAddr>,
        reply: oneshot::Sender<ConnId>,
    },
    SubmitChat {
        content: String,
        scope: ChatScope,
        target: Option<NodeId>,
        reply: oneshot::Sender<Result<(), ChatRejection>>,
    },
    Subscribe(oneshot::Sender<broadcast::Receiver<EngineEvent>>),
    Membership(oneshot::Sender<MembershipUpdate>),
    Diagnostics(oneshot::Sender<Diagnostics>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// Engine handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    in_tx: mpsc::Sender<Inbound>,
    local_id: NodeId,
    max_message_size: usize,
    outbound_queue: usize,
}

impl Engine {
    /// Spawn the engine actor.
    ///
    /// The keypair's PoW proof must be valid for the configured difficulty,
    /// otherwise every conforming node rejects this engine's heartbeats.
    pub fn spawn(keypair: Keypair, pow: PowProof, config: EngineConfig) -> Engine {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(1024);
        let local_id = keypair.node_id();
        let max_message_size = config.max_message_size;
        let outbound_queue = config.outbound_queue;

        let actor = EngineActor::new(keypair, pow, config, in_tx.clone());
        tokio::spawn(actor.run(cmd_rx, in_rx));

        Engine {
            cmd_tx,
            in_tx,
            local_id,
            max_message_size,
            outbound_queue,
        }
    }

    /// The local node's identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Attach a peer socket delivered by the overlay.
    ///
    /// Sends the hello heartbeat, then services the connection on dedicated
    /// reader/writer tasks until it closes or errors. `remote_ip` is the
    /// observed remote address, recorded as a peer's direct link on 0-hop
    /// deliveries.
    pub async fn add_connection<S>(&self, stream: S, remote_ip: Option<IpAddr>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(self.outbound_queue);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                outbound: out_tx,
                remote_ip,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        let conn_id = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;

        tokio::spawn(run_writer(out_rx, write_half));
        tokio::spawn(run_reader(
            BufReader::new(read_half),
            conn_id,
            self.in_tx.clone(),
            self.max_message_size,
        ));
        Ok(())
    }

    /// Submit a locally authored chat message.
    pub async fn submit_chat(
        &self,
        content: &str,
        scope: ChatScope,
        target: Option<NodeId>,
    ) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SubmitChat {
                content: content.to_string(),
                scope,
                target,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?
            .map_err(Into::into)
    }

    /// Subscribe to membership, chat, and system events.
    pub async fn subscribe(&self) -> anyhow::Result<broadcast::Receiver<EngineEvent>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Current membership snapshot.
    pub async fn membership(&self) -> anyhow::Result<MembershipUpdate> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Membership(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Current diagnostics counters.
    pub async fn diagnostics(&self) -> anyhow::Result<Diagnostics> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Diagnostics(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Broadcast a signed LEAVE, wait out the grace period, and stop the
    /// actor. Best-effort; no acknowledgements.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Socket tasks
// ============================================================================

async fn run_writer<W>(mut out_rx: mpsc::Receiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = out_rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader<R>(
    mut reader: BufReader<R>,
    conn_id: ConnId,
    in_tx: mpsc::Sender<Inbound>,
    max_len: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, max_len).await {
            Ok(FrameRead::Frame(line)) => {
                if in_tx.send(Inbound::Frame(conn_id, line)).await.is_err() {
                    break;
                }
            }
            Ok(FrameRead::Oversized) => {
                if in_tx.send(Inbound::Oversized(conn_id)).await.is_err() {
                    break;
                }
            }
            Ok(FrameRead::Eof) | Err(_) => {
                let _ = in_tx.send(Inbound::Closed(conn_id)).await;
                break;
            }
        }
    }
}

// ============================================================================
// Engine actor (owns state)
// ============================================================================

struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
    /// Bound on the first 0-hop heartbeat received on this socket.
    peer_id: Option<NodeId>,
    remote_ip: Option<IpAddr>,
}

struct EngineActor {
    keypair: Keypair,
    local_id: NodeId,
    pow: PowProof,
    config: EngineConfig,
    seq: u64,
    peers: PeerTable,
    relay_filter: RelayFilter,
    chat_limiter: ChatRateLimiter,
    local_window: SlidingWindow,
    diagnostics: Diagnostics,
    events: EventBus,
    conns: HashMap<ConnId, Connection>,
    next_conn_id: ConnId,
    // Held so the inbound channel never closes while the actor runs.
    _in_tx: mpsc::Sender<Inbound>,
}

impl EngineActor {
    fn new(
        keypair: Keypair,
        pow: PowProof,
        config: EngineConfig,
        in_tx: mpsc::Sender<Inbound>,
    ) -> Self {
        let now = Instant::now();
        let local_id = keypair.node_id();
        Self {
            keypair,
            local_id,
            pow,
            seq: 0,
            peers: PeerTable::new(local_id, config.max_peers, now),
            relay_filter: RelayFilter::new(config.rotation_interval, now),
            chat_limiter: ChatRateLimiter::new(config.chat_window, config.chat_max),
            local_window: SlidingWindow::new(now),
            diagnostics: Diagnostics::default(),
            events: EventBus::new(config.event_capacity),
            conns: HashMap::new(),
            next_conn_id: 0,
            config,
            _in_tx: in_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut in_rx: mpsc::Receiver<Inbound>,
    ) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        info!(id = %self.local_id.short(), "engine started");
        self.events.publish(EngineEvent::System {
            content: "joined the mesh".to_string(),
            timestamp: now_ms(),
        });

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Register { outbound, remote_ip, reply }) => {
                            let conn_id = self.register_connection(outbound, remote_ip);
                            let _ = reply.send(conn_id);
                        }
                        Some(Command::SubmitChat { content, scope, target, reply }) => {
                            let _ = reply.send(self.submit_chat(content, scope, target));
                        }
                        Some(Command::Subscribe(reply)) => {
                            let _ = reply.send(self.events.subscribe());
                        }
                        Some(Command::Membership(reply)) => {
                            let _ = reply.send(self.membership_snapshot());
                        }
                        Some(Command::Diagnostics(reply)) => {
                            let _ = reply.send(self.diagnostics.snapshot());
                        }
                        Some(Command::Shutdown(reply)) => {
                            self.broadcast_leave();
                            self.events.publish(EngineEvent::System {
                                content: "leaving the mesh".to_string(),
                                timestamp: now_ms(),
                            });
                            tokio::time::sleep(self.config.shutdown_grace).await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("engine handle dropped, actor exiting");
                            break;
                        }
                    }
                }
                inbound = in_rx.recv() => {
                    match inbound {
                        Some(Inbound::Frame(conn_id, line)) => self.handle_frame(conn_id, &line),
                        Some(Inbound::Oversized(_)) => {
                            self.diagnostics.decode_failures += 1;
                        }
                        Some(Inbound::Closed(conn_id)) => self.handle_closed(conn_id),
                        // Unreachable while the actor holds its own sender.
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick();
                }
            }
        }
        info!(id = %self.local_id.short(), "engine stopped");
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    fn register_connection(
        &mut self,
        outbound: mpsc::Sender<Vec<u8>>,
        remote_ip: Option<IpAddr>,
    ) -> ConnId {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        // Unsolicited hello so the far side learns us without waiting a tick.
        if let Some(frame) = self.self_heartbeat_frame() {
            let _ = outbound.try_send(frame);
        }

        self.conns.insert(
            conn_id,
            Connection {
                outbound,
                peer_id: None,
                remote_ip,
            },
        );
        debug!(conn = conn_id, ip = ?remote_ip, "peer socket attached");
        self.emit_membership();
        conn_id
    }

    fn handle_closed(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        // The peer stays in the table: with relayed heartbeats a closed
        // socket is not evidence of death. The liveness sweep evicts it
        // unless fresh heartbeats keep arriving via other paths.
        if let Some(peer_id) = conn.peer_id {
            self.peers.clear_direct_ip(&peer_id);
            debug!(conn = conn_id, peer = %peer_id.short(), "peer socket closed");
        } else {
            debug!(conn = conn_id, "peer socket closed before binding");
        }
        self.emit_membership();
    }

    // ========================================================================
    // Periodic tick
    // ========================================================================

    fn on_tick(&mut self) {
        let now = Instant::now();

        self.seq += 1;
        self.peers.touch_local(self.seq, now);
        if let Some(frame) = self.self_heartbeat_frame() {
            self.send_to_all(frame);
        }

        let evicted = self.peers.sweep_stale(now, self.config.liveness_ttl);
        if !evicted.is_empty() {
            for id in &evicted {
                debug!(peer = %id.short(), "peer evicted (liveness TTL)");
            }
            self.emit_membership();
        }

        self.relay_filter.rotate_if_due(now);
        self.chat_limiter.sweep(now);

        trace!(
            peers = self.peers.len(),
            direct_links = self.peers.peers_with_ips().len(),
            conns = self.conns.len(),
            seq = self.seq,
            "heartbeat tick"
        );
    }

    fn self_heartbeat_frame(&self) -> Option<Vec<u8>> {
        let payload = heartbeat_signing_payload(self.seq);
        let heartbeat = Heartbeat {
            id: self.local_id,
            seq: self.seq,
            hops: 0,
            nonce: self.pow.nonce,
            sig: SigBytes::from_signature(self.keypair.sign(&payload)),
        };
        match WireMessage::Heartbeat(heartbeat).encode_line(self.config.max_message_size) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode self heartbeat");
                None
            }
        }
    }

    fn broadcast_leave(&mut self) {
        let payload = leave_signing_payload(&self.local_id);
        let leave = Leave {
            id: self.local_id,
            hops: 0,
            sig: SigBytes::from_signature(self.keypair.sign(&payload)),
        };
        match WireMessage::Leave(leave).encode_line(self.config.max_message_size) {
            Ok(frame) => {
                info!(id = %self.local_id.short(), conns = self.conns.len(), "broadcasting LEAVE");
                self.send_to_all(frame);
            }
            Err(e) => warn!(error = %e, "failed to encode LEAVE"),
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    fn handle_frame(&mut self, conn_id: ConnId, line: &[u8]) {
        let message = match WireMessage::decode_line(line, self.config.max_message_size) {
            Ok(message) => message,
            Err(e) => {
                trace!(conn = conn_id, error = %e, "dropped undecodable frame");
                self.diagnostics.decode_failures += 1;
                return;
            }
        };
        match message {
            WireMessage::Heartbeat(heartbeat) => self.handle_heartbeat(conn_id, heartbeat),
            WireMessage::Leave(leave) => self.handle_leave(conn_id, leave),
            WireMessage::Chat(chat) => self.handle_chat(conn_id, chat),
        }
    }

    fn handle_heartbeat(&mut self, conn_id: ConnId, heartbeat: Heartbeat) {
        if heartbeat.id == self.local_id {
            return;
        }
        self.diagnostics.heartbeats_received += 1;

        if heartbeat.hops > self.config.max_relay_hops {
            return;
        }

        if let Some(record) = self.peers.get(&heartbeat.id) {
            if heartbeat.seq <= record.seq {
                self.diagnostics.duplicate_seq += 1;
                return;
            }
        }

        if !heartbeat.id.verify_pow(heartbeat.nonce, self.config.pow_difficulty) {
            self.diagnostics.invalid_pow += 1;
            trace!(peer = %heartbeat.id.short(), "heartbeat rejected: invalid PoW");
            return;
        }

        if !self.peers.can_accept(&heartbeat.id) {
            trace!(peer = %heartbeat.id.short(), "heartbeat rejected: table full");
            return;
        }

        let payload = heartbeat_signing_payload(heartbeat.seq);
        if verify_signature(&heartbeat.id, &payload, &heartbeat.sig.0).is_err() {
            self.diagnostics.invalid_sig += 1;
            trace!(peer = %heartbeat.id.short(), "heartbeat rejected: invalid signature");
            return;
        }

        // A 0-hop heartbeat binds its socket to the sender and records the
        // direct link address.
        let mut direct_ip = None;
        if heartbeat.hops == 0 {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.peer_id = Some(heartbeat.id);
                direct_ip = conn.remote_ip;
            }
        }

        let now = Instant::now();
        let outcome = self
            .peers
            .add_or_update(heartbeat.id, heartbeat.seq, now, direct_ip);
        match outcome {
            AdmitOutcome::New => {
                self.diagnostics.new_peers_added += 1;
                debug!(peer = %heartbeat.id.short(), seq = heartbeat.seq, "new peer admitted");
                self.emit_membership();
            }
            AdmitOutcome::Refreshed => {}
            // Unreachable after the regression and capacity checks above;
            // still a drop, never a relay.
            AdmitOutcome::StaleSeq | AdmitOutcome::TableFull => return,
        }

        if heartbeat.hops < self.config.max_relay_hops {
            let mark = RelayMark::heartbeat(&heartbeat.id, heartbeat.seq);
            if !self.relay_filter.has_relayed(&mark) {
                self.relay_filter.mark_relayed(&mark);
                let forward = Heartbeat {
                    hops: heartbeat.hops + 1,
                    ..heartbeat
                };
                if self.relay_except(conn_id, &WireMessage::Heartbeat(forward)) {
                    self.diagnostics.heartbeats_relayed += 1;
                }
            }
        }
    }

    fn handle_leave(&mut self, conn_id: ConnId, leave: Leave) {
        if leave.id == self.local_id {
            return;
        }
        if leave.hops > self.config.max_relay_hops {
            return;
        }
        // Unknown peers short-circuit before signature verification.
        if !self.peers.contains(&leave.id) {
            return;
        }

        let payload = leave_signing_payload(&leave.id);
        if verify_signature(&leave.id, &payload, &leave.sig.0).is_err() {
            self.diagnostics.invalid_sig += 1;
            trace!(peer = %leave.id.short(), "LEAVE rejected: invalid signature");
            return;
        }

        self.diagnostics.leave_messages += 1;
        self.peers.remove(&leave.id);
        debug!(peer = %leave.id.short(), "peer left gracefully");
        self.emit_membership();

        if leave.hops < self.config.max_relay_hops {
            let mark = RelayMark::leave(&leave.id);
            if !self.relay_filter.has_relayed(&mark) {
                self.relay_filter.mark_relayed(&mark);
                let forward = Leave {
                    hops: leave.hops + 1,
                    ..leave
                };
                self.relay_except(conn_id, &WireMessage::Leave(forward));
            }
        }
    }

    fn handle_chat(&mut self, conn_id: ConnId, chat: Chat) {
        if !self.config.enable_chat {
            return;
        }
        self.diagnostics.chats_received += 1;
        if chat.hops > self.config.max_relay_hops {
            return;
        }

        match chat.scope {
            ChatScope::Local => self.handle_local_chat(conn_id, chat),
            ChatScope::Global => self.handle_global_chat(conn_id, chat),
        }
    }

    /// LOCAL chat: trusted only when heard directly from the claimed
    /// author's own socket. Never relayed.
    fn handle_local_chat(&mut self, conn_id: ConnId, chat: Chat) {
        let bound = self.conns.get(&conn_id).and_then(|conn| conn.peer_id);
        if bound != Some(chat.sender) {
            trace!(conn = conn_id, "LOCAL chat from unbound socket dropped");
            return;
        }
        if !self.chat_limiter.allow(&chat.sender, Instant::now()) {
            trace!(peer = %chat.sender.short(), "LOCAL chat rate limited");
            return;
        }
        self.publish_chat(&chat);
    }

    /// GLOBAL chat: content-addressed, fresh, signed, deduplicated, rate
    /// limited, then published and relayed under the hop budget.
    fn handle_global_chat(&mut self, conn_id: ConnId, chat: Chat) {
        let (Some(chat_id), Some(sig)) = (chat.id, chat.sig) else {
            return;
        };

        if chat_content_id(&chat.sender, &chat.content, chat.timestamp) != chat_id {
            trace!(peer = %chat.sender.short(), "GLOBAL chat rejected: content id mismatch");
            return;
        }

        let freshness_ms = self.config.chat_freshness.as_millis() as u64;
        if now_ms().abs_diff(chat.timestamp) > freshness_ms {
            trace!(peer = %chat.sender.short(), "GLOBAL chat rejected: stale timestamp");
            return;
        }

        let payload = chat_signing_payload(&chat_id);
        if verify_signature(&chat.sender, &payload, &sig.0).is_err() {
            self.diagnostics.invalid_sig += 1;
            trace!(peer = %chat.sender.short(), "GLOBAL chat rejected: invalid signature");
            return;
        }

        let mark = RelayMark::chat(&chat_id);
        if self.relay_filter.has_relayed(&mark) {
            return;
        }
        self.relay_filter.mark_relayed(&mark);

        if !self.chat_limiter.allow(&chat.sender, Instant::now()) {
            trace!(peer = %chat.sender.short(), "GLOBAL chat rate limited");
            return;
        }

        // A directed chat is published only on the target node; it still
        // rides the flood so the target need not be a direct neighbour.
        match chat.target {
            None => self.publish_chat(&chat),
            Some(target) if target == self.local_id => self.publish_chat(&chat),
            Some(_) => {}
        }

        if chat.hops < self.config.max_relay_hops {
            let forward = Chat {
                hops: chat.hops + 1,
                ..chat
            };
            if self.relay_except(conn_id, &WireMessage::Chat(forward)) {
                self.diagnostics.chats_relayed += 1;
            }
        }
    }

    fn publish_chat(&mut self, chat: &Chat) {
        self.events.publish(EngineEvent::Chat(ChatEvent {
            sender: chat.sender,
            content: chat.content.clone(),
            timestamp: chat.timestamp,
            scope: chat.scope,
            target: chat.target,
        }));
    }

    // ========================================================================
    // Chat submission
    // ========================================================================

    fn submit_chat(
        &mut self,
        content: String,
        scope: ChatScope,
        target: Option<NodeId>,
    ) -> Result<(), ChatRejection> {
        if !self.config.enable_chat {
            return Err(ChatRejection::Disabled);
        }
        let content = content.trim().to_string();
        if content.is_empty() || content.chars().count() > MAX_CHAT_CONTENT_CHARS {
            return Err(ChatRejection::InvalidContent);
        }
        let now = Instant::now();
        if !self
            .local_window
            .check_and_record(now, self.config.chat_window, self.config.chat_max)
        {
            return Err(ChatRejection::RateLimited);
        }

        let timestamp = now_ms();
        let chat = match scope {
            ChatScope::Local => Chat {
                sender: self.local_id,
                content,
                timestamp,
                scope,
                hops: 0,
                id: None,
                sig: None,
                target,
            },
            ChatScope::Global => {
                let chat_id = chat_content_id(&self.local_id, &content, timestamp);
                let sig =
                    SigBytes::from_signature(self.keypair.sign(&chat_signing_payload(&chat_id)));
                // Marked before transmission so our own echo is suppressed.
                self.relay_filter.mark_relayed(&RelayMark::chat(&chat_id));
                Chat {
                    sender: self.local_id,
                    content,
                    timestamp,
                    scope,
                    hops: 0,
                    id: Some(chat_id),
                    sig: Some(sig),
                    target,
                }
            }
        };

        match WireMessage::Chat(chat.clone()).encode_line(self.config.max_message_size) {
            Ok(frame) => self.send_to_all(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode submitted chat");
                return Err(ChatRejection::InvalidContent);
            }
        }
        self.publish_chat(&chat);
        Ok(())
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    /// Queue a frame on every open socket. Full queues drop the frame for
    /// that peer; gossip tolerates the loss.
    fn send_to_all(&self, frame: Vec<u8>) {
        for (conn_id, conn) in &self.conns {
            if conn.outbound.try_send(frame.clone()).is_err() {
                trace!(conn = *conn_id, "outbound queue full, frame dropped");
            }
        }
    }

    /// Queue a message on every open socket except the one it arrived on.
    /// Returns whether it was queued anywhere.
    fn relay_except(&self, source: ConnId, message: &WireMessage) -> bool {
        let frame = match message.encode_line(self.config.max_message_size) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode relay frame");
                return false;
            }
        };
        let mut queued = false;
        for (conn_id, conn) in &self.conns {
            if *conn_id == source {
                continue;
            }
            if conn.outbound.try_send(frame.clone()).is_ok() {
                queued = true;
            } else {
                trace!(conn = *conn_id, "outbound queue full, relay dropped");
            }
        }
        queued
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn membership_snapshot(&self) -> MembershipUpdate {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .snapshot()
            .into_iter()
            .map(|(id, record)| PeerSummary {
                id,
                ip: record.direct_ip,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        MembershipUpdate {
            count: self.peers.len(),
            direct: self.conns.len(),
            total_unique: self.peers.total_unique(),
            id: self.local_id,
            peers,
            diagnostics: self.diagnostics.snapshot(),
        }
    }

    fn emit_membership(&self) {
        self.events
            .publish(EngineEvent::Membership(self.membership_snapshot()));
    }
}
