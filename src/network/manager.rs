//! Network Manager
//!
//! The protocol engine. One instance is either the authoritative backend
//! (hosts, authenticates peers, owns entity lifecycle) or a frontend
//! (connects, authenticates, mirrors the backend's entity table). All state
//! sits behind one coarse mutex; `service()` runs one full pass: pump the
//! transport, dispatch packets, advance the clock, flush outgoing state,
//! tick entities.
//!
//! Dispatch is failure-isolating: a malformed packet or a bad delta entry is
//! logged and skipped without dropping the connection. Trust failures are the
//! exception; they disconnect immediately.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityId, EntityRegistry};
use crate::network::cvar::CvarRegistry;
use crate::network::packet::{
    DisconnectReason, PacketId, STREAM_ENTITY, STREAM_EVENT, STREAM_META,
};
use crate::network::peer::{Peer, PeerId, PeerType};
use crate::network::security::{self, Identity, KeyStore, TrustStatus};
use crate::network::transport::{PeerHandle, Transport, TransportEvent};
use crate::network::NetworkError;
use crate::wire::{ReplicationContext, SignedMessage, WireReader, WireWriter};

/// Handshake challenge size in bytes.
const NONCE_LEN: usize = 32;

/// Clock drift beyond this snaps; smaller drift is nudged.
const DRIFT_SNAP_SECS: f64 = 0.25;

/// Fraction of the measured drift corrected per resync packet.
const DRIFT_NUDGE: f64 = 0.1;

/// Entries kept in the packet-size history ring.
const PACKET_LOG_CAP: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Manager tuning and secrets.
///
/// `password` gates connecting at all, `user_password` additionally gates
/// player (vs reserved machine) sessions, `rcon_password` gates remote
/// console commands. Empty `user_password` / `rcon_password` mean "players
/// need no extra secret" and "rcon disabled" respectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Service passes per second the owning job should run.
    pub rate_hz: u32,
    /// Connection cap the transport host should be created with.
    pub max_peers: usize,
    /// Inbound bandwidth hint in bytes/sec (0 = unlimited).
    pub in_bandwidth: u32,
    /// Outbound bandwidth hint in bytes/sec (0 = unlimited).
    pub out_bandwidth: u32,
    /// Connection password. Empty means open.
    pub password: String,
    /// Additional password required to authenticate as a player.
    pub user_password: String,
    /// Remote console password. Empty disables rcon entirely.
    pub rcon_password: String,
    /// Registered type name instantiated per authenticated peer.
    pub player_type: String,
    /// Root for local persistent data (pinned host keys live under it).
    pub data_dir: PathBuf,
    /// Minimum milliseconds between clock resync broadcasts.
    pub time_broadcast_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rate_hz: 60,
            max_peers: 32,
            in_bandwidth: 0,
            out_bandwidth: 0,
            password: String::new(),
            user_password: String::new(),
            rcon_password: String::new(),
            player_type: "player".to_string(),
            data_dir: PathBuf::from("./data"),
            time_broadcast_ms: 500,
        }
    }
}

impl NetworkConfig {
    /// Build a config from `EMBERLINK_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rate_hz: env_parse("EMBERLINK_RATE_HZ", defaults.rate_hz),
            max_peers: env_parse("EMBERLINK_MAX_PEERS", defaults.max_peers),
            in_bandwidth: env_parse("EMBERLINK_IN_BANDWIDTH", defaults.in_bandwidth),
            out_bandwidth: env_parse("EMBERLINK_OUT_BANDWIDTH", defaults.out_bandwidth),
            password: env_string("EMBERLINK_PASSWORD", &defaults.password),
            user_password: env_string("EMBERLINK_USER_PASSWORD", &defaults.user_password),
            rcon_password: env_string("EMBERLINK_RCON_PASSWORD", &defaults.rcon_password),
            player_type: env_string("EMBERLINK_PLAYER_TYPE", &defaults.player_type),
            data_dir: PathBuf::from(env_string(
                "EMBERLINK_DATA_DIR",
                &defaults.data_dir.to_string_lossy(),
            )),
            time_broadcast_ms: env_parse("EMBERLINK_TIME_BROADCAST_MS", defaults.time_broadcast_ms),
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, NetworkError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| NetworkError::Config(format!("{}: {}", path.display(), err)))?;
        serde_json::from_str(&text)
            .map_err(|err| NetworkError::Config(format!("{}: {}", path.display(), err)))
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// What a frontend presents during the handshake.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Display name sent to the backend.
    pub username: String,
    /// Must match the backend's connection password.
    pub password: String,
    /// Must match the backend's player password, if one is set.
    pub user_password: String,
}

/// A custom event delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    /// Originating peer (backend side), or `None` when received from the
    /// server on a frontend.
    pub from: Option<PeerId>,
    /// Application-defined event id.
    pub event_id: u16,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Backend,
    Frontend,
}

/// What a packet handler tells the service loop.
enum HandlerFlow {
    Continue,
    /// The connection this packet arrived on is gone; stop touching it.
    Stop,
}

struct ServerLink {
    /// `address:port` string the pin store keys on.
    address: String,
    peer: Peer,
    welcomed: bool,
}

struct RemotePeer {
    name: String,
    rtt_ms: u32,
    packet_loss: f32,
}

// ============================================================================
// Manager
// ============================================================================

struct ManagerState {
    role: Role,
    config: NetworkConfig,
    transport: Box<dyn Transport>,
    registry: EntityRegistry,
    cvars: CvarRegistry,
    identity: Identity,
    key_store: KeyStore,
    credentials: Credentials,

    entities: BTreeMap<EntityId, Box<dyn Entity>>,
    next_entity_id: EntityId,

    // Backend connection table, keyed by transport handle.
    peers: BTreeMap<PeerHandle, Peer>,
    next_peer_id: PeerId,

    // Frontend link to the backend, plus the roster learned over the wire.
    server: Option<ServerLink>,
    local_peer_id: Option<PeerId>,
    remote_peers: BTreeMap<PeerId, RemotePeer>,

    pending_reliable: BTreeSet<EntityId>,
    pending_unreliable: BTreeSet<EntityId>,

    outgoing_rcon: Vec<String>,
    received_rcon: VecDeque<String>,
    received_events: VecDeque<ReceivedEvent>,

    distributed_time: f64,
    ticks: u64,
    last_service: Instant,
    last_time_broadcast: Instant,

    unknown_packets: u64,
    shut_down: bool,
}

/// The replication protocol engine.
///
/// Cheap to share: every public method locks the single internal mutex, so an
/// `Arc<NetworkManager>` can be driven by a [`crate::network::NetworkJob`]
/// while the application reads and writes state from other threads.
pub struct NetworkManager {
    state: Mutex<ManagerState>,
    /// (packet id byte, packet size) of recently received packets. Separate
    /// lock so instrumentation reads never contend with the service pass.
    telemetry: Mutex<VecDeque<(u8, usize)>>,
}

impl NetworkManager {
    /// Create an authoritative backend on an already-listening transport.
    pub fn host(
        config: NetworkConfig,
        registry: EntityRegistry,
        transport: Box<dyn Transport>,
    ) -> Result<Self, NetworkError> {
        if registry.player_type().is_none() {
            return Err(NetworkError::UnknownEntityType(
                "no player type registered".to_string(),
            ));
        }
        let identity = Identity::generate()?;
        let key_store = KeyStore::new(config.data_dir.clone());
        info!("hosting, identity {}", identity.public_key());
        Ok(Self::build(
            Role::Backend,
            config,
            registry,
            transport,
            identity,
            key_store,
            Credentials::default(),
            None,
        ))
    }

    /// Create a frontend and open its connection to `address:port`.
    pub fn connect(
        config: NetworkConfig,
        registry: EntityRegistry,
        mut transport: Box<dyn Transport>,
        address: &str,
        port: u16,
        credentials: Credentials,
    ) -> Result<Self, NetworkError> {
        let identity = Identity::generate()?;
        let key_store = KeyStore::new(config.data_dir.clone());
        let handle = transport.connect(address, port)?;
        info!("connecting to {}:{} as {}", address, port, credentials.username);
        let link = ServerLink {
            address: format!("{address}:{port}"),
            peer: Peer::undifferentiated(handle),
            welcomed: false,
        };
        Ok(Self::build(
            Role::Frontend,
            config,
            registry,
            transport,
            identity,
            key_store,
            credentials,
            Some(link),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        role: Role,
        config: NetworkConfig,
        registry: EntityRegistry,
        transport: Box<dyn Transport>,
        identity: Identity,
        key_store: KeyStore,
        credentials: Credentials,
        server: Option<ServerLink>,
    ) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(ManagerState {
                role,
                config,
                transport,
                registry,
                cvars: CvarRegistry::new(),
                identity,
                key_store,
                credentials,
                entities: BTreeMap::new(),
                next_entity_id: 1,
                peers: BTreeMap::new(),
                next_peer_id: 0,
                server,
                local_peer_id: None,
                remote_peers: BTreeMap::new(),
                pending_reliable: BTreeSet::new(),
                pending_unreliable: BTreeSet::new(),
                outgoing_rcon: Vec::new(),
                received_rcon: VecDeque::new(),
                received_events: VecDeque::new(),
                distributed_time: 0.0,
                ticks: 0,
                last_service: now,
                last_time_broadcast: now,
                unknown_packets: 0,
                shut_down: false,
            }),
            telemetry: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one full service pass: pump the transport, dispatch, advance the
    /// clock, flush, tick entities.
    pub fn service(&self, timeout: Duration) -> Result<(), NetworkError> {
        let mut received: Vec<(u8, usize)> = Vec::new();
        {
            let mut state = self.lock();
            if state.shut_down {
                return Ok(());
            }
            let events = state.transport.service(timeout)?;
            for event in events {
                match event {
                    TransportEvent::Connect { peer } => state.on_connect(peer)?,
                    TransportEvent::Disconnect { peer, reason } => {
                        state.on_transport_disconnect(peer, reason);
                    }
                    TransportEvent::Receive { peer, data, .. } => {
                        if let Some(first) = data.first() {
                            received.push((*first, data.len()));
                        }
                        match state.dispatch(peer, &data) {
                            Ok(HandlerFlow::Continue) => {}
                            Ok(HandlerFlow::Stop) => {
                                // The connection behind the remaining queued
                                // packets is gone; do not apply them.
                                debug!("handle {} closed, dropping rest of batch", peer);
                                break;
                            }
                            Err(err) => {
                                warn!("packet from handle {} dropped: {}", peer, err);
                            }
                        }
                    }
                }
            }
            state.advance_clock();
            state.flush()?;
            for entity in state.entities.values_mut() {
                entity.tick();
            }
            state.ticks += 1;
        }
        if !received.is_empty() {
            let mut log = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
            for entry in received {
                if log.len() == PACKET_LOG_CAP {
                    log.pop_front();
                }
                log.push_back(entry);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity lifecycle
    // ------------------------------------------------------------------

    /// Instantiate an entity of a registered type. Backend only; frontends
    /// mirror the backend's table and never originate lifecycle.
    pub fn instantiate(&self, type_name: &str) -> Result<EntityId, NetworkError> {
        let mut state = self.lock();
        if state.role != Role::Backend {
            return Err(NetworkError::NotAuthoritative);
        }
        let id = state.alloc_entity_id();
        state.spawn(type_name, id)
    }

    /// Instantiate with an explicit id. The id must not be live.
    pub fn instantiate_with_id(
        &self,
        type_name: &str,
        id: EntityId,
    ) -> Result<EntityId, NetworkError> {
        let mut state = self.lock();
        if state.role != Role::Backend {
            return Err(NetworkError::NotAuthoritative);
        }
        if state.entities.contains_key(&id) {
            return Err(NetworkError::DuplicateEntity(id));
        }
        state.spawn(type_name, id)
    }

    /// Destroy an entity and fan the deletion out to every player.
    pub fn delete_entity(&self, id: EntityId) -> Result<(), NetworkError> {
        let mut state = self.lock();
        if state.role != Role::Backend {
            return Err(NetworkError::NotAuthoritative);
        }
        state.despawn(id)
    }

    /// Spawn a server-driven player with no controlling connection. The
    /// entity binds to the reserved bot peer id and replicates like any
    /// other player.
    pub fn add_bot(&self, display_name: &str) -> Result<EntityId, NetworkError> {
        let mut state = self.lock();
        if state.role != Role::Backend {
            return Err(NetworkError::NotAuthoritative);
        }
        let type_name = state
            .registry
            .player_type()
            .ok_or_else(|| NetworkError::UnknownEntityType("no player type registered".into()))?;
        let id = state.alloc_entity_id();
        let spawned = state.spawn(type_name, id)?;
        if let Some(entity) = state.entities.get_mut(&spawned) {
            entity.bind_peer(crate::entity::player::PEER_BOT, display_name);
        }
        info!("bot '{}' joined as entity {}", display_name, spawned);
        Ok(spawned)
    }

    /// Queue a reliable delta for this entity on the next flush.
    pub fn add_pending_update(&self, id: EntityId) {
        self.lock().pending_reliable.insert(id);
    }

    /// Queue an unreliable delta for this entity on the next flush.
    pub fn add_pending_update_unreliable(&self, id: EntityId) {
        self.lock().pending_unreliable.insert(id);
    }

    /// Run a closure against a live entity under the manager lock.
    pub fn with_entity<R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut dyn Entity) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        state.entities.get_mut(&id).map(|e| f(e.as_mut()))
    }

    /// True if the entity id is live in the local table.
    pub fn has_entity(&self, id: EntityId) -> bool {
        self.lock().entities.contains_key(&id)
    }

    /// Live entity ids, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.lock().entities.keys().copied().collect()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Authenticated player peer ids (backend), ascending.
    pub fn connected_peer_ids(&self) -> Vec<PeerId> {
        let state = self.lock();
        let mut ids: Vec<PeerId> = state
            .peers
            .values()
            .filter(|p| p.is_player())
            .map(|p| p.peer_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The player entity bound to a peer (backend).
    pub fn peer_player_entity(&self, peer_id: PeerId) -> Option<EntityId> {
        let state = self.lock();
        state
            .peers
            .values()
            .find(|p| p.is_player() && p.peer_id == peer_id)
            .and_then(|p| p.player_entity)
    }

    /// Our backend-assigned peer id (frontend), once authenticated.
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.lock().local_peer_id
    }

    /// Roster of other peers as learned over the wire (frontend).
    pub fn remote_peer_names(&self) -> Vec<(PeerId, String)> {
        self.lock()
            .remote_peers
            .iter()
            .map(|(id, p)| (*id, p.name.clone()))
            .collect()
    }

    /// True while the server link is up (frontends; backends always).
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        match state.role {
            Role::Backend => !state.shut_down,
            Role::Frontend => state.server.is_some(),
        }
    }

    // ------------------------------------------------------------------
    // Cvars, events, rcon
    // ------------------------------------------------------------------

    /// Define a setting. Replicated settings travel both directions.
    pub fn define_cvar(&self, name: &str, value: &str, replicated: bool) {
        self.lock().cvars.define(name, value, replicated);
    }

    /// Set a setting locally, dirtying it for the next flush if replicated.
    pub fn set_cvar(&self, name: &str, value: &str) -> bool {
        self.lock().cvars.set(name, value)
    }

    /// Current value of a setting.
    pub fn get_cvar(&self, name: &str) -> Option<String> {
        self.lock().cvars.get(name).map(|v| v.to_string())
    }

    /// Queue a custom event. Backend: to one peer or all players. Frontend:
    /// to the server (`target` ignored).
    pub fn queue_event(&self, event_id: u16, payload: &[u8], target: Option<PeerId>) {
        let mut state = self.lock();
        match state.role {
            Role::Backend => {
                for peer in state.peers.values_mut() {
                    if peer.is_player() && target.map(|t| t == peer.peer_id).unwrap_or(true) {
                        peer.queued_events.push((event_id, payload.to_vec()));
                    }
                }
            }
            Role::Frontend => {
                if let Some(link) = state.server.as_mut() {
                    link.peer.queued_events.push((event_id, payload.to_vec()));
                }
            }
        }
    }

    /// Take all events received since the last drain.
    pub fn drain_events(&self) -> Vec<ReceivedEvent> {
        self.lock().received_events.drain(..).collect()
    }

    /// Queue a signed remote console command (frontend).
    pub fn send_rcon(&self, command: &str) {
        self.lock().outgoing_rcon.push(command.to_string());
    }

    /// Take all accepted rcon commands (backend).
    pub fn drain_rcon(&self) -> Vec<String> {
        self.lock().received_rcon.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Clock and instrumentation
    // ------------------------------------------------------------------

    /// The shared session clock in seconds.
    pub fn distributed_time(&self) -> f64 {
        self.lock().distributed_time
    }

    /// Service passes completed.
    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    /// (packet id byte, size) of recently received packets, oldest first.
    pub fn recent_packet_sizes(&self) -> Vec<(u8, usize)> {
        self.telemetry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Packets skipped because their discriminant was unknown.
    pub fn unknown_packet_count(&self) -> u64 {
        self.lock().unknown_packets
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Graceful teardown: notify the other side(s), close every link.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        match state.role {
            Role::Backend => {
                let handles: Vec<PeerHandle> = state.peers.keys().copied().collect();
                let packet = disconnect_packet(DisconnectReason::Shutdown);
                for handle in &handles {
                    let _ = state.transport.send(*handle, STREAM_META, &packet, true);
                }
                let _ = state.transport.service(Duration::ZERO);
                for handle in handles {
                    state.transport.disconnect(handle, DisconnectReason::Shutdown);
                }
                state.peers.clear();
                info!("backend shut down");
            }
            Role::Frontend => {
                if let Some(link) = state.server.take() {
                    let packet = disconnect_packet(DisconnectReason::Quit);
                    let _ = state
                        .transport
                        .send(link.peer.handle, STREAM_META, &packet, true);
                    let _ = state.transport.service(Duration::ZERO);
                    state
                        .transport
                        .disconnect(link.peer.handle, DisconnectReason::Quit);
                }
                state.local_peer_id = None;
                state.remote_peers.clear();
                state.entities.clear();
                info!("disconnected");
            }
        }
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Service internals
// ============================================================================

impl ManagerState {
    fn alloc_entity_id(&mut self) -> EntityId {
        loop {
            let id = self.next_entity_id;
            self.next_entity_id = self.next_entity_id.wrapping_add(1);
            if self.next_entity_id == 0 {
                self.next_entity_id = 1;
            }
            if id != 0 && !self.entities.contains_key(&id) {
                return id;
            }
        }
    }

    /// Backend spawn: create, insert, queue lifecycle + initial state.
    fn spawn(&mut self, type_name: &str, id: EntityId) -> Result<EntityId, NetworkError> {
        let entity = self
            .registry
            .instantiate(type_name, id)
            .ok_or_else(|| NetworkError::UnknownEntityType(type_name.to_string()))?;
        debug!("entity {} ({}) instantiated", id, type_name);
        self.entities.insert(id, entity);
        self.pending_reliable.insert(id);
        for peer in self.peers.values_mut() {
            if peer.is_player() {
                peer.pending_new_ids.push(id);
            }
        }
        Ok(id)
    }

    /// Backend despawn: remove and queue deletion per peer.
    fn despawn(&mut self, id: EntityId) -> Result<(), NetworkError> {
        if self.entities.remove(&id).is_none() {
            return Err(NetworkError::UnknownEntity(id));
        }
        debug!("entity {} deleted", id);
        self.pending_reliable.remove(&id);
        self.pending_unreliable.remove(&id);
        for peer in self.peers.values_mut() {
            if peer.is_player() {
                // If the new-id was still queued the peer never heard of
                // this entity; dropping the queue entry is the whole story.
                let unheard = peer.pending_new_ids.iter().any(|queued| *queued == id);
                peer.pending_new_ids.retain(|queued| *queued != id);
                if !unheard {
                    peer.pending_del_ids.push(id);
                }
            }
        }
        Ok(())
    }

    fn advance_clock(&mut self) {
        let now = Instant::now();
        self.distributed_time += now.duration_since(self.last_service).as_secs_f64();
        self.last_service = now;
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn on_connect(&mut self, handle: PeerHandle) -> Result<(), NetworkError> {
        match self.role {
            Role::Backend => {
                info!("inbound connection, handle {}", handle);
                self.peers.insert(handle, Peer::undifferentiated(handle));
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let envelope = self.identity.sign(&nonce);
                let mut w = WireWriter::new();
                w.write_u8(PacketId::Welcome as u8);
                envelope.write(&mut w);
                w.write_u64(self.ticks);
                w.write_f64(self.distributed_time);
                self.transport.send(handle, STREAM_META, w.bytes(), true)?;
            }
            Role::Frontend => {
                debug!("link established, handle {}", handle);
            }
        }
        Ok(())
    }

    fn on_transport_disconnect(&mut self, handle: PeerHandle, reason: DisconnectReason) {
        match self.role {
            Role::Backend => self.teardown_peer(handle, reason),
            Role::Frontend => {
                if self.server.as_ref().map(|s| s.peer.handle) == Some(handle) {
                    if reason == DisconnectReason::Timeout {
                        warn!("server link timed out");
                    } else {
                        info!("server closed the connection ({:?})", reason);
                    }
                    self.drop_server_link();
                }
            }
        }
    }

    fn drop_server_link(&mut self) {
        self.server = None;
        self.local_peer_id = None;
        self.remote_peers.clear();
    }

    /// Remove a backend peer: its player entity dies with it and every
    /// remaining player hears about both.
    fn teardown_peer(&mut self, handle: PeerHandle, reason: DisconnectReason) {
        let Some(peer) = self.peers.remove(&handle) else {
            return;
        };
        if !peer.is_player() {
            debug!("unauthenticated handle {} gone ({:?})", handle, reason);
            return;
        }
        if reason == DisconnectReason::Timeout {
            warn!("peer {} ('{}') timed out", peer.peer_id, peer.display_name);
        } else {
            info!(
                "peer {} ('{}') disconnected ({:?})",
                peer.peer_id, peer.display_name, reason
            );
        }

        // The binding scan is authoritative; the cached link is a fallback
        // for entities whose fields were never flushed.
        let player_type = self.registry.player_type();
        let bound = self
            .entities
            .iter()
            .find(|(_, e)| Some(e.type_name()) == player_type && e.owned_by(peer.peer_id))
            .map(|(id, _)| *id)
            .or(peer.player_entity);
        if let Some(entity_id) = bound {
            if self.despawn(entity_id).is_ok() {
                debug!("player entity {} removed with peer {}", entity_id, peer.peer_id);
            }
        }

        let mut w = WireWriter::new();
        w.write_u8(PacketId::DelPeer as u8);
        w.write_i32(peer.peer_id);
        let targets: Vec<PeerHandle> = self
            .peers
            .values()
            .filter(|p| p.is_player())
            .map(|p| p.handle)
            .collect();
        for target in targets {
            let _ = self.transport.send(target, STREAM_META, w.bytes(), true);
        }
    }

    // ------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, handle: PeerHandle, data: &[u8]) -> Result<HandlerFlow, NetworkError> {
        let mut r = WireReader::new(data);
        let packet = match PacketId::from_u8(r.read_u8()?) {
            Ok(packet) => packet,
            Err(err) => {
                // Forward tolerance: count it, skip it, keep the connection.
                self.unknown_packets += 1;
                debug!("ignoring unrecognized packet: {}", err);
                return Ok(HandlerFlow::Continue);
            }
        };
        let flow = match (self.role, packet) {
            (Role::Frontend, PacketId::Welcome) => self.handle_welcome(handle, &mut r)?,
            (Role::Backend, PacketId::Authenticate) => self.handle_authenticate(handle, &mut r)?,
            (Role::Frontend, PacketId::NewId) => self.handle_new_id(&mut r)?,
            (Role::Frontend, PacketId::DelId) => self.handle_del_id(&mut r)?,
            (_, PacketId::DeltaId) => self.handle_delta(handle, &mut r)?,
            (Role::Frontend, PacketId::NewPeer) => self.handle_new_peer(&mut r)?,
            (Role::Frontend, PacketId::DelPeer) => self.handle_del_peer(&mut r)?,
            (Role::Frontend, PacketId::DistributedTime) => self.handle_time(&mut r)?,
            (_, PacketId::Cvar) => self.handle_cvar(handle, &mut r)?,
            (_, PacketId::Event) => self.handle_event(handle, &mut r)?,
            (Role::Backend, PacketId::Rcon) => self.handle_rcon(&mut r)?,
            (_, PacketId::Disconnect) => self.handle_disconnect_packet(handle, &mut r)?,
            (_, misdirected) => return Err(NetworkError::WrongDirection { packet: misdirected }),
        };
        Ok(flow)
    }

    fn handle_welcome(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        let (server_handle, address, welcomed) = match &self.server {
            Some(link) => (link.peer.handle, link.address.clone(), link.welcomed),
            None => return Ok(HandlerFlow::Continue),
        };
        if handle != server_handle || welcomed {
            return Ok(HandlerFlow::Continue);
        }

        let envelope = SignedMessage::read(r)?;
        let server_ticks = r.read_u64()?;
        let server_time = r.read_f64()?;

        if !security::verify(&envelope) {
            warn!("welcome from {} failed signature check, disconnecting", address);
            self.transport.disconnect(handle, DisconnectReason::TrustFailure);
            self.drop_server_link();
            return Err(NetworkError::SignatureInvalid);
        }
        match self.key_store.check_or_pin(&address, &envelope.public_key) {
            Ok(TrustStatus::PinnedNow) => info!("pinned host key for {}", address),
            Ok(TrustStatus::Known) => debug!("host key for {} matches pin", address),
            Err(err) => {
                warn!("refusing {}: {}", address, err);
                self.transport.disconnect(handle, DisconnectReason::TrustFailure);
                self.drop_server_link();
                return Err(err.into());
            }
        }

        self.distributed_time = server_time;
        self.ticks = server_ticks;
        if let Some(link) = self.server.as_mut() {
            link.welcomed = true;
        }

        // Prove we hold our own key by signing a fresh challenge.
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let reply = self.identity.sign(&nonce);
        let mut w = WireWriter::new();
        w.write_u8(PacketId::Authenticate as u8);
        w.write_string(&self.credentials.username);
        w.write_string(&self.credentials.password);
        w.write_string(&self.credentials.user_password);
        reply.write(&mut w);
        self.transport.send(handle, STREAM_META, w.bytes(), true)?;
        info!("host verified, authenticating as '{}'", self.credentials.username);
        Ok(HandlerFlow::Continue)
    }

    fn handle_authenticate(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        let username = r.read_string()?;
        let password = r.read_string()?;
        let user_password = r.read_string()?;
        let envelope = SignedMessage::read(r)?;

        match self.peers.get(&handle) {
            Some(peer) if peer.peer_type == PeerType::Undifferentiated => {}
            Some(_) => {
                return Err(NetworkError::WrongDirection {
                    packet: PacketId::Authenticate,
                })
            }
            None => return Ok(HandlerFlow::Continue),
        }

        // Failed attempts get no reply at all: no oracle for guessing.
        if password != self.config.password {
            debug!("auth failed for '{}': bad password", username);
            return Ok(HandlerFlow::Continue);
        }
        if !self.config.user_password.is_empty() && user_password != self.config.user_password {
            debug!("auth failed for '{}': bad user password", username);
            return Ok(HandlerFlow::Continue);
        }
        if !security::verify(&envelope) {
            debug!("auth failed for '{}': bad signature", username);
            return Ok(HandlerFlow::Continue);
        }

        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        let player_type = self
            .registry
            .player_type()
            .ok_or_else(|| NetworkError::UnknownEntityType("no player type registered".into()))?;
        let entity_id = self.alloc_entity_id();
        let entity_id = self.spawn(player_type, entity_id)?;
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.bind_peer(peer_id, &username);
        }

        let all_ids: Vec<EntityId> = self.entities.keys().copied().collect();
        if let Some(peer) = self.peers.get_mut(&handle) {
            peer.peer_id = peer_id;
            peer.peer_type = PeerType::ConnectedPlayer;
            peer.display_name = username.clone();
            peer.player_entity = Some(entity_id);
            // Full backlog: the noob flush turns this into NewId + snapshot.
            peer.pending_new_ids = all_ids;
        }

        let mut sends: Vec<(PeerHandle, Vec<u8>)> = Vec::new();
        for other in self.peers.values() {
            if other.handle != handle && other.is_player() {
                sends.push((other.handle, new_peer_packet(peer_id, &username, false)));
            }
        }
        sends.push((handle, new_peer_packet(peer_id, &username, true)));
        for other in self.peers.values() {
            if other.handle != handle && other.is_player() {
                sends.push((handle, new_peer_packet(other.peer_id, &other.display_name, false)));
            }
        }
        for (target, packet) in sends {
            self.transport.send(target, STREAM_META, &packet, true)?;
        }

        info!("peer {} authenticated as '{}', player entity {}", peer_id, username, entity_id);
        Ok(HandlerFlow::Continue)
    }

    fn handle_new_id(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let count = r.read_u16()?;
        for _ in 0..count {
            let id = r.read_u16()?;
            let type_name = r.read_string()?;
            if self.entities.contains_key(&id) {
                debug!("duplicate new-id {}, skipping", id);
                continue;
            }
            match self.registry.instantiate(&type_name, id) {
                Some(entity) => {
                    debug!("entity {} ({}) instantiated from wire", id, type_name);
                    self.entities.insert(id, entity);
                }
                None => warn!("unknown entity type '{}' in new-id", type_name),
            }
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_del_id(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let count = r.read_u16()?;
        for _ in 0..count {
            let id = r.read_u16()?;
            if self.entities.remove(&id).is_some() {
                debug!("entity {} deleted from wire", id);
                self.pending_reliable.remove(&id);
                self.pending_unreliable.remove(&id);
            } else {
                debug!("del-id for unknown entity {}", id);
            }
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_delta(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        let unreliable = r.read_bool()?;
        let initial = r.read_bool()?;
        let count = r.read_u16()?;

        // Resolve the sender's authority once; entries are checked per id.
        let sender = match self.role {
            Role::Backend => match self.peers.get(&handle) {
                Some(peer) if peer.is_player() => Some(peer.peer_id),
                _ => {
                    warn!("delta from unauthenticated handle {}", handle);
                    return Ok(HandlerFlow::Continue);
                }
            },
            Role::Frontend => self.local_peer_id,
        };

        for _ in 0..count {
            let id = r.read_u16()?;
            let blob = r.read_blob()?;
            let Some(entity) = self.entities.get_mut(&id) else {
                debug!("delta for unknown entity {}", id);
                continue;
            };
            let ctx = match self.role {
                Role::Backend => {
                    let Some(peer_id) = sender else { continue };
                    if !entity.owned_by(peer_id) {
                        // Rejected entry only; the rest of the batch is fine.
                        let err = NetworkError::Unauthorized {
                            entity: id,
                            peer: peer_id,
                        };
                        warn!("{}, rejected", err);
                        continue;
                    }
                    ReplicationContext::FromClientLocal
                }
                Role::Frontend => {
                    if initial {
                        ReplicationContext::ToNewClient
                    } else if sender.map(|p| entity.owned_by(p)).unwrap_or(false) {
                        ReplicationContext::FromServerLocal
                    } else {
                        ReplicationContext::FromServer
                    }
                }
            };
            let mut er = WireReader::new(&blob);
            let applied = if unreliable {
                entity.deserialize_unreliable(&mut er, ctx)
            } else {
                entity.deserialize(&mut er, ctx)
            };
            match applied {
                Ok(()) => {
                    // Accepted client writes fan back out to everyone else.
                    if self.role == Role::Backend {
                        if unreliable {
                            self.pending_unreliable.insert(id);
                        } else {
                            self.pending_reliable.insert(id);
                        }
                    }
                }
                Err(err) => warn!("delta entry for entity {} failed to decode: {}", id, err),
            }
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_new_peer(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let peer_id = r.read_i32()?;
        let name = r.read_string()?;
        let is_local = r.read_bool()?;
        if is_local {
            self.local_peer_id = Some(peer_id);
            if let Some(link) = self.server.as_mut() {
                link.peer.peer_id = peer_id;
                link.peer.peer_type = PeerType::ConnectedPlayer;
            }
            info!("authenticated by host as peer {}", peer_id);
        } else {
            info!("peer {} ('{}') joined", peer_id, name);
            self.remote_peers.insert(
                peer_id,
                RemotePeer {
                    name,
                    rtt_ms: 0,
                    packet_loss: 0.0,
                },
            );
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_del_peer(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let peer_id = r.read_i32()?;
        if let Some(peer) = self.remote_peers.remove(&peer_id) {
            info!("peer {} ('{}') left", peer_id, peer.name);
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_time(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let server_time = r.read_f64()?;
        let _server_ticks = r.read_u64()?;
        let count = r.read_u16()?;
        for _ in 0..count {
            let peer_id = r.read_i32()?;
            let rtt_ms = r.read_u32()?;
            let packet_loss = r.read_f32()?;
            if Some(peer_id) == self.local_peer_id {
                if let Some(link) = self.server.as_mut() {
                    link.peer.rtt_ms = rtt_ms;
                    link.peer.packet_loss = packet_loss;
                }
            } else if let Some(remote) = self.remote_peers.get_mut(&peer_id) {
                remote.rtt_ms = rtt_ms;
                remote.packet_loss = packet_loss;
            }
        }

        let drift = server_time - self.distributed_time;
        if drift.abs() > DRIFT_SNAP_SECS {
            debug!("clock drift {:.3}s, snapping", drift);
            self.distributed_time = server_time;
        } else {
            self.distributed_time += drift * DRIFT_NUDGE;
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_cvar(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        if self.role == Role::Backend {
            match self.peers.get(&handle) {
                Some(peer) if peer.is_player() => {}
                _ => {
                    warn!("cvar packet from unauthenticated handle {}", handle);
                    return Ok(HandlerFlow::Continue);
                }
            }
        }
        let count = r.read_u16()?;
        for _ in 0..count {
            let name = r.read_string()?;
            let value = r.read_string()?;
            if self.cvars.apply_remote(&name, &value) {
                debug!("cvar '{}' <- '{}'", name, value);
                if self.role == Role::Backend {
                    // Relay the accepted value to the other players.
                    let dirty = vec![(name.clone(), value.clone())];
                    for peer in self.peers.values_mut() {
                        if peer.is_player() && peer.handle != handle {
                            peer.pending_cvars.extend(dirty.iter().cloned());
                        }
                    }
                }
            } else {
                debug!("cvar '{}' rejected (undefined or not replicated)", name);
            }
        }
        Ok(HandlerFlow::Continue)
    }

    fn handle_event(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        let event_id = r.read_u16()?;
        let payload = r.read_blob()?;
        let from = match self.role {
            Role::Backend => match self.peers.get(&handle) {
                Some(peer) if peer.is_player() => Some(peer.peer_id),
                _ => {
                    warn!("event from unauthenticated handle {}", handle);
                    return Ok(HandlerFlow::Continue);
                }
            },
            Role::Frontend => None,
        };
        self.received_events.push_back(ReceivedEvent {
            from,
            event_id,
            payload,
        });
        Ok(HandlerFlow::Continue)
    }

    fn handle_rcon(&mut self, r: &mut WireReader<'_>) -> Result<HandlerFlow, NetworkError> {
        let password = r.read_string()?;
        let envelope = SignedMessage::read(r)?;
        if self.config.rcon_password.is_empty() || password != self.config.rcon_password {
            return Err(NetworkError::RconRejected);
        }
        if !security::verify(&envelope) {
            return Err(NetworkError::RconRejected);
        }
        let command =
            String::from_utf8(envelope.payload).map_err(|_| NetworkError::RconRejected)?;
        info!("rcon accepted: {}", command);
        self.received_rcon.push_back(command);
        Ok(HandlerFlow::Continue)
    }

    fn handle_disconnect_packet(
        &mut self,
        handle: PeerHandle,
        r: &mut WireReader<'_>,
    ) -> Result<HandlerFlow, NetworkError> {
        let reason = DisconnectReason::from_u8(r.read_u8()?);
        match self.role {
            Role::Backend => self.teardown_peer(handle, reason),
            Role::Frontend => {
                if self.server.as_ref().map(|s| s.peer.handle) == Some(handle) {
                    info!("server said goodbye ({:?})", reason);
                    self.transport.disconnect(handle, reason);
                    self.drop_server_link();
                }
            }
        }
        Ok(HandlerFlow::Stop)
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    fn flush(&mut self) -> Result<(), NetworkError> {
        match self.role {
            Role::Backend => self.flush_backend(),
            Role::Frontend => self.flush_frontend(),
        }
    }

    fn flush_backend(&mut self) -> Result<(), NetworkError> {
        self.resolve_bindings();

        let dirty_cvars = self.cvars.take_dirty();
        if !dirty_cvars.is_empty() {
            for peer in self.peers.values_mut() {
                if peer.is_player() {
                    peer.pending_cvars.extend(dirty_cvars.iter().cloned());
                }
            }
        }

        let reliable_ids: Vec<EntityId> = self.pending_reliable.iter().copied().collect();
        let unreliable_ids: Vec<EntityId> = self.pending_unreliable.iter().copied().collect();
        let handles: Vec<PeerHandle> = self.peers.keys().copied().collect();

        for handle in handles {
            let (peer_id, was_noob, new_ids, del_ids, events, mut cvar_queue) =
                match self.peers.get_mut(&handle) {
                    Some(peer) if peer.is_player() => {
                        let was_noob = peer.noob;
                        peer.noob = false;
                        (
                            peer.peer_id,
                            was_noob,
                            std::mem::take(&mut peer.pending_new_ids),
                            std::mem::take(&mut peer.pending_del_ids),
                            std::mem::take(&mut peer.queued_events),
                            std::mem::take(&mut peer.pending_cvars),
                        )
                    }
                    _ => continue,
                };

            if !new_ids.is_empty() {
                let live: Vec<(EntityId, &'static str)> = new_ids
                    .iter()
                    .filter_map(|id| self.entities.get(id).map(|e| (*id, e.type_name())))
                    .collect();
                if !live.is_empty() {
                    let mut w = WireWriter::new();
                    w.write_u8(PacketId::NewId as u8);
                    w.write_u16(live.len() as u16);
                    for (id, type_name) in live {
                        w.write_u16(id);
                        w.write_string(type_name);
                    }
                    self.transport.send(handle, STREAM_ENTITY, w.bytes(), true)?;
                }
            }

            if was_noob {
                // Initial snapshot: every replicated setting, every entity in
                // full. The regular delta this tick is skipped to avoid
                // applying the same state twice.
                let mut snapshot = self.cvars.replicated_snapshot();
                snapshot.append(&mut cvar_queue);
                cvar_queue = snapshot;

                let all_ids: Vec<EntityId> = self.entities.keys().copied().collect();
                if let Some(packet) =
                    build_delta(&mut self.entities, &all_ids, false, true, |_| {
                        ReplicationContext::ToNewClient
                    })
                {
                    self.transport.send(handle, STREAM_ENTITY, &packet, true)?;
                }
            } else {
                if let Some(packet) =
                    build_delta(&mut self.entities, &reliable_ids, false, false, |e| {
                        if e.owned_by(peer_id) {
                            ReplicationContext::ToClientLocal
                        } else {
                            ReplicationContext::ToClient
                        }
                    })
                {
                    self.transport.send(handle, STREAM_ENTITY, &packet, true)?;
                }
                if let Some(packet) =
                    build_delta(&mut self.entities, &unreliable_ids, true, false, |e| {
                        if e.owned_by(peer_id) {
                            ReplicationContext::ToClientLocal
                        } else {
                            ReplicationContext::ToClient
                        }
                    })
                {
                    self.transport.send(handle, STREAM_ENTITY, &packet, false)?;
                }
            }

            if !del_ids.is_empty() {
                let mut w = WireWriter::new();
                w.write_u8(PacketId::DelId as u8);
                w.write_u16(del_ids.len() as u16);
                for id in del_ids {
                    w.write_u16(id);
                }
                self.transport.send(handle, STREAM_ENTITY, w.bytes(), true)?;
            }

            if !cvar_queue.is_empty() {
                let packet = cvar_packet(&cvar_queue);
                self.transport.send(handle, STREAM_META, &packet, true)?;
            }

            for (event_id, payload) in events {
                let packet = event_packet(event_id, &payload);
                self.transport.send(handle, STREAM_EVENT, &packet, true)?;
            }
        }

        self.pending_reliable.clear();
        self.pending_unreliable.clear();

        if self.last_time_broadcast.elapsed()
            >= Duration::from_millis(self.config.time_broadcast_ms)
        {
            self.last_time_broadcast = Instant::now();
            self.broadcast_time()?;
        }
        Ok(())
    }

    fn broadcast_time(&mut self) -> Result<(), NetworkError> {
        for peer in self.peers.values_mut() {
            if let Some(stats) = self.transport.stats(peer.handle) {
                peer.rtt_ms = stats.rtt_ms;
                peer.packet_loss = stats.packet_loss;
            }
        }
        let players: Vec<(PeerId, u32, f32)> = self
            .peers
            .values()
            .filter(|p| p.is_player())
            .map(|p| (p.peer_id, p.rtt_ms, p.packet_loss))
            .collect();
        if players.is_empty() {
            return Ok(());
        }
        let mut w = WireWriter::new();
        w.write_u8(PacketId::DistributedTime as u8);
        w.write_f64(self.distributed_time);
        w.write_u64(self.ticks);
        w.write_u16(players.len() as u16);
        for (peer_id, rtt_ms, packet_loss) in &players {
            w.write_i32(*peer_id);
            w.write_u32(*rtt_ms);
            w.write_f32(*packet_loss);
        }
        let targets: Vec<PeerHandle> = self
            .peers
            .values()
            .filter(|p| p.is_player())
            .map(|p| p.handle)
            .collect();
        for target in targets {
            // Superseded by the next broadcast; no need for reliability.
            self.transport.send(target, STREAM_META, w.bytes(), false)?;
        }
        Ok(())
    }

    fn flush_frontend(&mut self) -> Result<(), NetworkError> {
        let Some(handle) = self.server.as_ref().map(|s| s.peer.handle) else {
            return Ok(());
        };

        if let Some(local) = self.local_peer_id {
            let dirty = self.cvars.take_dirty();
            if !dirty.is_empty() {
                let packet = cvar_packet(&dirty);
                self.transport.send(handle, STREAM_META, &packet, true)?;
            }

            let reliable_ids: Vec<EntityId> = self.pending_reliable.iter().copied().collect();
            if let Some(packet) =
                build_delta(&mut self.entities, &reliable_ids, false, false, |e| {
                    if e.owned_by(local) {
                        ReplicationContext::ToServerLocal
                    } else {
                        ReplicationContext::ToServer
                    }
                })
            {
                self.transport.send(handle, STREAM_ENTITY, &packet, true)?;
            }
            let unreliable_ids: Vec<EntityId> = self.pending_unreliable.iter().copied().collect();
            if let Some(packet) =
                build_delta(&mut self.entities, &unreliable_ids, true, false, |e| {
                    if e.owned_by(local) {
                        ReplicationContext::ToServerLocal
                    } else {
                        ReplicationContext::ToServer
                    }
                })
            {
                self.transport.send(handle, STREAM_ENTITY, &packet, false)?;
            }

            // Updates marked before authentication completed stay queued and
            // go out on the first authenticated pass.
            self.pending_reliable.clear();
            self.pending_unreliable.clear();
        }

        let events = self
            .server
            .as_mut()
            .map(|link| std::mem::take(&mut link.peer.queued_events))
            .unwrap_or_default();
        for (event_id, payload) in events {
            let packet = event_packet(event_id, &payload);
            self.transport.send(handle, STREAM_EVENT, &packet, true)?;
        }

        for command in std::mem::take(&mut self.outgoing_rcon) {
            let envelope = self.identity.sign(command.as_bytes());
            let mut w = WireWriter::new();
            w.write_u8(PacketId::Rcon as u8);
            w.write_string(&self.config.rcon_password);
            envelope.write(&mut w);
            self.transport.send(handle, STREAM_EVENT, w.bytes(), true)?;
        }

        // Keep the cached player link fresh for the application.
        if let Some(local) = self.local_peer_id {
            let player_type = self.registry.player_type();
            let bound = self
                .entities
                .iter()
                .find(|(_, e)| Some(e.type_name()) == player_type && e.owned_by(local))
                .map(|(id, _)| *id);
            if let Some(link) = self.server.as_mut() {
                link.peer.player_entity = bound;
            }
        }
        Ok(())
    }

    /// Re-derive each peer's player entity link from replicated state.
    fn resolve_bindings(&mut self) {
        let Some(player_type) = self.registry.player_type() else {
            return;
        };
        let bindings: Vec<(PeerHandle, Option<EntityId>)> = self
            .peers
            .values()
            .filter(|p| p.is_player())
            .map(|p| {
                let bound = self
                    .entities
                    .iter()
                    .find(|(_, e)| e.type_name() == player_type && e.owned_by(p.peer_id))
                    .map(|(id, _)| *id);
                (p.handle, bound)
            })
            .collect();
        for (handle, bound) in bindings {
            if let Some(peer) = self.peers.get_mut(&handle) {
                if bound.is_some() {
                    peer.player_entity = bound;
                }
            }
        }
    }
}

// ============================================================================
// Packet builders
// ============================================================================

/// Serialize a batch of entities into one delta packet. Entities whose pass
/// writes nothing are skipped entirely; an all-empty batch produces no packet.
fn build_delta(
    entities: &mut BTreeMap<EntityId, Box<dyn Entity>>,
    ids: &[EntityId],
    unreliable: bool,
    initial: bool,
    ctx_for: impl Fn(&dyn Entity) -> ReplicationContext,
) -> Option<Vec<u8>> {
    let mut entries: Vec<(EntityId, Vec<u8>)> = Vec::new();
    for id in ids {
        let Some(entity) = entities.get_mut(id) else {
            continue;
        };
        let ctx = ctx_for(entity.as_ref());
        let mut ew = WireWriter::new();
        if unreliable {
            entity.serialize_unreliable(&mut ew, ctx);
        } else {
            entity.serialize(&mut ew, ctx);
        }
        if ew.is_empty() {
            continue;
        }
        entries.push((*id, ew.into_bytes()));
    }
    if entries.is_empty() {
        return None;
    }
    let mut w = WireWriter::new();
    w.write_u8(PacketId::DeltaId as u8);
    w.write_bool(unreliable);
    w.write_bool(initial);
    w.write_u16(entries.len() as u16);
    for (id, blob) in entries {
        w.write_u16(id);
        w.write_blob(&blob);
    }
    Some(w.into_bytes())
}

fn new_peer_packet(peer_id: PeerId, name: &str, is_local: bool) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(PacketId::NewPeer as u8);
    w.write_i32(peer_id);
    w.write_string(name);
    w.write_bool(is_local);
    w.into_bytes()
}

fn cvar_packet(values: &[(String, String)]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(PacketId::Cvar as u8);
    w.write_u16(values.len() as u16);
    for (name, value) in values {
        w.write_string(name);
        w.write_string(value);
    }
    w.into_bytes()
}

fn event_packet(event_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(PacketId::Event as u8);
    w.write_u16(event_id);
    w.write_blob(payload);
    w.into_bytes()
}

fn disconnect_packet(reason: DisconnectReason) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u8(PacketId::Disconnect as u8);
    w.write_u8(reason as u8);
    w.into_bytes()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Pawn, Player};
    use crate::network::packet::NUM_STREAMS;
    use crate::network::transport::{LoopbackNetwork, Transport};
    use std::path::Path;

    fn test_registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register_player_type(Player::TYPE_NAME, Player::construct);
        registry.register(Pawn::TYPE_NAME, Pawn::construct);
        registry
    }

    fn test_config(dir: &Path) -> NetworkConfig {
        NetworkConfig {
            password: "sesame".into(),
            rcon_password: "rconpw".into(),
            data_dir: dir.to_path_buf(),
            time_broadcast_ms: 0,
            ..NetworkConfig::default()
        }
    }

    fn backend_on(network: &LoopbackNetwork, dir: &Path) -> NetworkManager {
        let transport = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        NetworkManager::host(test_config(dir), test_registry(), Box::new(transport)).unwrap()
    }

    fn client_on(
        network: &LoopbackNetwork,
        dir: &Path,
        username: &str,
        password: &str,
    ) -> NetworkManager {
        client_on_with_rcon(network, dir, username, password, "rconpw")
    }

    fn client_on_with_rcon(
        network: &LoopbackNetwork,
        dir: &Path,
        username: &str,
        password: &str,
        rcon_password: &str,
    ) -> NetworkManager {
        let mut config = test_config(dir);
        config.rcon_password = rcon_password.into();
        NetworkManager::connect(
            config,
            test_registry(),
            Box::new(network.client()),
            "127.0.0.1",
            7938,
            Credentials {
                username: username.into(),
                password: password.into(),
                user_password: String::new(),
            },
        )
        .unwrap()
    }

    fn pump(managers: &[&NetworkManager], rounds: usize) {
        for _ in 0..rounds {
            for manager in managers {
                manager.service(Duration::ZERO).unwrap();
            }
        }
    }

    fn count_received(manager: &NetworkManager, packet: PacketId) -> usize {
        manager
            .recent_packet_sizes()
            .iter()
            .filter(|(id, _)| *id == packet as u8)
            .count()
    }

    #[test]
    fn handshake_binds_player_on_both_sides() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, cdir.path(), "astra", "sesame");

        pump(&[&backend, &client], 4);

        assert_eq!(backend.connected_peer_ids(), vec![0]);
        assert_eq!(client.local_peer_id(), Some(0));

        let player_id = backend.peer_player_entity(0).unwrap();
        assert!(client.has_entity(player_id));
        let (bound_peer, name) = client
            .with_entity(player_id, |e| {
                let player = e.as_any().downcast_ref::<Player>().unwrap();
                (*player.remote_peer_id.get(), player.display_name.get().clone())
            })
            .unwrap();
        assert_eq!(bound_peer, 0);
        assert_eq!(name, "astra");
    }

    #[test]
    fn wrong_password_fails_silently() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, cdir.path(), "mallory", "guess");

        pump(&[&backend, &client], 6);

        assert!(backend.connected_peer_ids().is_empty());
        assert_eq!(backend.entity_count(), 0);
        assert_eq!(client.local_peer_id(), None);
        // No reply of any kind reached the client after the welcome.
        assert_eq!(count_received(&client, PacketId::NewPeer), 0);
        assert_eq!(count_received(&client, PacketId::NewId), 0);
    }

    #[test]
    fn lifecycle_fans_out_once_and_backlogs_late_joiners() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let bdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client_a = client_on(&network, adir.path(), "a", "sesame");
        let client_b = client_on(&network, bdir.path(), "b", "sesame");
        pump(&[&backend, &client_a, &client_b], 4);

        let x = backend.instantiate("pawn").unwrap();
        pump(&[&backend, &client_a, &client_b], 2);
        assert!(client_a.has_entity(x));
        assert!(client_b.has_entity(x));

        // Create then delete before anyone else joins; late joiner must see
        // neither a new-id nor a del-id for it.
        let y = backend.instantiate("pawn").unwrap();
        pump(&[&backend, &client_a, &client_b], 2);
        backend.delete_entity(y).unwrap();
        pump(&[&backend, &client_a, &client_b], 2);
        assert!(!client_a.has_entity(y));
        assert!(!client_b.has_entity(y));

        let cdir = tempfile::tempdir().unwrap();
        let client_c = client_on(&network, cdir.path(), "c", "sesame");
        pump(&[&backend, &client_a, &client_b, &client_c], 4);

        assert_eq!(client_c.entity_ids(), backend.entity_ids());
        assert!(!client_c.has_entity(y));
        assert_eq!(count_received(&client_c, PacketId::DelId), 0);
    }

    #[test]
    fn ownership_gates_client_writes() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let bdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client_a = client_on(&network, adir.path(), "a", "sesame");
        let client_b = client_on(&network, bdir.path(), "b", "sesame");
        pump(&[&backend, &client_a, &client_b], 4);

        let pawn = backend.instantiate("pawn").unwrap();
        backend.with_entity(pawn, |e| {
            e.as_any_mut().downcast_mut::<Pawn>().unwrap().owner_peer.set(0);
        });
        backend.add_pending_update(pawn);
        pump(&[&backend, &client_a, &client_b], 3);

        // b forges local ownership and tries to rename the pawn.
        client_b.with_entity(pawn, |e| {
            let p = e.as_any_mut().downcast_mut::<Pawn>().unwrap();
            p.owner_peer.set(1);
            p.label.set("forged".into());
        });
        client_b.add_pending_update(pawn);
        pump(&[&backend, &client_a, &client_b], 3);
        let label = backend
            .with_entity(pawn, |e| {
                e.as_any().downcast_ref::<Pawn>().unwrap().label.get().clone()
            })
            .unwrap();
        assert_eq!(label, "");

        // The real owner's rename goes through and relays to b.
        client_a.with_entity(pawn, |e| {
            e.as_any_mut().downcast_mut::<Pawn>().unwrap().label.set("mine".into());
        });
        client_a.add_pending_update(pawn);
        pump(&[&backend, &client_a, &client_b], 3);
        let label = backend
            .with_entity(pawn, |e| {
                e.as_any().downcast_ref::<Pawn>().unwrap().label.get().clone()
            })
            .unwrap();
        assert_eq!(label, "mine");
    }

    #[test]
    fn disconnect_removes_player_and_notifies_once() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let bdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client_a = client_on(&network, adir.path(), "a", "sesame");
        let client_b = client_on(&network, bdir.path(), "b", "sesame");
        pump(&[&backend, &client_a, &client_b], 4);

        let a_player = backend.peer_player_entity(0).unwrap();
        assert!(client_b.has_entity(a_player));
        assert_eq!(client_b.remote_peer_names().len(), 1);

        client_a.shutdown();
        pump(&[&backend, &client_b], 4);

        assert_eq!(backend.connected_peer_ids(), vec![1]);
        assert!(!backend.has_entity(a_player));
        assert!(!client_b.has_entity(a_player));
        assert!(client_b.remote_peer_names().is_empty());
        assert_eq!(count_received(&client_b, PacketId::DelPeer), 1);
    }

    #[test]
    fn transport_timeout_tears_down_like_disconnect() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let bdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client_a = client_on(&network, adir.path(), "a", "sesame");
        let client_b = client_on(&network, bdir.path(), "b", "sesame");
        pump(&[&backend, &client_a, &client_b], 4);

        let a_player = backend.peer_player_entity(0).unwrap();
        let a_handle = {
            let state = backend.lock();
            state
                .peers
                .values()
                .find(|p| p.peer_id == 0)
                .map(|p| p.handle)
                .unwrap()
        };

        network.fail_link(a_handle);
        pump(&[&backend, &client_b], 4);

        assert_eq!(backend.connected_peer_ids(), vec![1]);
        assert!(!backend.has_entity(a_player));
        assert!(!client_b.has_entity(a_player));
        assert_eq!(count_received(&client_b, PacketId::DelPeer), 1);
    }

    #[test]
    fn disconnect_halts_the_rest_of_the_batch() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, cdir.path(), "astra", "sesame");
        pump(&[&backend, &client], 4);
        assert!(client.is_connected());

        // A goodbye and an event arrive in the same batch; nothing queued
        // behind the goodbye may still be applied.
        {
            let mut state = backend.lock();
            let handle = *state.peers.keys().next().unwrap();
            let goodbye = disconnect_packet(DisconnectReason::Quit);
            state
                .transport
                .send(handle, STREAM_META, &goodbye, true)
                .unwrap();
            let late = event_packet(7, b"late");
            state
                .transport
                .send(handle, STREAM_EVENT, &late, true)
                .unwrap();
        }
        client.service(Duration::ZERO).unwrap();

        assert!(!client.is_connected());
        assert!(client.drain_events().is_empty());
    }

    #[test]
    fn updates_marked_before_auth_stay_queued() {
        let network = LoopbackNetwork::new();
        // A listener that never answers keeps the client unauthenticated.
        let _listener = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let client = client_on(&network, cdir.path(), "astra", "sesame");

        client.add_pending_update(7);
        client.add_pending_update_unreliable(9);
        client.service(Duration::ZERO).unwrap();

        let state = client.lock();
        assert!(state.pending_reliable.contains(&7));
        assert!(state.pending_unreliable.contains(&9));
    }

    #[test]
    fn pinned_key_mismatch_refuses_to_authenticate() {
        // First contact pins the real host's key.
        let cdir = tempfile::tempdir().unwrap();
        {
            let network = LoopbackNetwork::new();
            let sdir = tempfile::tempdir().unwrap();
            let backend = backend_on(&network, sdir.path());
            let client = client_on(&network, cdir.path(), "astra", "sesame");
            pump(&[&backend, &client], 4);
            assert_eq!(client.local_peer_id(), Some(0));
        }

        // A different host at the same address presents a different key.
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let imposter = backend_on(&network, sdir.path());
        let client = client_on(&network, cdir.path(), "astra", "sesame");
        pump(&[&imposter, &client], 6);

        assert_eq!(client.local_peer_id(), None);
        assert!(!client.is_connected());
        assert!(imposter.connected_peer_ids().is_empty());
    }

    #[test]
    fn tampered_welcome_never_gets_credentials() {
        let network = LoopbackNetwork::new();
        let mut rogue = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let client = client_on(&network, cdir.path(), "astra", "sesame");

        client.service(Duration::ZERO).unwrap();
        let events = rogue.service(Duration::ZERO).unwrap();
        let peer = events
            .iter()
            .find_map(|e| match e {
                TransportEvent::Connect { peer } => Some(*peer),
                _ => None,
            })
            .unwrap();

        // Valid key, tampered payload.
        let identity = Identity::generate().unwrap();
        let mut envelope = identity.sign(b"honest-nonce");
        envelope.payload = b"forged-nonce".to_vec();
        let mut w = WireWriter::new();
        w.write_u8(PacketId::Welcome as u8);
        envelope.write(&mut w);
        w.write_u64(0);
        w.write_f64(0.0);
        rogue.send(peer, STREAM_META, w.bytes(), true).unwrap();

        pump(&[&client], 4);
        let events = rogue.service(Duration::ZERO).unwrap();
        let got_credentials = events
            .iter()
            .any(|e| matches!(e, TransportEvent::Receive { data, .. } if data.first() == Some(&(PacketId::Authenticate as u8))));
        assert!(!got_credentials);
        assert!(!client.is_connected());
    }

    #[test]
    fn unreliable_transform_survives_loss() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        pump(&[&backend, &client], 4);

        let pawn = backend.instantiate("pawn").unwrap();
        backend.with_entity(pawn, |e| {
            e.as_any_mut().downcast_mut::<Pawn>().unwrap().owner_peer.set(0);
        });
        backend.add_pending_update(pawn);
        pump(&[&backend, &client], 3);

        let drive = |x: f32| {
            client.with_entity(pawn, |e| {
                e.as_any_mut().downcast_mut::<Pawn>().unwrap().x.set(x);
            });
            client.add_pending_update_unreliable(pawn);
        };
        let backend_x = || {
            backend
                .with_entity(pawn, |e| *e.as_any().downcast_ref::<Pawn>().unwrap().x.get())
                .unwrap()
        };

        drive(10.0);
        pump(&[&client, &backend], 2);
        assert_eq!(backend_x(), 10.0);

        network.set_drop_unreliable(true);
        drive(50.0);
        pump(&[&client, &backend], 2);
        assert_eq!(backend_x(), 10.0);

        // Next tick's delta supersedes the lost one.
        network.set_drop_unreliable(false);
        drive(60.0);
        pump(&[&client, &backend], 2);
        assert_eq!(backend_x(), 60.0);
    }

    #[test]
    fn quiet_ticks_send_no_deltas() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        pump(&[&backend, &client], 6);

        let before = count_received(&client, PacketId::DeltaId);
        pump(&[&backend, &client], 10);
        assert_eq!(count_received(&client, PacketId::DeltaId), before);
    }

    #[test]
    fn clock_syncs_to_backend() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        pump(&[&backend, &client], 4);

        // Force massive drift; the next resync packet snaps it back.
        {
            let mut state = client.lock();
            state.distributed_time += 100.0;
        }
        pump(&[&backend, &client], 2);
        let drift = (backend.distributed_time() - client.distributed_time()).abs();
        assert!(drift < DRIFT_SNAP_SECS, "drift {drift} not snapped");
    }

    #[test]
    fn cvars_replicate_both_ways_and_reject_spoofs() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        backend.define_cvar("sv_gravity", "9.8", true);
        backend.define_cvar("sv_secret", "hush", false);
        client.define_cvar("sv_gravity", "0", true);
        pump(&[&backend, &client], 4);

        // Join-time snapshot.
        assert_eq!(client.get_cvar("sv_gravity"), Some("9.8".into()));

        backend.set_cvar("sv_gravity", "3.7");
        pump(&[&backend, &client], 2);
        assert_eq!(client.get_cvar("sv_gravity"), Some("3.7".into()));

        client.set_cvar("sv_gravity", "1.6");
        pump(&[&client, &backend], 2);
        assert_eq!(backend.get_cvar("sv_gravity"), Some("1.6".into()));

        // Unreplicated names never cross, even if a peer pushes them.
        client.define_cvar("sv_secret", "owned", true);
        client.set_cvar("sv_secret", "owned");
        pump(&[&client, &backend], 2);
        assert_eq!(backend.get_cvar("sv_secret"), Some("hush".into()));
    }

    #[test]
    fn events_travel_both_directions() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        pump(&[&backend, &client], 4);

        client.queue_event(7, b"ping", None);
        pump(&[&client, &backend], 2);
        assert_eq!(
            backend.drain_events(),
            vec![ReceivedEvent {
                from: Some(0),
                event_id: 7,
                payload: b"ping".to_vec()
            }]
        );

        backend.queue_event(9, b"pong", Some(0));
        pump(&[&backend, &client], 2);
        assert_eq!(
            client.drain_events(),
            vec![ReceivedEvent {
                from: None,
                event_id: 9,
                payload: b"pong".to_vec()
            }]
        );
    }

    #[test]
    fn rcon_requires_password_and_signature() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let bdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let good = client_on(&network, adir.path(), "op", "sesame");
        let bad = client_on_with_rcon(&network, bdir.path(), "guest", "sesame", "wrong");
        pump(&[&backend, &good, &bad], 4);

        good.send_rcon("status");
        bad.send_rcon("shutdown");
        pump(&[&good, &bad, &backend], 2);

        assert_eq!(backend.drain_rcon(), vec!["status".to_string()]);
    }

    #[test]
    fn bots_replicate_like_players_but_grant_no_authority() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");
        pump(&[&backend, &client], 4);

        let bot = backend.add_bot("botley").unwrap();
        pump(&[&backend, &client], 2);

        assert!(client.has_entity(bot));
        let bound = client
            .with_entity(bot, |e| {
                *e.as_any().downcast_ref::<Player>().unwrap().remote_peer_id.get()
            })
            .unwrap();
        assert_eq!(bound, crate::entity::player::PEER_BOT);
        // Bots have no connection; they never appear as authenticated peers.
        assert_eq!(backend.connected_peer_ids(), vec![0]);
    }

    #[test]
    fn unknown_packets_are_counted_and_skipped() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let backend = backend_on(&network, sdir.path());

        let mut rogue = network.client();
        let link = rogue.connect("127.0.0.1", 7938).unwrap();
        rogue.send(link, STREAM_META, &[200, 1, 2, 3], true).unwrap();
        backend.service(Duration::ZERO).unwrap();
        assert_eq!(backend.unknown_packet_count(), 1);

        // The connection (and the host) survive.
        let cdir = tempfile::tempdir().unwrap();
        let client = client_on(&network, cdir.path(), "a", "sesame");
        pump(&[&backend, &client], 4);
        assert_eq!(client.local_peer_id(), Some(0));
    }

    #[test]
    fn frontend_cannot_originate_lifecycle() {
        let network = LoopbackNetwork::new();
        let sdir = tempfile::tempdir().unwrap();
        let adir = tempfile::tempdir().unwrap();
        let _backend = backend_on(&network, sdir.path());
        let client = client_on(&network, adir.path(), "a", "sesame");

        assert!(matches!(
            client.instantiate("pawn"),
            Err(NetworkError::NotAuthoritative)
        ));
        assert!(matches!(
            client.delete_entity(1),
            Err(NetworkError::NotAuthoritative)
        ));
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = NetworkConfig::default();
        assert_eq!(config.rate_hz, 60);
        assert_eq!(config.max_peers, 32);
        assert!(config.password.is_empty());
        assert_eq!(config.time_broadcast_ms, 500);
    }

    #[test]
    fn config_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"password": "sesame", "max_peers": 4}"#).unwrap();

        let config = NetworkConfig::from_file(&path).unwrap();
        assert_eq!(config.password, "sesame");
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.rate_hz, 60);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            NetworkConfig::from_file(&path),
            Err(NetworkError::Config(_))
        ));
    }
}
