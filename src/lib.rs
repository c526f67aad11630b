//! # EmberLink Server
//!
//! Authoritative entity replication for networked game state: one backend
//! owns the world, frontends mirror it, and ownership decides who may write
//! what.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EMBERLINK SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wire/           - Packet payload codec                      │
//! │  └── stream.rs   - LE reader/writer, replication contexts    │
//! │                                                              │
//! │  entity/         - Replicated object model                   │
//! │  ├── property.rs - Dirty-tracked replicated fields           │
//! │  ├── player.rs   - Peer-bound player entity                  │
//! │  └── pawn.rs     - Movable prop (unreliable transform)       │
//! │                                                              │
//! │  network/        - Protocol engine                           │
//! │  ├── transport.rs- Session boundary + loopback hub           │
//! │  ├── packet.rs   - Discriminants and streams                 │
//! │  ├── security.rs - Ed25519 signing, pinned host keys         │
//! │  ├── peer.rs     - Per-connection session records            │
//! │  ├── cvar.rs     - Replicated settings                       │
//! │  ├── manager.rs  - Service loop, handshake, delta flush      │
//! │  └── job.rs      - Dedicated service thread                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Model
//!
//! The backend is the single source of truth:
//! - Entity lifecycle (instantiate/delete) originates only there
//! - A frontend's writes are accepted only for entities it owns
//! - Authentication is signed and trust-on-first-use pinned
//! - Failed authentication gets no reply at all
//!
//! Everything runs on plain threads behind one coarse lock per manager;
//! `NetworkJob` drives the service loop at a fixed rate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod entity;
pub mod network;
pub mod wire;

// Re-export commonly used types
pub use entity::{Entity, EntityId, EntityRegistry, Pawn, Player, ReplicateProperty};
pub use network::{
    Credentials, LoopbackNetwork, NetworkConfig, NetworkError, NetworkJob, NetworkManager,
    ReceivedEvent,
};
pub use wire::{ReplicationContext, WireError, WireReader, WireWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default service rate (Hz)
pub const TICK_RATE: u32 = 60;
