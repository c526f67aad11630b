//! Replicated Entity Model
//!
//! Entities are the unit of replication: polymorphic objects identified by a
//! 16-bit handle, owned exclusively by the manager's entity table, with
//! serialize/deserialize hooks tagged by direction+locality context.
//!
//! ## Module Structure
//!
//! - `property`: dirty-tracked replicated field wrapper
//! - `player`: the peer-bound player entity
//! - `pawn`: a movable prop exercising the unreliable path

pub mod pawn;
pub mod player;
pub mod property;

use std::any::Any;
use std::collections::BTreeMap;

use crate::network::peer::PeerId;
use crate::wire::{ReplicationContext, WireError, WireReader, WireWriter};

pub use pawn::Pawn;
pub use player::Player;
pub use property::{ChangeOrigin, ChangeWatcher, ReplicateProperty, WireValue};

/// Replicated object handle. Unique within one manager's table, assigned by
/// the authoritative side (or explicitly for predicted instantiation), never
/// reused while the entity lives.
pub type EntityId = u16;

/// A replicated game-state object.
///
/// Serialize methods take `&mut self` because flushing a field clears its
/// dirty flag. The default unreliable pair is a no-op; entities without
/// high-frequency fields simply never produce unreliable payloads.
pub trait Entity: Send {
    /// Handle in the owning manager's table. Immutable after construction.
    fn id(&self) -> EntityId;

    /// Registered type name used for remote instantiation.
    fn type_name(&self) -> &'static str;

    /// Write the field subset this entity replicates for `ctx`.
    fn serialize(&mut self, w: &mut WireWriter, ctx: ReplicationContext);

    /// Apply a received reliable delta written with the mirrored context.
    fn deserialize(&mut self, r: &mut WireReader<'_>, ctx: ReplicationContext)
        -> Result<(), WireError>;

    /// Write high-frequency fields. Lost payloads are superseded next tick.
    fn serialize_unreliable(&mut self, _w: &mut WireWriter, _ctx: ReplicationContext) {}

    /// Apply a received unreliable delta.
    fn deserialize_unreliable(
        &mut self,
        _r: &mut WireReader<'_>,
        _ctx: ReplicationContext,
    ) -> Result<(), WireError> {
        Ok(())
    }

    /// Authority predicate: may `peer_id` originate writes to this entity?
    fn owned_by(&self, _peer_id: PeerId) -> bool {
        false
    }

    /// Bind this entity to an authenticated peer. Only player-type entities
    /// do anything here.
    fn bind_peer(&mut self, _peer_id: PeerId, _display_name: &str) {}

    /// Per-service-tick update hook.
    fn tick(&mut self) {}

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Constructor registered for a named entity type.
pub type EntityConstructor = fn(EntityId) -> Box<dyn Entity>;

/// Explicit name -> constructor table.
///
/// Constructed by the embedding application and passed to the manager at
/// construction time; there is no process-global registry.
#[derive(Default)]
pub struct EntityRegistry {
    constructors: BTreeMap<&'static str, EntityConstructor>,
    player_type: Option<&'static str>,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named entity type.
    pub fn register(&mut self, type_name: &'static str, constructor: EntityConstructor) {
        self.constructors.insert(type_name, constructor);
    }

    /// Register the type whose instances bind to peers. Also registers it as
    /// a normal constructor.
    pub fn register_player_type(
        &mut self,
        type_name: &'static str,
        constructor: EntityConstructor,
    ) {
        self.register(type_name, constructor);
        self.player_type = Some(type_name);
    }

    /// The registered player type name, if any.
    pub fn player_type(&self) -> Option<&'static str> {
        self.player_type
    }

    /// Construct an entity of a registered type.
    pub fn instantiate(&self, type_name: &str, id: EntityId) -> Option<Box<dyn Entity>> {
        self.constructors.get(type_name).map(|ctor| ctor(id))
    }

    /// True if the type name has a constructor.
    pub fn knows(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_instantiates_registered_types() {
        let mut registry = EntityRegistry::new();
        registry.register_player_type(Player::TYPE_NAME, Player::construct);
        registry.register(Pawn::TYPE_NAME, Pawn::construct);

        assert_eq!(registry.player_type(), Some(Player::TYPE_NAME));
        assert!(registry.knows("player"));
        assert!(!registry.knows("dragon"));

        let entity = registry.instantiate("pawn", 9).unwrap();
        assert_eq!(entity.id(), 9);
        assert_eq!(entity.type_name(), "pawn");

        assert!(registry.instantiate("dragon", 1).is_none());
    }
}
