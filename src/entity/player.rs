//! Player Entity
//!
//! The entity bound to a connected peer. Binding is discovered by scanning
//! player-type entities for `remote_peer_id == peer_id`, so no separate
//! binding table can drift out of sync with replicated state.

use std::any::Any;

use crate::entity::property::ReplicateProperty;
use crate::entity::{Entity, EntityId};
use crate::network::peer::PeerId;
use crate::wire::{ReplicationContext, WireError, WireReader, WireWriter};

/// `remote_peer_id` value for a player nobody controls.
pub const PEER_UNCONTROLLED: PeerId = -1;
/// `remote_peer_id` value for a server-driven bot.
pub const PEER_BOT: PeerId = -2;

/// A peer-controlled (or bot) player.
pub struct Player {
    id: EntityId,
    /// Controlling peer id, or [`PEER_UNCONTROLLED`] / [`PEER_BOT`].
    pub remote_peer_id: ReplicateProperty<PeerId>,
    /// Name shown to other peers.
    pub display_name: ReplicateProperty<String>,
}

impl Player {
    /// Registered type name.
    pub const TYPE_NAME: &'static str = "player";

    /// Create an uncontrolled player.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            remote_peer_id: ReplicateProperty::new(PEER_UNCONTROLLED),
            display_name: ReplicateProperty::new(String::new()),
        }
    }

    /// Registry constructor.
    pub fn construct(id: EntityId) -> Box<dyn Entity> {
        Box::new(Self::new(id))
    }
}

impl Entity for Player {
    fn id(&self) -> EntityId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    // Binding fields are server-authoritative: they only ever travel
    // backend -> frontend. A client-bound pass writes both; a server-bound
    // pass writes nothing.
    fn serialize(&mut self, w: &mut WireWriter, ctx: ReplicationContext) {
        if ctx.client_bound() {
            self.remote_peer_id.write(w);
            self.display_name.write(w);
        }
    }

    fn deserialize(
        &mut self,
        r: &mut WireReader<'_>,
        ctx: ReplicationContext,
    ) -> Result<(), WireError> {
        if ctx.client_bound() {
            self.remote_peer_id.read(r)?;
            self.display_name.read(r)?;
        }
        Ok(())
    }

    fn owned_by(&self, peer_id: PeerId) -> bool {
        peer_id >= 0 && *self.remote_peer_id.get() == peer_id
    }

    fn bind_peer(&mut self, peer_id: PeerId, display_name: &str) {
        self.remote_peer_id.set(peer_id);
        self.display_name.set(display_name.to_string());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_fields_replicate_to_clients_only() {
        let mut source = Player::new(3);
        source.remote_peer_id.set(5);
        source.display_name.set("astra".into());

        let mut w = WireWriter::new();
        source.serialize(&mut w, ReplicationContext::ToNewClient);
        let bytes = w.into_bytes();
        assert!(!bytes.is_empty());

        let mut dest = Player::new(3);
        let mut r = WireReader::new(&bytes);
        dest.deserialize(&mut r, ReplicationContext::FromServer).unwrap();
        assert_eq!(*dest.remote_peer_id.get(), 5);
        assert_eq!(dest.display_name.get(), "astra");

        // Server-bound pass carries nothing.
        let mut w = WireWriter::new();
        source.serialize(&mut w, ReplicationContext::ToServerLocal);
        assert!(w.is_empty());
    }

    #[test]
    fn ownership_follows_binding() {
        let mut player = Player::new(1);
        assert!(!player.owned_by(0));

        player.remote_peer_id.set(4);
        assert!(player.owned_by(4));
        assert!(!player.owned_by(5));

        // Reserved ids never grant wire authority.
        player.remote_peer_id.set(PEER_BOT);
        assert!(!player.owned_by(PEER_BOT));
    }
}
