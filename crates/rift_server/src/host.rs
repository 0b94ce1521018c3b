use std::collections::HashMap;
use std::sync::Arc;

use glam::IVec3;
use rift_engine::snapshot::VoxelStore;
use rift_engine::{ClientFlags, ClientId, ClientSink, ClientView, PortalHost, WorldId};
use rift_shared::coords::ChunkPos;
use rift_shared::entity::{EntityId, EntitySnapshot};
use rift_shared::physics::AABB;
use rift_shared::protocol::S2C;

use crate::net::{NetworkServer, RELIABLE_ORDERED_CHANNEL};
use crate::player::PlayerState;
use crate::world::WorldSet;

/// Read-only view of the server state handed to the portal engine each tick.
pub struct ServerHost<'a> {
    pub worlds: &'a WorldSet,
    pub players: &'a HashMap<u64, PlayerState>,
}

impl PortalHost for ServerHost<'_> {
    fn clients(&self) -> Vec<ClientView> {
        let mut clients: Vec<ClientView> = self
            .players
            .values()
            .map(|player| ClientView {
                id: player.player_id,
                world: player.world,
                entity: player.entity,
                eye: player.eye(),
                yaw: player.yaw,
                pitch: player.pitch,
                flags: player.flags,
            })
            .collect();
        clients.sort_by_key(|client| client.id);
        clients
    }

    fn destination_world(&self, world: WorldId) -> Option<WorldId> {
        self.worlds.destination(world)
    }

    fn voxel_store(&self, world: WorldId) -> Option<Arc<dyn VoxelStore>> {
        let store: Arc<dyn VoxelStore> = self.worlds.get(world)?.store();
        Some(store)
    }

    fn portal_markers(&self, world: WorldId, center: ChunkPos, chunk_radius: i32) -> Vec<IVec3> {
        self.worlds
            .get(world)
            .map(|world| world.portal_markers(center, chunk_radius))
            .unwrap_or_default()
    }

    fn entities(
        &self,
        world: WorldId,
        bounds: &AABB,
        filter: &dyn Fn(&EntitySnapshot) -> bool,
    ) -> Vec<EntitySnapshot> {
        self.worlds
            .get(world)
            .map(|world| world.entities_in(bounds, filter))
            .unwrap_or_default()
    }

    fn entity(&self, world: WorldId, id: EntityId) -> Option<EntitySnapshot> {
        self.worlds.get(world)?.entity(id).cloned()
    }
}

/// Delivers engine output over the network and records the close-to-portal
/// flag on the player.
pub struct NetworkSink<'a> {
    pub network: &'a mut NetworkServer,
    pub players: &'a mut HashMap<u64, PlayerState>,
}

impl ClientSink for NetworkSink<'_> {
    fn is_connected(&self, client: ClientId) -> bool {
        self.players.contains_key(&client) && self.network.is_connected(client)
    }

    fn send(&mut self, client: ClientId, message: S2C) {
        self.network.send(client, RELIABLE_ORDERED_CHANNEL, &message);
    }

    fn set_near_portal(&mut self, client: ClientId, near: bool) {
        if let Some(player) = self.players.get_mut(&client) {
            player.flags.set(ClientFlags::NEAR_PORTAL, near);
        }
    }
}
