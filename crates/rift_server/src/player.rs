use std::collections::{HashMap, HashSet};

use glam::Vec3;
use rift_engine::{ClientFlags, WorldId};
use rift_shared::coords::ChunkPos;
use rift_shared::entity::{EntityId, EntityKind};

#[derive(Debug, Clone)]
pub struct PlayerState {
    pub player_id: u64,
    pub username: String,
    pub entity: EntityId,
    pub world: WorldId,
    /// Feet position.
    pub position: Vec3,
    pub last_position_tick: u64,
    pub yaw: f32,
    pub pitch: f32,
    pub flags: ClientFlags,
    /// Chunks this client holds a copy of.
    pub received_chunks: HashSet<ChunkPos>,
    /// Real entities spawned on this client, with the position last sent.
    pub tracked: HashMap<EntityId, Vec3>,
}

impl PlayerState {
    pub fn new(
        player_id: u64,
        username: impl Into<String>,
        entity: EntityId,
        world: WorldId,
    ) -> Self {
        Self {
            player_id,
            username: username.into(),
            entity,
            world,
            position: Vec3::ZERO,
            last_position_tick: 0,
            yaw: 0.0,
            pitch: 0.0,
            flags: ClientFlags::ENABLED,
            received_chunks: HashSet::new(),
            tracked: HashMap::new(),
        }
    }

    pub fn eye(&self) -> Vec3 {
        self.position + Vec3::Y * EntityKind::Player.eye_height()
    }

    pub fn portals_enabled(&self) -> bool {
        self.flags.contains(ClientFlags::ENABLED)
    }

    pub fn is_near_portal(&self) -> bool {
        self.flags.contains(ClientFlags::NEAR_PORTAL)
    }
}
