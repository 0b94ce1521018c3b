use std::sync::Arc;

use bitflags::bitflags;
use glam::{IVec3, Vec3};
use rift_shared::coords::ChunkPos;
use rift_shared::entity::{EntityId, EntitySnapshot};
use rift_shared::physics::AABB;
use rift_shared::protocol::S2C;

use crate::snapshot::VoxelStore;

pub type ClientId = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(pub u32);

bitflags! {
    /// Per-client switches shared between the host and the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClientFlags: u8 {
        /// The client wants to see through portals.
        const ENABLED     = 0b0000_0001;
        /// Set by the engine; the host redirects interactions while raised.
        const NEAR_PORTAL = 0b0000_0010;
    }
}

/// Everything the engine needs to know about one connected client, captured
/// on the host thread.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientView {
    pub id: ClientId,
    pub world: WorldId,
    pub entity: EntityId,
    pub eye: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub flags: ClientFlags,
}

/// Read access to the host simulation. Only called on the host thread.
pub trait PortalHost {
    fn clients(&self) -> Vec<ClientView>;

    /// World paired with `world`, if any.
    fn destination_world(&self, world: WorldId) -> Option<WorldId>;

    fn voxel_store(&self, world: WorldId) -> Option<Arc<dyn VoxelStore>>;

    /// Portal-substance positions in chunks within `chunk_radius` of `center`.
    fn portal_markers(&self, world: WorldId, center: ChunkPos, chunk_radius: i32) -> Vec<IVec3>;

    fn entities(
        &self,
        world: WorldId,
        bounds: &AABB,
        filter: &dyn Fn(&EntitySnapshot) -> bool,
    ) -> Vec<EntitySnapshot>;

    /// One entity by id, if it is in `world`.
    fn entity(&self, world: WorldId, id: EntityId) -> Option<EntitySnapshot>;
}

/// Outbound side of the host. Only called on the host thread.
pub trait ClientSink {
    fn is_connected(&self, client: ClientId) -> bool;

    fn send(&mut self, client: ClientId, message: S2C);

    fn set_near_portal(&mut self, client: ClientId, near: bool);
}

#[derive(Clone)]
pub struct WorldFrame {
    pub id: WorldId,
    pub store: Arc<dyn VoxelStore>,
}

/// One client's slice of a [`HostFrame`].
#[derive(Clone)]
pub struct ClientFrame {
    pub view: ClientView,
    pub source: WorldFrame,
    pub destination: Option<WorldFrame>,
    /// Present only on discovery ticks.
    pub markers: Option<Vec<IVec3>>,
    /// Real entities around the viewer, excluding the viewer.
    pub nearby_entities: Vec<EntitySnapshot>,
    /// Destination-side entities inside the session's interest boxes.
    pub destination_entities: Vec<EntitySnapshot>,
    pub overwritten: Overwrites,
}

/// True-world data the host sent one client since the previous frame. Any
/// override the engine cached for these cells is no longer on screen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overwrites {
    pub cells: Vec<IVec3>,
    pub chunks: Vec<ChunkPos>,
}

impl Overwrites {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.chunks.is_empty()
    }

    pub fn merge(&mut self, other: Overwrites) {
        self.cells.extend(other.cells);
        self.chunks.extend(other.chunks);
    }

    pub fn covers(&self, pos: IVec3) -> bool {
        self.chunks.contains(&ChunkPos::containing(pos)) || self.cells.contains(&pos)
    }
}

/// Immutable snapshot of host state handed to the worker thread.
#[derive(Clone, Default)]
pub struct HostFrame {
    pub tick: u64,
    pub clients: Vec<ClientFrame>,
}

impl HostFrame {
    /// Merges an older, skipped frame into this one so discovery markers,
    /// overwrites and attribute changes captured in it are not lost.
    pub fn absorb(&mut self, older: HostFrame) {
        for stale in older.clients {
            let Some(current) = self
                .clients
                .iter_mut()
                .find(|c| c.view.id == stale.view.id && c.view.world == stale.view.world)
            else {
                continue;
            };
            if current.markers.is_none() {
                current.markers = stale.markers;
            }
            current.overwritten.merge(stale.overwritten);
            merge_dirty_attributes(
                &mut current.destination_entities,
                &stale.destination_entities,
            );
            merge_dirty_attributes(&mut current.nearby_entities, &stale.nearby_entities);
        }
    }
}

/// Carries attribute changes of `older` snapshots into the matching entities
/// of `current`. A key changed in both keeps the newer value.
fn merge_dirty_attributes(current: &mut [EntitySnapshot], older: &[EntitySnapshot]) {
    for stale in older.iter().filter(|entity| !entity.dirty_attributes.is_empty()) {
        let Some(entity) = current.iter_mut().find(|entity| entity.id == stale.id) else {
            continue;
        };
        for attribute in &stale.dirty_attributes {
            if entity
                .dirty_attributes
                .iter()
                .all(|newer| newer.key != attribute.key)
            {
                entity.dirty_attributes.push(*attribute);
            }
        }
    }
}
