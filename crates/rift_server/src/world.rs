use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::{IVec3, Vec3};
use parking_lot::RwLock;
use rift_engine::snapshot::{ChunkFetch, VoxelStore};
use rift_engine::WorldId;
use rift_shared::block::{
    is_portal_block, portal_block_for_axis, BlockEntity, BlockEntityData, BlockId,
};
use rift_shared::chunk::ChunkData;
use rift_shared::coords::{
    index_to_local, world_to_chunk, Axis, ChunkPos, CHUNK_SIZE, CHUNK_VOLUME,
};
use rift_shared::entity::{EntityId, EntityKind, EntitySnapshot};
use rift_shared::physics::AABB;
use tracing::{debug, info};

pub const OVERWORLD: WorldId = WorldId(0);
pub const UNDERSIDE: WorldId = WorldId(1);

pub const WORLD_MIN_Y: i32 = 0;
pub const WORLD_MAX_Y: i32 = 128;

/// Feet position of newly joined players, a few blocks in front of the
/// overworld portal and facing it.
pub const SPAWN_POSITION: Vec3 = Vec3::new(1.0, 65.0, -6.0);
pub const SPAWN_YAW: f32 = std::f32::consts::FRAC_PI_2;

/// Inner lower corner of the prebuilt portal, identical in both worlds.
pub const PORTAL_LOWER: IVec3 = IVec3::new(0, 65, 0);
const PORTAL_WIDTH: i32 = 2;
const PORTAL_HEIGHT: i32 = 3;

/// Flat terrain as `(top_y, block)` layers, bottom up, `top_y` inclusive.
type Layers = &'static [(i32, BlockId)];

const OVERWORLD_LAYERS: Layers = &[
    (0, BlockId::BEDROCK),
    (59, BlockId::STONE),
    (63, BlockId::DIRT),
    (64, BlockId::GRASS),
];

const UNDERSIDE_LAYERS: Layers = &[
    (0, BlockId::BEDROCK),
    (60, BlockId::COBBLESTONE),
    (64, BlockId::SAND),
];

fn layer_block(layers: Layers, y: i32) -> BlockId {
    if y < WORLD_MIN_Y {
        return BlockId::AIR;
    }
    layers
        .iter()
        .find(|(top, _)| y <= *top)
        .map_or(BlockId::AIR, |(_, block)| *block)
}

fn section_template(layers: Layers, section_y: i32) -> ChunkData {
    let mut chunk = ChunkData::new_empty();
    for index in 0..CHUNK_VOLUME {
        let local = index_to_local(index);
        let y = section_y * CHUNK_SIZE as i32 + i32::from(local.y);
        chunk.set_index(index, layer_block(layers, y));
    }
    chunk
}

/// Chunk storage shared with the portal worker. Untouched sections are one
/// shared template per height; edited chunks are cloned, changed, and then
/// published under a short write lock. Readers never wait: a failed
/// `try_read` is reported as pending.
pub struct SharedChunkStore {
    templates: Vec<Arc<ChunkData>>,
    air: Arc<ChunkData>,
    edited: RwLock<HashMap<ChunkPos, Arc<ChunkData>>>,
}

impl SharedChunkStore {
    fn flat(layers: Layers) -> Self {
        let sections = (WORLD_MAX_Y - WORLD_MIN_Y) / CHUNK_SIZE as i32;
        let air = Arc::new(ChunkData::new_empty());
        let templates = (0..sections)
            .map(|section_y| {
                let chunk = section_template(layers, section_y);
                if chunk.is_uniform(BlockId::AIR) {
                    air.clone()
                } else {
                    Arc::new(chunk)
                }
            })
            .collect();
        Self {
            templates,
            air,
            edited: RwLock::new(HashMap::new()),
        }
    }

    fn template(&self, pos: ChunkPos) -> Arc<ChunkData> {
        usize::try_from(pos.y - WORLD_MIN_Y / CHUNK_SIZE as i32)
            .ok()
            .and_then(|index| self.templates.get(index))
            .unwrap_or(&self.air)
            .clone()
    }

    /// Host-side read; may wait for the lock.
    pub fn chunk(&self, pos: ChunkPos) -> Arc<ChunkData> {
        self.edited
            .read()
            .get(&pos)
            .cloned()
            .unwrap_or_else(|| self.template(pos))
    }

    fn publish(&self, pos: ChunkPos, chunk: Arc<ChunkData>) {
        self.edited.write().insert(pos, chunk);
    }

    pub fn edited_count(&self) -> usize {
        self.edited.read().len()
    }
}

impl VoxelStore for SharedChunkStore {
    fn try_chunk(&self, pos: ChunkPos) -> ChunkFetch {
        let Some(edited) = self.edited.try_read() else {
            return ChunkFetch::Pending;
        };
        let chunk = edited.get(&pos).cloned();
        drop(edited);
        ChunkFetch::Ready(chunk.unwrap_or_else(|| self.template(pos)))
    }

    fn height_range(&self) -> (i32, i32) {
        (WORLD_MIN_Y, WORLD_MAX_Y)
    }
}

/// One flat world: voxels, an index of portal-substance cells by chunk,
/// and the non-player and player entities standing in it.
pub struct ServerWorld {
    id: WorldId,
    store: Arc<SharedChunkStore>,
    markers: HashMap<ChunkPos, HashSet<IVec3>>,
    entities: HashMap<EntityId, EntitySnapshot>,
}

impl ServerWorld {
    fn flat(id: WorldId, layers: Layers) -> Self {
        Self {
            id,
            store: Arc::new(SharedChunkStore::flat(layers)),
            markers: HashMap::new(),
            entities: HashMap::new(),
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn store(&self) -> Arc<SharedChunkStore> {
        self.store.clone()
    }

    pub fn chunk(&self, pos: ChunkPos) -> Arc<ChunkData> {
        self.store.chunk(pos)
    }

    pub fn contains_y(&self, y: i32) -> bool {
        (WORLD_MIN_Y..WORLD_MAX_Y).contains(&y)
    }

    pub fn block(&self, pos: IVec3) -> BlockId {
        if !self.contains_y(pos.y) {
            return BlockId::AIR;
        }
        let (chunk_pos, local) = world_to_chunk(pos);
        self.store.chunk(chunk_pos).get(local)
    }

    /// Applies `edits`, cloning each touched chunk once and publishing it
    /// afterwards. Returns the edits that changed a cell.
    pub fn apply_edits(&mut self, edits: &[(IVec3, BlockId)]) -> Vec<(IVec3, BlockId)> {
        let mut by_chunk: HashMap<ChunkPos, Vec<(IVec3, BlockId)>> = HashMap::new();
        for &(pos, block) in edits {
            if self.contains_y(pos.y) {
                by_chunk.entry(ChunkPos::containing(pos)).or_default().push((pos, block));
            }
        }

        let mut applied = Vec::new();
        for (chunk_pos, cells) in by_chunk {
            let mut chunk = self.store.chunk(chunk_pos);
            let mut touched = false;
            for (pos, block) in cells {
                let (_, local) = world_to_chunk(pos);
                if chunk.get(local) == block {
                    continue;
                }
                Arc::make_mut(&mut chunk).set(local, block);
                self.index_marker(pos, block);
                applied.push((pos, block));
                touched = true;
            }
            if touched {
                self.store.publish(chunk_pos, chunk);
            }
        }
        applied
    }

    pub fn set_block(&mut self, pos: IVec3, block: BlockId) -> bool {
        !self.apply_edits(&[(pos, block)]).is_empty()
    }

    pub fn place_block_entity(&mut self, entity: BlockEntity) {
        if !self.contains_y(entity.pos.y) {
            return;
        }
        let chunk_pos = ChunkPos::containing(entity.pos);
        let mut chunk = self.store.chunk(chunk_pos);
        Arc::make_mut(&mut chunk).set_block_entity(entity);
        self.store.publish(chunk_pos, chunk);
    }

    fn index_marker(&mut self, pos: IVec3, block: BlockId) {
        let chunk_pos = ChunkPos::containing(pos);
        if is_portal_block(block) {
            self.markers.entry(chunk_pos).or_default().insert(pos);
        } else if let Some(cells) = self.markers.get_mut(&chunk_pos) {
            cells.remove(&pos);
            if cells.is_empty() {
                self.markers.remove(&chunk_pos);
            }
        }
    }

    pub fn portal_markers(&self, center: ChunkPos, chunk_radius: i32) -> Vec<IVec3> {
        let mut markers: Vec<IVec3> = self
            .markers
            .iter()
            .filter(|(chunk_pos, _)| chunk_pos.horizontal_distance(center) <= chunk_radius)
            .flat_map(|(_, cells)| cells.iter().copied())
            .collect();
        markers.sort_by_key(|pos| (pos.x, pos.y, pos.z));
        markers
    }

    /// Builds an obsidian frame around a `width` x `height` aperture of
    /// portal substance whose inner lower corner is `lower`.
    pub fn build_portal(&mut self, lower: IVec3, axis: Axis, width: i32, height: i32) {
        let along = axis.unit();
        let portal = portal_block_for_axis(axis);
        let mut edits = Vec::new();
        for w in -1..=width {
            for h in -1..=height {
                let pos = lower + along * w + IVec3::Y * h;
                let inside = (0..width).contains(&w) && (0..height).contains(&h);
                edits.push((pos, if inside { portal } else { BlockId::OBSIDIAN }));
            }
        }
        self.apply_edits(&edits);
        debug!(
            "Built {width}x{height} portal at {lower} in world {}",
            self.id.0
        );
    }

    pub fn insert_entity(&mut self, entity: EntitySnapshot) {
        self.entities.insert(entity.id, entity);
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<EntitySnapshot> {
        self.entities.remove(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntitySnapshot> {
        self.entities.get_mut(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities_in(
        &self,
        bounds: &AABB,
        filter: &dyn Fn(&EntitySnapshot) -> bool,
    ) -> Vec<EntitySnapshot> {
        let mut found: Vec<EntitySnapshot> = self
            .entities
            .values()
            .filter(|entity| entity.bounding_box().intersects(bounds) && filter(*entity))
            .cloned()
            .collect();
        found.sort_by_key(|entity| entity.id);
        found
    }
}

/// The two paired worlds and the entity id space they share.
pub struct WorldSet {
    worlds: Vec<ServerWorld>,
    next_entity_id: u32,
}

impl WorldSet {
    /// An overworld and its underside, each with a portal at
    /// [`PORTAL_LOWER`] leading into the other.
    pub fn paired() -> Self {
        let mut overworld = ServerWorld::flat(OVERWORLD, OVERWORLD_LAYERS);
        let mut underside = ServerWorld::flat(UNDERSIDE, UNDERSIDE_LAYERS);
        for world in [&mut overworld, &mut underside] {
            world.build_portal(PORTAL_LOWER, Axis::X, PORTAL_WIDTH, PORTAL_HEIGHT);
        }
        decorate_underside(&mut underside);
        info!(
            "Generated flat worlds {} and {} with a linked portal pair",
            OVERWORLD.0, UNDERSIDE.0
        );

        Self {
            worlds: vec![overworld, underside],
            next_entity_id: 1,
        }
    }

    pub fn get(&self, id: WorldId) -> Option<&ServerWorld> {
        self.worlds.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: WorldId) -> Option<&mut ServerWorld> {
        self.worlds.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerWorld> {
        self.worlds.iter()
    }

    pub fn destination(&self, id: WorldId) -> Option<WorldId> {
        match id {
            OVERWORLD => Some(UNDERSIDE),
            UNDERSIDE => Some(OVERWORLD),
            _ => None,
        }
    }

    pub fn spawn_entity(
        &mut self,
        world: WorldId,
        kind: EntityKind,
        position: Vec3,
    ) -> Option<EntityId> {
        let id = EntityId(self.next_entity_id);
        let target = self.worlds.get_mut(world.0 as usize)?;
        target.insert_entity(EntitySnapshot::new(id, kind, position));
        self.next_entity_id = self.next_entity_id.saturating_add(1);
        Some(id)
    }

    pub fn move_entity(
        &mut self,
        world: WorldId,
        id: EntityId,
        position: Vec3,
        yaw: f32,
        pitch: f32,
    ) {
        let Some(entity) = self.get_mut(world).and_then(|world| world.entity_mut(id)) else {
            return;
        };
        entity.velocity = position - entity.position;
        entity.position = position;
        entity.yaw = yaw;
        entity.pitch = pitch;
        entity.head_yaw = yaw;
    }

    pub fn remove_entity(&mut self, world: WorldId, id: EntityId) -> Option<EntitySnapshot> {
        self.get_mut(world)?.remove_entity(id)
    }
}

/// Landmarks visible through the overworld portal.
fn decorate_underside(world: &mut ServerWorld) {
    let mut edits = Vec::new();
    for y in 65..=69 {
        edits.push((IVec3::new(-3, y, 6), BlockId::COBBLESTONE));
        edits.push((IVec3::new(4, y, 6), BlockId::COBBLESTONE));
    }
    edits.push((IVec3::new(-3, 70, 6), BlockId::TORCH));
    edits.push((IVec3::new(4, 70, 6), BlockId::TORCH));
    edits.push((IVec3::new(1, 65, 8), BlockId::CHEST_NORTH));
    world.apply_edits(&edits);
    world.place_block_entity(BlockEntity {
        pos: IVec3::new(1, 65, 8),
        data: BlockEntityData::Container {
            title: "Underside cache".to_string(),
            slots: vec![Some((4, 16)), None, Some((15, 64))],
        },
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::{IVec3, Vec3};
    use rift_engine::snapshot::{ChunkFetch, VoxelStore};
    use rift_shared::block::BlockId;
    use rift_shared::coords::ChunkPos;
    use rift_shared::entity::{EntityKind, EntitySnapshot};
    use rift_shared::physics::AABB;

    use super::{WorldSet, OVERWORLD, PORTAL_LOWER, UNDERSIDE};

    #[test]
    fn worlds_are_flat_and_paired() {
        let worlds = WorldSet::paired();
        let overworld = worlds.get(OVERWORLD).expect("overworld");
        let underside = worlds.get(UNDERSIDE).expect("underside");

        assert_eq!(overworld.block(IVec3::new(40, 0, -40)), BlockId::BEDROCK);
        assert_eq!(overworld.block(IVec3::new(40, 64, -40)), BlockId::GRASS);
        assert_eq!(overworld.block(IVec3::new(40, 65, -40)), BlockId::AIR);
        assert_eq!(underside.block(IVec3::new(40, 64, -40)), BlockId::SAND);
        assert_eq!(overworld.block(PORTAL_LOWER), BlockId::PORTAL_X);
        assert_eq!(underside.block(PORTAL_LOWER + IVec3::new(1, 2, 0)), BlockId::PORTAL_X);
        assert_eq!(overworld.block(PORTAL_LOWER - IVec3::X), BlockId::OBSIDIAN);

        assert_eq!(worlds.destination(OVERWORLD), Some(UNDERSIDE));
        assert_eq!(worlds.destination(UNDERSIDE), Some(OVERWORLD));
    }

    #[test]
    fn marker_index_follows_block_edits() {
        let mut worlds = WorldSet::paired();
        let world = worlds.get_mut(OVERWORLD).expect("overworld");
        let center = ChunkPos { x: 0, y: 4, z: 0 };
        assert_eq!(world.portal_markers(center, 1).len(), 6);

        assert!(world.set_block(PORTAL_LOWER, BlockId::AIR));
        assert_eq!(world.portal_markers(center, 1).len(), 5);
        assert!(!world.portal_markers(center, 1).contains(&PORTAL_LOWER));

        let far = IVec3::new(200, 65, 0);
        assert!(world.set_block(far, BlockId::PORTAL_Z));
        assert!(!world.portal_markers(center, 4).contains(&far));
        assert!(world
            .portal_markers(ChunkPos::containing(far), 0)
            .contains(&far));
    }

    #[test]
    fn edits_copy_on_write() {
        let mut worlds = WorldSet::paired();
        let world = worlds.get_mut(OVERWORLD).expect("overworld");
        let pos = IVec3::new(20, 70, 20);
        let before = world.chunk(ChunkPos::containing(pos));

        assert!(world.set_block(pos, BlockId::STONE));
        assert!(!world.set_block(pos, BlockId::STONE));
        assert_eq!(world.block(pos), BlockId::STONE);

        // Readers holding the old chunk keep seeing the old contents.
        let (_, local) = rift_shared::coords::world_to_chunk(pos);
        assert_eq!(before.get(local), BlockId::AIR);
        assert!(!Arc::ptr_eq(&before, &world.chunk(ChunkPos::containing(pos))));
    }

    #[test]
    fn store_reports_pending_while_a_write_is_in_progress() {
        let worlds = WorldSet::paired();
        let store = worlds.get(OVERWORLD).expect("overworld").store();
        let pos = ChunkPos { x: 0, y: 4, z: 0 };
        assert!(matches!(store.try_chunk(pos), ChunkFetch::Ready(_)));

        let guard = store.edited.write();
        assert!(matches!(store.try_chunk(pos), ChunkFetch::Pending));
        drop(guard);
        assert!(matches!(store.try_chunk(pos), ChunkFetch::Ready(_)));
        assert_eq!(store.height_range(), (0, 128));
    }

    #[test]
    fn entity_queries_filter_by_bounds_and_predicate() {
        let mut worlds = WorldSet::paired();
        let pig = worlds
            .spawn_entity(UNDERSIDE, EntityKind::Pig, Vec3::new(1.0, 65.0, 3.0))
            .expect("pig");
        let cow = worlds
            .spawn_entity(UNDERSIDE, EntityKind::Cow, Vec3::new(30.0, 65.0, 3.0))
            .expect("cow");
        assert_ne!(pig, cow);
        assert!(worlds.spawn_entity(rift_engine::WorldId(9), EntityKind::Pig, Vec3::ZERO).is_none());

        let underside = worlds.get(UNDERSIDE).expect("underside");
        let near = AABB::from_center(Vec3::new(1.0, 65.0, 1.0), Vec3::splat(8.0));
        let found = underside.entities_in(&near, &|_: &EntitySnapshot| true);
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![pig]);
        assert!(underside.entities_in(&near, &|e: &EntitySnapshot| e.id != pig).is_empty());

        worlds.move_entity(UNDERSIDE, pig, Vec3::new(2.0, 65.0, 3.0), 1.0, 0.0);
        let moved = worlds
            .get(UNDERSIDE)
            .expect("underside")
            .entities_in(&near, &|_: &EntitySnapshot| true);
        assert_eq!(moved[0].velocity, Vec3::X);
        assert!(worlds.remove_entity(UNDERSIDE, pig).is_some());
    }
}
