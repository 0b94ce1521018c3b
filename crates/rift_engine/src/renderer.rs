use std::collections::BTreeMap;

use glam::{IVec3, Vec3};
use rift_shared::block::{is_portal_block, BlockEntity, BlockId, BlockRegistry};
use rift_shared::coords::{world_to_chunk, ChunkPos, LocalPos};
use rift_shared::physics::{raycast_blocks, Ray};
use rift_shared::protocol::S2C;
use rustc_hash::FxHashMap;

use crate::config::EngineConfig;
use crate::diff_cache::SpatialDiffCache;
use crate::error::EngineError;
use crate::frustum::ViewFrustum;
use crate::registry::{Portal, PortalKey};
use crate::snapshot::VoxelSnapshotView;

/// Width of the band just inside the atmosphere radius that shows the
/// transition material.
const TRANSITION_BAND: f32 = 1.5;

/// What one cell should look like to the client.
#[derive(Clone, Debug, PartialEq)]
pub struct CellState {
    pub block: BlockId,
    pub block_entity: Option<BlockEntity>,
}

impl CellState {
    pub fn plain(block: BlockId) -> Self {
        Self {
            block,
            block_entity: None,
        }
    }
}

/// Desired client-side state of every overridden cell for one tick.
pub type RenderTarget = FxHashMap<IVec3, CellState>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Only the aperture was cleared.
    Occluded,
    /// Viewer sees nothing through the aperture from here.
    Degenerate,
    Rendered { cells: usize },
}

/// Per-client renderer. Frustums are cached per portal until the eye moves.
#[derive(Debug, Default)]
pub struct PortalRenderer {
    frustums: FxHashMap<PortalKey, ViewFrustum>,
    eye: Option<Vec3>,
}

impl PortalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_tick(&mut self, eye: Vec3) {
        if self.eye != Some(eye) {
            self.frustums.clear();
            self.eye = Some(eye);
        }
    }

    pub fn clear(&mut self) {
        self.frustums.clear();
        self.eye = None;
    }

    pub fn forget(&mut self, key: PortalKey) {
        self.frustums.remove(&key);
    }

    /// Frustum used for `portal` this tick, if it was rendered unoccluded.
    pub fn cached_frustum(&self, key: PortalKey) -> Option<&ViewFrustum> {
        self.frustums.get(&key)
    }

    /// Writes the desired state of every cell this portal overrides into
    /// `target`.
    pub fn render(
        &mut self,
        portal: &Portal,
        config: &EngineConfig,
        blocks: &BlockRegistry,
        source: &mut VoxelSnapshotView,
        destination: &mut VoxelSnapshotView,
        target: &mut RenderTarget,
    ) -> Result<RenderOutcome, EngineError> {
        let Some(eye) = self.eye else {
            return Ok(RenderOutcome::Degenerate);
        };

        for pos in aperture_cells(portal) {
            if is_portal_block(source.block(pos)) {
                target
                    .entry(pos)
                    .or_insert_with(|| CellState::plain(BlockId::AIR));
            }
        }

        if config.occlusion_check && is_occluded(portal, eye, source, blocks) {
            self.frustums.remove(&portal.key);
            return Ok(RenderOutcome::Occluded);
        }

        let frustum = *self
            .frustums
            .entry(portal.key)
            .or_insert_with(|| ViewFrustum::new(eye, portal.aperture()));
        if frustum.is_empty() {
            return Ok(RenderOutcome::Degenerate);
        }

        let (min_y, max_y) = source.height_range();
        let depth_axis = portal.depth_axis();
        let plane = depth_axis.of(portal.lower) as f32 + 0.5;
        let max_depth = (depth_axis.of_f32(eye) - plane).abs()
            + config.atmosphere_radius
            + config.portal_depth as f32;
        let center = portal.center();
        let same_world = source.world() == destination.world();
        let send_limit_sq = config.horizontal_send_limit * config.horizontal_send_limit;

        let mut cells = 0;
        for cell in frustum.cells(max_depth, min_y, max_y) {
            if depth_axis.of(cell) == depth_axis.of(portal.lower)
                && !portal.contains_aperture_cell(cell)
            {
                continue;
            }
            let cell_center = cell.as_vec3() + Vec3::splat(0.5);
            let horizontal = Vec3::new(cell_center.x - eye.x, 0.0, cell_center.z - eye.z);
            if horizontal.length_squared() > send_limit_sq {
                continue;
            }

            if cell.y == min_y || cell.y == max_y - 1 {
                target.insert(cell, CellState::plain(BlockId::EDGE));
                cells += 1;
                continue;
            }

            let distance = cell_center.distance(center);
            if distance > config.atmosphere_radius {
                target.insert(cell, CellState::plain(BlockId::EDGE));
                cells += 1;
                continue;
            }
            if distance > config.atmosphere_radius - TRANSITION_BAND {
                target.insert(cell, CellState::plain(BlockId::EDGE_TRANSITION));
                cells += 1;
                continue;
            }

            let mirrored = portal.transform.transform_block(cell);
            if same_world && portal.occupies_frame_or_aperture(mirrored) {
                continue;
            }
            let block = destination.block(mirrored);
            if is_portal_block(block) {
                continue;
            }
            let block_entity = match destination.block_entity(mirrored) {
                Some(entity) => Some(entity.rehome(cell)?),
                None => None,
            };
            target.insert(
                cell,
                CellState {
                    block: portal.transform.unrotate_state(block),
                    block_entity,
                },
            );
            cells += 1;
        }

        Ok(RenderOutcome::Rendered { cells })
    }
}

fn aperture_cells(portal: &Portal) -> impl Iterator<Item = IVec3> {
    let (lower, upper) = (portal.lower, portal.upper);
    (lower.y..=upper.y).flat_map(move |y| {
        (lower.z..=upper.z)
            .flat_map(move |z| (lower.x..=upper.x).map(move |x| IVec3::new(x, y, z)))
    })
}

/// One ray, eye toward the far edge's tangent point. The portal is occluded
/// when the first opaque cell on the way belongs to the frame edge nearest
/// the eye. Anything else that blocks the ray is ignored.
fn is_occluded(
    portal: &Portal,
    eye: Vec3,
    source: &mut VoxelSnapshotView,
    blocks: &BlockRegistry,
) -> bool {
    let near_edge = portal.nearest_edge(eye);
    let target = portal.tangent_point(near_edge.opposite());
    let target_cell = target.floor().as_ivec3();
    let (ray, length) = Ray::between(eye, target);

    for (cell, _) in raycast_blocks(&ray, length) {
        if cell == target_cell || portal.contains_aperture_cell(cell) {
            return false;
        }
        if blocks.is_opaque(source.block(cell)) {
            return portal.frame_edge(cell) == Some(near_edge);
        }
    }
    false
}

/// Turns the desired state into client messages against what the client was
/// last sent. Cells that left the target are reverted to the true world.
pub fn diff_against_cache(
    cache: &mut SpatialDiffCache<CellState>,
    target: &RenderTarget,
    source: &mut VoxelSnapshotView,
) -> Vec<S2C> {
    let mut updates: Vec<(IVec3, CellState)> = Vec::new();

    for (pos, desired) in target {
        if cache.get(*pos) == Some(desired) {
            continue;
        }
        let actual = true_state(source, *pos);
        if !cache.contains(*pos) && actual == *desired {
            continue;
        }
        if actual == *desired {
            cache.remove(*pos);
        } else {
            cache.put(*pos, desired.clone());
        }
        updates.push((*pos, desired.clone()));
    }

    let stale: Vec<IVec3> = cache
        .positions()
        .filter(|pos| !target.contains_key(pos))
        .collect();
    let mut reverted = Vec::with_capacity(stale.len());
    cache.purge(stale, |pos, _| reverted.push(pos));
    for pos in reverted {
        updates.push((pos, true_state(source, pos)));
    }

    batch_messages(updates)
}

/// Reverts every overridden cell to the true world.
pub fn revert_all(
    cache: &mut SpatialDiffCache<CellState>,
    source: &mut VoxelSnapshotView,
) -> Vec<S2C> {
    let updates = cache
        .drain()
        .into_iter()
        .map(|(pos, _)| (pos, true_state(source, pos)))
        .collect();
    batch_messages(updates)
}

fn true_state(source: &mut VoxelSnapshotView, pos: IVec3) -> CellState {
    CellState {
        block: source.block(pos),
        block_entity: source.block_entity(pos),
    }
}

/// One `BlockUpdates` per chunk section, followed by block entity updates.
fn batch_messages(updates: Vec<(IVec3, CellState)>) -> Vec<S2C> {
    let mut sections: BTreeMap<ChunkPos, Vec<(LocalPos, BlockId)>> = BTreeMap::new();
    let mut block_entities = Vec::new();
    for (pos, state) in updates {
        let (section, local) = world_to_chunk(pos);
        sections.entry(section).or_default().push((local, state.block));
        if let Some(entity) = state.block_entity {
            block_entities.push(entity);
        }
    }

    let mut messages: Vec<S2C> = sections
        .into_iter()
        .map(|(section, mut changes)| {
            changes.sort();
            S2C::BlockUpdates { section, changes }
        })
        .collect();
    block_entities.sort_by_key(|entity| (entity.pos.x, entity.pos.y, entity.pos.z));
    messages.extend(
        block_entities
            .into_iter()
            .map(|entity| S2C::BlockEntityUpdate { entity }),
    );
    messages
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::{IVec3, Vec3};
    use rift_shared::block::{register_default_blocks, BlockEntity, BlockEntityData, BlockId};
    use rift_shared::coords::Axis;
    use rift_shared::protocol::S2C;

    use super::{
        diff_against_cache, revert_all, CellState, PortalRenderer, RenderOutcome, RenderTarget,
    };
    use crate::config::EngineConfig;
    use crate::diff_cache::SpatialDiffCache;
    use crate::host::WorldId;
    use crate::linker::PortalShape;
    use crate::registry::Portal;
    use crate::snapshot::VoxelSnapshotView;
    use crate::testkit::{block_changes, build_portal, MemoryStore};
    use crate::transform::{CoordinateTransform, Rotation};

    fn portal() -> Portal {
        Portal::new(
            PortalShape {
                lower: IVec3::new(0, 64, 0),
                upper: IVec3::new(1, 66, 0),
                axis: Axis::X,
            },
            true,
            CoordinateTransform::new(IVec3::new(0, 64, 0), IVec3::new(100, 64, 0), Rotation::None),
            90,
        )
    }

    fn source_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        build_portal(&mut store, IVec3::new(0, 64, 0), Axis::X, 2, 3, true);
        store
    }

    fn views(source: MemoryStore, destination: MemoryStore) -> (VoxelSnapshotView, VoxelSnapshotView) {
        (
            VoxelSnapshotView::new(WorldId(0), Arc::new(source)),
            VoxelSnapshotView::new(WorldId(1), Arc::new(destination)),
        )
    }

    fn render_once(
        renderer: &mut PortalRenderer,
        config: &EngineConfig,
        eye: Vec3,
        source: &mut VoxelSnapshotView,
        destination: &mut VoxelSnapshotView,
        cache: &mut SpatialDiffCache<CellState>,
    ) -> (RenderOutcome, Vec<S2C>) {
        let blocks = register_default_blocks();
        let mut target = RenderTarget::default();
        renderer.begin_tick(eye);
        let outcome = renderer
            .render(&portal(), config, &blocks, source, destination, &mut target)
            .expect("render");
        let messages = diff_against_cache(cache, &target, source);
        (outcome, messages)
    }

    #[test]
    fn destination_cell_is_mirrored_once_and_then_converges() {
        let mut destination = MemoryStore::new();
        destination.set_block(IVec3::new(101, 65, 0), BlockId::STONE);
        let (mut source, mut destination) = views(source_store(), destination);
        let config = EngineConfig::default();
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let eye = Vec3::new(1.0, 65.5, -5.0);

        let (outcome, first) =
            render_once(&mut renderer, &config, eye, &mut source, &mut destination, &mut cache);
        assert!(matches!(outcome, RenderOutcome::Rendered { .. }));
        let changes = block_changes(&first);
        assert!(changes.contains(&(IVec3::new(1, 65, 0), BlockId::STONE)));
        assert!(changes.contains(&(IVec3::new(0, 64, 0), BlockId::AIR)));
        assert!(renderer.cached_frustum(IVec3::new(0, 64, 0)).is_some());

        let (_, second) =
            render_once(&mut renderer, &config, eye, &mut source, &mut destination, &mut cache);
        assert!(second.is_empty(), "second pass sent {second:?}");
    }

    #[test]
    fn cells_past_the_atmosphere_show_edge_materials() {
        let (mut source, mut destination) = views(source_store(), MemoryStore::new());
        let config = EngineConfig {
            atmosphere_radius: 4.0,
            ..EngineConfig::default()
        };
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let (_, messages) = render_once(
            &mut renderer,
            &config,
            Vec3::new(1.0, 65.5, -3.0),
            &mut source,
            &mut destination,
            &mut cache,
        );
        let changes = block_changes(&messages);
        let center = Vec3::new(1.0, 65.5, 0.5);
        for (pos, block) in &changes {
            let distance = (pos.as_vec3() + Vec3::splat(0.5)).distance(center);
            if distance > 4.0 {
                assert_eq!(*block, BlockId::EDGE, "{pos:?}");
            } else if distance > 2.5 {
                assert_eq!(*block, BlockId::EDGE_TRANSITION, "{pos:?}");
            }
        }
        assert!(changes.iter().any(|(_, block)| *block == BlockId::EDGE));
        assert!(changes.iter().any(|(_, block)| *block == BlockId::EDGE_TRANSITION));
    }

    #[test]
    fn world_floor_is_forced_to_edge_material() {
        let mut source = MemoryStore::with_height(60, 80);
        build_portal(&mut source, IVec3::new(0, 64, 0), Axis::X, 2, 3, true);
        let mut destination = MemoryStore::with_height(60, 80);
        for z in 0..32 {
            destination.set_block(IVec3::new(101, 60, z), BlockId::STONE);
            destination.set_block(IVec3::new(101, 61, z), BlockId::STONE);
        }
        let (mut source, mut destination) = views(source, destination);
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let (_, messages) = render_once(
            &mut renderer,
            &EngineConfig::default(),
            Vec3::new(1.0, 65.5, -5.0),
            &mut source,
            &mut destination,
            &mut cache,
        );

        let changes = block_changes(&messages);
        let floor: Vec<&(IVec3, BlockId)> = changes.iter().filter(|(pos, _)| pos.y == 60).collect();
        assert!(!floor.is_empty());
        assert!(floor.iter().all(|(_, block)| *block == BlockId::EDGE));
        assert!(changes.iter().all(|(pos, _)| pos.y >= 60));
        assert!(changes.contains(&(IVec3::new(1, 61, 20), BlockId::STONE)));
    }

    #[test]
    fn far_viewer_blocked_by_near_frame_edge_only_clears_aperture() {
        let mut destination = MemoryStore::new();
        destination.set_block(IVec3::new(101, 65, 0), BlockId::STONE);
        let (mut source, mut destination) = views(source_store(), destination);
        let config = EngineConfig::default();
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();

        // 200 blocks away, looking up at the top edge from below and in front.
        let top_tangent = Vec3::new(1.0, 66.9, 0.5);
        let eye = top_tangent + Vec3::new(0.0, -6.0, -1.0).normalize() * 200.0;
        let (outcome, messages) =
            render_once(&mut renderer, &config, eye, &mut source, &mut destination, &mut cache);

        assert_eq!(outcome, RenderOutcome::Occluded);
        let changes = block_changes(&messages);
        assert_eq!(changes.len(), 6);
        assert!(changes
            .iter()
            .all(|(pos, block)| *block == BlockId::AIR && pos.z == 0));
        assert!(renderer.cached_frustum(IVec3::new(0, 64, 0)).is_none());
    }

    #[test]
    fn a_wall_that_is_not_frame_does_not_occlude() {
        // Known limitation of the single-ray test: only frame cells on the
        // near edge count, so a wall in front of the portal is rendered through.
        let mut source = source_store();
        for x in -3..5 {
            for y in 62..70 {
                source.set_block(IVec3::new(x, y, -2), BlockId::STONE);
            }
        }
        let (mut source, mut destination) = views(source, MemoryStore::new());
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let (outcome, _) = render_once(
            &mut renderer,
            &EngineConfig::default(),
            Vec3::new(1.0, 65.5, -6.0),
            &mut source,
            &mut destination,
            &mut cache,
        );
        assert!(matches!(outcome, RenderOutcome::Rendered { .. }));
    }

    #[test]
    fn block_entities_are_rehomed_into_source_space() {
        let mut destination = MemoryStore::new();
        destination.set_block(IVec3::new(100, 65, 1), BlockId::SIGN_NORTH);
        destination.set_block_entity(BlockEntity {
            pos: IVec3::new(100, 65, 1),
            data: BlockEntityData::Sign {
                lines: ["a".into(), "b".into(), "c".into(), "d".into()],
            },
        });
        let (mut source, mut destination) = views(source_store(), destination);
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let (_, messages) = render_once(
            &mut renderer,
            &EngineConfig::default(),
            Vec3::new(1.0, 65.5, -5.0),
            &mut source,
            &mut destination,
            &mut cache,
        );
        let entity = messages
            .iter()
            .find_map(|message| match message {
                S2C::BlockEntityUpdate { entity } => Some(entity.clone()),
                _ => None,
            })
            .expect("block entity update");
        assert_eq!(entity.pos, IVec3::new(0, 65, 1));
        assert!(block_changes(&messages).contains(&(IVec3::new(0, 65, 1), BlockId::SIGN_NORTH)));
    }

    #[test]
    fn cells_leaving_view_revert_to_the_true_world() {
        let mut destination = MemoryStore::new();
        destination.set_block(IVec3::new(101, 65, 0), BlockId::STONE);
        destination.set_block(IVec3::new(101, 65, 2), BlockId::STONE);
        let (mut source, mut destination) = views(source_store(), destination);
        let config = EngineConfig::default();
        let mut renderer = PortalRenderer::new();
        let mut cache = SpatialDiffCache::new();
        let aperture: Vec<IVec3> = (0..2)
            .flat_map(|x| (64..67).map(move |y| IVec3::new(x, y, 0)))
            .collect();
        let cached_block = |cache: &SpatialDiffCache<CellState>, pos: IVec3| {
            cache.get(pos).map(|state| state.block)
        };

        render_once(
            &mut renderer,
            &config,
            Vec3::new(1.0, 65.5, -5.0),
            &mut source,
            &mut destination,
            &mut cache,
        );
        assert_eq!(cached_block(&cache, IVec3::new(1, 65, 0)), Some(BlockId::STONE));
        assert_eq!(cached_block(&cache, IVec3::new(1, 65, 2)), Some(BlockId::STONE));
        assert_eq!(cached_block(&cache, IVec3::new(0, 64, 0)), Some(BlockId::AIR));

        let (_, messages) = render_once(
            &mut renderer,
            &config,
            Vec3::new(1.0, 65.5, 0.5),
            &mut source,
            &mut destination,
            &mut cache,
        );
        let changes = block_changes(&messages);
        // Only the aperture clear survives a degenerate view.
        for pos in &aperture {
            assert_eq!(cached_block(&cache, *pos), Some(BlockId::AIR), "{pos:?}");
        }
        assert!(cache.positions().all(|pos| aperture.contains(&pos)));
        assert!(changes.contains(&(IVec3::new(1, 65, 0), BlockId::AIR)));
        assert!(changes.contains(&(IVec3::new(1, 65, 2), BlockId::AIR)));

        let reverted = block_changes(&revert_all(&mut cache, &mut source));
        for pos in &aperture {
            assert!(reverted.contains(&(*pos, BlockId::PORTAL_X)), "{pos:?}");
        }
        assert!(cache.is_empty());
    }
}
