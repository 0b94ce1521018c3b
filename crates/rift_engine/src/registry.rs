use std::collections::VecDeque;

use glam::{IVec3, Vec3};
use rift_shared::block::{portal_axis, BlockRegistry};
use rift_shared::coords::Axis;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::frustum::Aperture;
use crate::linker::{PortalLinker, PortalShape, NEIGHBOURS};
use crate::snapshot::VoxelSnapshotView;
use crate::transform::CoordinateTransform;

/// Canonical identity of a portal: the min corner of its aperture.
pub type PortalKey = IVec3;

const TANGENT_INSET: f32 = 0.1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameEdge {
    Top,
    Bottom,
    Left,
    Right,
}

impl FrameEdge {
    pub const ALL: [FrameEdge; 4] = [FrameEdge::Top, FrameEdge::Bottom, FrameEdge::Left, FrameEdge::Right];

    pub fn opposite(self) -> Self {
        match self {
            FrameEdge::Top => FrameEdge::Bottom,
            FrameEdge::Bottom => FrameEdge::Top,
            FrameEdge::Left => FrameEdge::Right,
            FrameEdge::Right => FrameEdge::Left,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Portal {
    pub key: PortalKey,
    pub lower: IVec3,
    pub upper: IVec3,
    /// Axis along which the aperture is wide; always horizontal.
    pub axis: Axis,
    pub has_corners: bool,
    pub transform: CoordinateTransform,
    pub grace: i64,
}

impl Portal {
    pub fn new(shape: PortalShape, has_corners: bool, transform: CoordinateTransform, grace: i64) -> Self {
        Self {
            key: shape.lower,
            lower: shape.lower,
            upper: shape.upper,
            axis: shape.axis,
            has_corners,
            transform,
            grace,
        }
    }

    pub fn depth_axis(&self) -> Axis {
        self.axis.horizontal_perpendicular()
    }

    pub fn center(&self) -> Vec3 {
        (self.lower.as_vec3() + (self.upper + IVec3::ONE).as_vec3()) * 0.5
    }

    pub fn aperture(&self) -> Aperture {
        Aperture::from_cells(self.depth_axis(), self.lower, self.upper)
    }

    pub fn contains_aperture_cell(&self, pos: IVec3) -> bool {
        pos.cmpge(self.lower).all() && pos.cmple(self.upper).all()
    }

    /// Which border edge `pos` belongs to. Corner cells count as part of the
    /// top or bottom edge, and only when the frame has solid corners.
    pub fn frame_edge(&self, pos: IVec3) -> Option<FrameEdge> {
        let depth_axis = self.depth_axis();
        if depth_axis.of(pos) != depth_axis.of(self.lower) {
            return None;
        }
        let h = self.axis.of(pos);
        let (h_lo, h_hi) = (self.axis.of(self.lower), self.axis.of(self.upper));
        let (y_lo, y_hi) = (self.lower.y, self.upper.y);
        let inside_h = (h_lo..=h_hi).contains(&h);
        let inside_y = (y_lo..=y_hi).contains(&pos.y);
        let corner_h = h == h_lo - 1 || h == h_hi + 1;

        if pos.y == y_lo - 1 && (inside_h || (corner_h && self.has_corners)) {
            Some(FrameEdge::Bottom)
        } else if pos.y == y_hi + 1 && (inside_h || (corner_h && self.has_corners)) {
            Some(FrameEdge::Top)
        } else if h == h_lo - 1 && inside_y {
            Some(FrameEdge::Left)
        } else if h == h_hi + 1 && inside_y {
            Some(FrameEdge::Right)
        } else {
            None
        }
    }

    /// Midpoint of an edge, inset slightly into the aperture, at mid-depth.
    pub fn tangent_point(&self, edge: FrameEdge) -> Vec3 {
        let lo = self.lower.as_vec3();
        let hi = (self.upper + IVec3::ONE).as_vec3();
        let mid = (lo + hi) * 0.5;
        let mut point = mid;
        match edge {
            FrameEdge::Bottom => point.y = lo.y + TANGENT_INSET,
            FrameEdge::Top => point.y = hi.y - TANGENT_INSET,
            FrameEdge::Left => self.axis.set_f32(&mut point, self.axis.of_f32(lo) + TANGENT_INSET),
            FrameEdge::Right => self.axis.set_f32(&mut point, self.axis.of_f32(hi) - TANGENT_INSET),
        }
        point
    }

    /// Frame edge whose tangent point is closest to `eye`.
    pub fn nearest_edge(&self, eye: Vec3) -> FrameEdge {
        let mut best = FrameEdge::Bottom;
        let mut best_distance = f32::INFINITY;
        for edge in FrameEdge::ALL {
            let distance = self.tangent_point(edge).distance_squared(eye);
            if distance < best_distance {
                best = edge;
                best_distance = distance;
            }
        }
        best
    }

    /// Destination-side cells this portal's own structure occupies, used to
    /// avoid mirroring a portal into itself.
    pub fn occupies_frame_or_aperture(&self, pos: IVec3) -> bool {
        self.contains_aperture_cell(pos) || self.frame_edge(pos).is_some()
    }
}

/// Portals known to one client.
#[derive(Debug)]
pub struct PortalRegistry {
    portals: FxHashMap<PortalKey, Portal>,
    grace_ticks: i64,
    render_distance: f32,
    last_decay: Option<u64>,
}

impl PortalRegistry {
    pub fn new(grace_ticks: i64, render_distance: f32) -> Self {
        Self {
            portals: FxHashMap::default(),
            grace_ticks,
            render_distance,
            last_decay: None,
        }
    }

    pub fn len(&self) -> usize {
        self.portals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.portals.is_empty()
    }

    pub fn get(&self, key: PortalKey) -> Option<&Portal> {
        self.portals.get(&key)
    }

    /// Portals in a stable order.
    pub fn portals(&self) -> Vec<&Portal> {
        let mut portals: Vec<&Portal> = self.portals.values().collect();
        portals.sort_by_key(|portal| (portal.key.x, portal.key.y, portal.key.z));
        portals
    }

    pub fn clear(&mut self) {
        self.portals.clear();
        self.last_decay = None;
    }

    pub fn insert(&mut self, portal: Portal) {
        self.portals.insert(portal.key, portal);
    }

    /// Groups `markers` into connected structures and registers new ones.
    /// Known structures get their grace period refreshed. Returns the number
    /// of portals added.
    pub fn scan(
        &mut self,
        markers: &[IVec3],
        source: &mut VoxelSnapshotView,
        destination: &mut VoxelSnapshotView,
        linker: &dyn PortalLinker,
        blocks: &BlockRegistry,
        eye: Vec3,
    ) -> usize {
        let range_sq = self.render_distance * self.render_distance;
        let mut remaining: FxHashSet<IVec3> = markers
            .iter()
            .copied()
            .filter(|pos| (pos.as_vec3() + Vec3::splat(0.5)).distance_squared(eye) <= range_sq)
            .filter(|pos| portal_axis(source.block(*pos)).is_some())
            .collect();

        let mut seeds: Vec<IVec3> = remaining.iter().copied().collect();
        seeds.sort_by_key(|pos| (pos.x, pos.y, pos.z));

        let mut added = 0;
        for seed in seeds {
            if !remaining.remove(&seed) {
                continue;
            }
            let component = take_component(seed, &mut remaining);
            let lower = component.iter().fold(seed, |acc, pos| acc.min(*pos));
            let upper = component.iter().fold(seed, |acc, pos| acc.max(*pos));

            if let Some(known) = self.portals.get_mut(&lower) {
                known.grace = self.grace_ticks;
                continue;
            }

            let Some(axis) = portal_axis(source.block(seed)) else {
                continue;
            };
            let depth_axis = axis.horizontal_perpendicular();
            if depth_axis.of(lower) != depth_axis.of(upper) {
                debug!("Ignoring non-flat portal structure at {lower:?}");
                continue;
            }

            let shape = PortalShape { lower, upper, axis };
            let Some(transform) = linker.link(&shape, destination) else {
                debug!("No destination for portal at {lower:?}; retrying next scan");
                continue;
            };

            let has_corners = corner_cells(&shape)
                .into_iter()
                .all(|pos| blocks.is_solid(source.block(pos)));
            info!(
                "Discovered {}x{} portal at {lower:?} (axis {axis:?}, rotation {}°)",
                shape.width(),
                shape.height(),
                transform.rotation().degrees()
            );
            self.portals
                .insert(lower, Portal::new(shape, has_corners, transform, self.grace_ticks));
            added += 1;
        }
        added
    }

    /// Ages every portal by the ticks elapsed since the last call and evicts
    /// expired or out-of-range ones. Returns the evicted keys.
    pub fn decay(&mut self, tick: u64, eye: Vec3) -> Vec<PortalKey> {
        let elapsed = self
            .last_decay
            .map_or(0, |last| tick.saturating_sub(last)) as i64;
        self.last_decay = Some(tick);

        let render_distance = self.render_distance;
        let mut evicted = Vec::new();
        self.portals.retain(|key, portal| {
            portal.grace -= elapsed;
            let keep = portal.grace > 0 && portal.center().distance(eye) <= render_distance;
            if !keep {
                evicted.push(*key);
            }
            keep
        });
        for key in &evicted {
            debug!("Evicted portal at {key:?}");
        }
        evicted
    }
}

fn take_component(seed: IVec3, remaining: &mut FxHashSet<IVec3>) -> Vec<IVec3> {
    let mut component = vec![seed];
    let mut queue = VecDeque::from([seed]);
    while let Some(pos) = queue.pop_front() {
        for offset in NEIGHBOURS {
            let next = pos + offset;
            if remaining.remove(&next) {
                component.push(next);
                queue.push_back(next);
            }
        }
    }
    component
}

fn corner_cells(shape: &PortalShape) -> [IVec3; 4] {
    let step = shape.axis.unit();
    let bottom_lo = shape.lower - step - IVec3::Y;
    let bottom_hi = shape.lower + step * shape.width() - IVec3::Y;
    let rise = IVec3::Y * (shape.height() + 1);
    [bottom_lo, bottom_hi, bottom_lo + rise, bottom_hi + rise]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::{IVec3, Vec3};
    use rift_shared::block::register_default_blocks;
    use rift_shared::coords::Axis;

    use super::{FrameEdge, Portal, PortalRegistry};
    use crate::host::WorldId;
    use crate::linker::{MatchingPortalLinker, PortalLinker, PortalShape};
    use crate::snapshot::VoxelSnapshotView;
    use crate::testkit::{build_portal, portal_cells, MemoryStore};
    use crate::transform::{CoordinateTransform, Rotation};

    fn linked_worlds() -> (VoxelSnapshotView, VoxelSnapshotView) {
        let mut source = MemoryStore::new();
        build_portal(&mut source, IVec3::new(0, 64, 0), Axis::X, 2, 3, true);
        let mut destination = MemoryStore::new();
        build_portal(&mut destination, IVec3::new(100, 64, 0), Axis::X, 2, 3, true);
        (
            VoxelSnapshotView::new(WorldId(0), Arc::new(source)),
            VoxelSnapshotView::new(WorldId(1), Arc::new(destination)),
        )
    }

    fn portal() -> Portal {
        Portal::new(
            PortalShape {
                lower: IVec3::new(0, 64, 0),
                upper: IVec3::new(1, 66, 0),
                axis: Axis::X,
            },
            false,
            CoordinateTransform::new(IVec3::new(0, 64, 0), IVec3::new(100, 64, 0), Rotation::None),
            90,
        )
    }

    #[test]
    fn scan_groups_markers_into_one_portal() {
        let (mut source, mut destination) = linked_worlds();
        let linker = MatchingPortalLinker::new(IVec3::new(100, 0, 0), 8);
        let blocks = register_default_blocks();
        let mut registry = PortalRegistry::new(90, 64.0);

        let markers = portal_cells(IVec3::new(0, 64, 0), Axis::X, 2, 3);
        let eye = Vec3::new(1.0, 65.5, -5.0);
        assert_eq!(registry.scan(&markers, &mut source, &mut destination, &linker, &blocks, eye), 1);

        let portal = registry.get(IVec3::new(0, 64, 0)).expect("registered");
        assert_eq!(portal.upper, IVec3::new(1, 66, 0));
        assert_eq!(portal.axis, Axis::X);
        assert!(portal.has_corners);
        assert_eq!(portal.transform.destination_anchor(), IVec3::new(100, 64, 0));

        // Rescanning the same structure only refreshes it.
        assert_eq!(registry.scan(&markers, &mut source, &mut destination, &linker, &blocks, eye), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_markers_and_distant_structures_are_ignored() {
        let (mut source, mut destination) = linked_worlds();
        let linker = MatchingPortalLinker::new(IVec3::new(100, 0, 0), 8);
        let blocks = register_default_blocks();
        let mut registry = PortalRegistry::new(90, 16.0);

        let stale = [IVec3::new(5, 70, 5)];
        assert_eq!(registry.scan(&stale, &mut source, &mut destination, &linker, &blocks, Vec3::ZERO), 0);

        let markers = portal_cells(IVec3::new(0, 64, 0), Axis::X, 2, 3);
        let far_eye = Vec3::new(200.0, 65.0, 0.0);
        assert_eq!(registry.scan(&markers, &mut source, &mut destination, &linker, &blocks, far_eye), 0);
        assert!(registry.is_empty());
    }

    struct NeverLinks;

    impl PortalLinker for NeverLinks {
        fn link(&self, _: &PortalShape, _: &mut VoxelSnapshotView) -> Option<CoordinateTransform> {
            None
        }
    }

    #[test]
    fn failed_link_is_retried_on_the_next_scan() {
        let (mut source, mut destination) = linked_worlds();
        let blocks = register_default_blocks();
        let mut registry = PortalRegistry::new(90, 64.0);
        let markers = portal_cells(IVec3::new(0, 64, 0), Axis::X, 2, 3);
        let eye = Vec3::new(1.0, 65.5, -5.0);

        assert_eq!(registry.scan(&markers, &mut source, &mut destination, &NeverLinks, &blocks, eye), 0);
        assert!(registry.is_empty());

        let linker = MatchingPortalLinker::new(IVec3::new(100, 0, 0), 8);
        assert_eq!(registry.scan(&markers, &mut source, &mut destination, &linker, &blocks, eye), 1);
    }

    #[test]
    fn grace_absorbs_missed_scans_then_evicts() {
        let mut registry = PortalRegistry::new(90, 64.0);
        registry.insert(portal());
        let eye = Vec3::new(1.0, 65.5, -5.0);

        assert!(registry.decay(0, eye).is_empty());
        assert!(registry.decay(60, eye).is_empty());
        assert_eq!(registry.decay(89, eye), Vec::<IVec3>::new());
        assert_eq!(registry.decay(90, eye), vec![IVec3::new(0, 64, 0)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn walking_out_of_range_evicts_immediately() {
        let mut registry = PortalRegistry::new(90, 64.0);
        registry.insert(portal());
        assert!(registry.decay(1, Vec3::new(1.0, 65.5, -5.0)).is_empty());
        assert_eq!(registry.decay(2, Vec3::new(1.0, 65.5, -80.0)).len(), 1);
    }

    #[test]
    fn frame_edges_and_tangent_points() {
        let mut portal = portal();
        assert_eq!(portal.frame_edge(IVec3::new(1, 63, 0)), Some(FrameEdge::Bottom));
        assert_eq!(portal.frame_edge(IVec3::new(0, 67, 0)), Some(FrameEdge::Top));
        assert_eq!(portal.frame_edge(IVec3::new(-1, 65, 0)), Some(FrameEdge::Left));
        assert_eq!(portal.frame_edge(IVec3::new(2, 64, 0)), Some(FrameEdge::Right));
        assert_eq!(portal.frame_edge(IVec3::new(2, 67, 0)), None);
        assert_eq!(portal.frame_edge(IVec3::new(1, 63, 1)), None);
        assert_eq!(portal.frame_edge(IVec3::new(1, 65, 0)), None);

        portal.has_corners = true;
        assert_eq!(portal.frame_edge(IVec3::new(2, 67, 0)), Some(FrameEdge::Top));

        let bottom = portal.tangent_point(FrameEdge::Bottom);
        assert!((bottom - Vec3::new(1.0, 64.1, 0.5)).length() < 1e-5);
        let right = portal.tangent_point(FrameEdge::Right);
        assert!((right - Vec3::new(1.9, 65.5, 0.5)).length() < 1e-5);
        assert_eq!(portal.nearest_edge(Vec3::new(1.0, 20.0, -3.0)), FrameEdge::Bottom);
        assert_eq!(portal.nearest_edge(Vec3::new(-9.0, 65.5, -1.0)), FrameEdge::Left);
        assert_eq!(FrameEdge::Top.opposite(), FrameEdge::Bottom);
    }
}
