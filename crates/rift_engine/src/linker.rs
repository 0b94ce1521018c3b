use std::collections::VecDeque;

use glam::IVec3;
use rift_shared::block::{is_portal_block, portal_axis};
use rift_shared::coords::Axis;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::snapshot::VoxelSnapshotView;
use crate::transform::{CoordinateTransform, Rotation};

/// Bounding box and content axis of a connected portal structure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortalShape {
    pub lower: IVec3,
    pub upper: IVec3,
    pub axis: Axis,
}

impl PortalShape {
    pub fn width(&self) -> i32 {
        self.axis.of(self.upper - self.lower) + 1
    }

    pub fn height(&self) -> i32 {
        self.upper.y - self.lower.y + 1
    }
}

/// Finds where a source structure leads. Returning `None` leaves the portal
/// unlinked until the next discovery scan.
pub trait PortalLinker: Send + Sync {
    fn link(
        &self,
        shape: &PortalShape,
        destination: &mut VoxelSnapshotView,
    ) -> Option<CoordinateTransform>;
}

/// Links to the nearest destination structure of the same size around the
/// expected position `shape.lower + offset`.
pub struct MatchingPortalLinker {
    offset: IVec3,
    search_radius: i32,
}

impl MatchingPortalLinker {
    pub fn new(offset: IVec3, search_radius: i32) -> Self {
        Self {
            offset,
            search_radius: search_radius.max(0),
        }
    }
}

impl PortalLinker for MatchingPortalLinker {
    fn link(
        &self,
        shape: &PortalShape,
        destination: &mut VoxelSnapshotView,
    ) -> Option<CoordinateTransform> {
        let expected = shape.lower + self.offset;
        let r = self.search_radius;
        let (min_y, max_y) = destination.height_range();

        let mut nearest: Option<(i32, IVec3)> = None;
        for y in (expected.y - r).max(min_y)..=(expected.y + r).min(max_y - 1) {
            for z in expected.z - r..=expected.z + r {
                for x in expected.x - r..=expected.x + r {
                    let pos = IVec3::new(x, y, z);
                    if !is_portal_block(destination.block(pos)) {
                        continue;
                    }
                    let distance = (pos - expected).length_squared();
                    if nearest.map_or(true, |(best, _)| distance < best) {
                        nearest = Some((distance, pos));
                    }
                }
            }
        }

        let (_, seed) = nearest?;
        let limit = (shape.width().max(shape.height()) + 2) as usize;
        let found = flood_structure(destination, seed, limit * limit)?;
        if found.width() != shape.width() || found.height() != shape.height() {
            debug!(
                "Destination structure at {:?} is {}x{}, expected {}x{}",
                found.lower,
                found.width(),
                found.height(),
                shape.width(),
                shape.height()
            );
            return None;
        }

        let rotation = if found.axis == shape.axis {
            Rotation::None
        } else {
            Rotation::Clockwise
        };
        // The rotated source box may extend into negative offsets from the
        // anchor; shift the anchor so it still lands on the found box.
        let extent = rotation.rotate_ivec(shape.upper - shape.lower);
        let anchor = found.lower - extent.min(IVec3::ZERO);
        Some(CoordinateTransform::new(shape.lower, anchor, rotation))
    }
}

/// Breadth-first search over portal blocks connected to `seed`. Gives up on
/// structures larger than `max_cells` or that are not flat.
pub fn flood_structure(
    view: &mut VoxelSnapshotView,
    seed: IVec3,
    max_cells: usize,
) -> Option<PortalShape> {
    let axis = portal_axis(view.block(seed))?;
    let mut seen = FxHashSet::default();
    let mut queue = VecDeque::from([seed]);
    seen.insert(seed);
    let (mut lower, mut upper) = (seed, seed);

    while let Some(pos) = queue.pop_front() {
        lower = lower.min(pos);
        upper = upper.max(pos);
        for offset in NEIGHBOURS {
            let next = pos + offset;
            if seen.contains(&next) || !is_portal_block(view.block(next)) {
                continue;
            }
            if seen.len() >= max_cells {
                return None;
            }
            seen.insert(next);
            queue.push_back(next);
        }
    }

    let depth_axis = axis.horizontal_perpendicular();
    if depth_axis.of(upper) != depth_axis.of(lower) {
        return None;
    }
    Some(PortalShape { lower, upper, axis })
}

pub(crate) const NEIGHBOURS: [IVec3; 6] = [
    IVec3::X,
    IVec3::NEG_X,
    IVec3::Y,
    IVec3::NEG_Y,
    IVec3::Z,
    IVec3::NEG_Z,
];
