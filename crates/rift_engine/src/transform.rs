use std::f32::consts::{FRAC_PI_2, PI, TAU};

use glam::{IVec3, Vec3};
use rift_shared::block::{facing_of, portal_axis, portal_block_for_axis, with_facing, BlockId};
use rift_shared::coords::{Axis, Facing};

/// Discrete rotation about the vertical axis. Clockwise turns east into
/// south when seen from above.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    None,
    Clockwise,
    CounterClockwise,
    Half,
}

impl Rotation {
    /// Folds any multiple of 90 degrees into one of the four rotations;
    /// anything else has no discrete equivalent.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        Some(Self::from_quarter_turns(degrees / 90))
    }

    fn from_quarter_turns(turns: i32) -> Self {
        match turns.rem_euclid(4) {
            0 => Rotation::None,
            1 => Rotation::Clockwise,
            2 => Rotation::Half,
            _ => Rotation::CounterClockwise,
        }
    }

    fn quarter_turns(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise => 1,
            Rotation::Half => 2,
            Rotation::CounterClockwise => 3,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise => 90,
            Rotation::CounterClockwise => -90,
            Rotation::Half => 180,
        }
    }

    pub fn radians(self) -> f32 {
        match self {
            Rotation::None => 0.0,
            Rotation::Clockwise => FRAC_PI_2,
            Rotation::CounterClockwise => -FRAC_PI_2,
            Rotation::Half => PI,
        }
    }

    pub fn inverse(self) -> Self {
        Self::from_quarter_turns(-self.quarter_turns())
    }

    pub fn then(self, other: Rotation) -> Self {
        Self::from_quarter_turns(self.quarter_turns() + other.quarter_turns())
    }

    /// Rotation that turns `from` into `to`.
    pub fn between(from: Facing, to: Facing) -> Self {
        Self::from_quarter_turns(i32::from(to.index()) - i32::from(from.index()))
    }

    pub fn rotate_ivec(self, v: IVec3) -> IVec3 {
        match self {
            Rotation::None => v,
            Rotation::Clockwise => IVec3::new(-v.z, v.y, v.x),
            Rotation::CounterClockwise => IVec3::new(v.z, v.y, -v.x),
            Rotation::Half => IVec3::new(-v.x, v.y, -v.z),
        }
    }

    pub fn rotate_vec(self, v: Vec3) -> Vec3 {
        match self {
            Rotation::None => v,
            Rotation::Clockwise => Vec3::new(-v.z, v.y, v.x),
            Rotation::CounterClockwise => Vec3::new(v.z, v.y, -v.x),
            Rotation::Half => Vec3::new(-v.x, v.y, -v.z),
        }
    }

    pub fn rotate_facing(self, facing: Facing) -> Facing {
        Facing::from_index((facing.index() + self.quarter_turns() as u16) % 4)
    }

    pub fn rotate_axis(self, axis: Axis) -> Axis {
        match self {
            Rotation::Clockwise | Rotation::CounterClockwise => axis.horizontal_perpendicular(),
            _ => axis,
        }
    }

    pub fn rotate_block(self, block: BlockId) -> BlockId {
        if let Some(facing) = facing_of(block) {
            return with_facing(block, self.rotate_facing(facing));
        }
        match portal_axis(block) {
            Some(axis) => portal_block_for_axis(self.rotate_axis(axis)),
            None => block,
        }
    }
}

/// Wraps an angle into (-PI, PI].
pub fn normalize_yaw(yaw: f32) -> f32 {
    let wrapped = yaw.rem_euclid(TAU);
    if wrapped > PI {
        wrapped - TAU
    } else {
        wrapped
    }
}

/// Maps source space onto destination space: the source anchor cell lands on
/// the destination anchor cell and everything else rotates around it.
/// Vertical coordinates are a pure offset.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CoordinateTransform {
    source: IVec3,
    destination: IVec3,
    rotation: Rotation,
}

impl CoordinateTransform {
    pub fn new(source: IVec3, destination: IVec3, rotation: Rotation) -> Self {
        Self {
            source,
            destination,
            rotation,
        }
    }

    pub fn source_anchor(&self) -> IVec3 {
        self.source
    }

    pub fn destination_anchor(&self) -> IVec3 {
        self.destination
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn inverse(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            rotation: self.rotation.inverse(),
        }
    }

    pub fn transform_block(&self, pos: IVec3) -> IVec3 {
        self.destination + self.rotation.rotate_ivec(pos - self.source)
    }

    pub fn untransform_block(&self, pos: IVec3) -> IVec3 {
        self.source + self.rotation.inverse().rotate_ivec(pos - self.destination)
    }

    pub fn transform_position(&self, pos: Vec3) -> Vec3 {
        anchor_center(self.destination)
            + self.rotation.rotate_vec(pos - anchor_center(self.source))
    }

    pub fn untransform_position(&self, pos: Vec3) -> Vec3 {
        anchor_center(self.source)
            + self
                .rotation
                .inverse()
                .rotate_vec(pos - anchor_center(self.destination))
    }

    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation.rotate_vec(v)
    }

    pub fn untransform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation.inverse().rotate_vec(v)
    }

    pub fn transform_yaw(&self, yaw: f32) -> f32 {
        normalize_yaw(yaw + self.rotation.radians())
    }

    pub fn untransform_yaw(&self, yaw: f32) -> f32 {
        normalize_yaw(yaw - self.rotation.radians())
    }

    /// Source-space block state as it appears on the destination side.
    pub fn rotate_state(&self, block: BlockId) -> BlockId {
        self.rotation.rotate_block(block)
    }

    /// Destination-space block state as it must appear on the source side.
    pub fn unrotate_state(&self, block: BlockId) -> BlockId {
        self.rotation.inverse().rotate_block(block)
    }

    pub fn rotate_direction(&self, facing: Facing) -> Facing {
        self.rotation.rotate_facing(facing)
    }
}

// Rotation pivots on the anchor cell's vertical centre line.
fn anchor_center(anchor: IVec3) -> Vec3 {
    anchor.as_vec3() + Vec3::new(0.5, 0.0, 0.5)
}
