use std::ops::{Add, Sub};

use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Edge length of a chunk section. Batched cell updates are scoped to one
/// section.
pub const CHUNK_SIZE: usize = 16;
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl ChunkPos {
    pub fn containing(world_pos: IVec3) -> Self {
        world_to_chunk(world_pos).0
    }

    /// Chebyshev distance on the horizontal plane, in chunks.
    pub fn horizontal_distance(self, other: ChunkPos) -> i32 {
        (self.x - other.x).abs().max((self.z - other.z).abs())
    }
}

impl Add for ChunkPos {
    type Output = ChunkPos;

    fn add(self, rhs: Self) -> Self::Output {
        ChunkPos {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Sub for ChunkPos {
    type Output = ChunkPos;

    fn sub(self, rhs: Self) -> Self::Output {
        ChunkPos {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

fn div_rem_floor(value: i32, divisor: i32) -> (i32, i32) {
    (value.div_euclid(divisor), value.rem_euclid(divisor))
}

pub fn world_to_chunk(world_pos: IVec3) -> (ChunkPos, LocalPos) {
    let size = CHUNK_SIZE as i32;

    let (chunk_x, local_x) = div_rem_floor(world_pos.x, size);
    let (chunk_y, local_y) = div_rem_floor(world_pos.y, size);
    let (chunk_z, local_z) = div_rem_floor(world_pos.z, size);

    (
        ChunkPos {
            x: chunk_x,
            y: chunk_y,
            z: chunk_z,
        },
        LocalPos {
            x: local_x as u8,
            y: local_y as u8,
            z: local_z as u8,
        },
    )
}

pub fn chunk_to_world(chunk_pos: ChunkPos, local: LocalPos) -> IVec3 {
    let size = CHUNK_SIZE as i32;
    IVec3::new(
        chunk_pos.x * size + i32::from(local.x),
        chunk_pos.y * size + i32::from(local.y),
        chunk_pos.z * size + i32::from(local.z),
    )
}

pub fn local_to_index(local: LocalPos) -> usize {
    usize::from(local.x)
        + usize::from(local.z) * CHUNK_SIZE
        + usize::from(local.y) * CHUNK_SIZE * CHUNK_SIZE
}

pub fn index_to_local(index: usize) -> LocalPos {
    assert!(index < CHUNK_VOLUME, "chunk index out of bounds: {index}");

    let y = index / (CHUNK_SIZE * CHUNK_SIZE);
    let rem = index % (CHUNK_SIZE * CHUNK_SIZE);
    let z = rem / CHUNK_SIZE;
    let x = rem % CHUNK_SIZE;

    LocalPos {
        x: x as u8,
        y: y as u8,
        z: z as u8,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn unit(self) -> IVec3 {
        match self {
            Axis::X => IVec3::X,
            Axis::Y => IVec3::Y,
            Axis::Z => IVec3::Z,
        }
    }

    pub fn of(self, v: IVec3) -> i32 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }

    pub fn of_f32(self, v: Vec3) -> f32 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }

    pub fn set(self, v: &mut IVec3, value: i32) {
        match self {
            Axis::X => v.x = value,
            Axis::Y => v.y = value,
            Axis::Z => v.z = value,
        }
    }

    pub fn set_f32(self, v: &mut Vec3, value: f32) {
        match self {
            Axis::X => v.x = value,
            Axis::Y => v.y = value,
            Axis::Z => v.z = value,
        }
    }

    /// The other horizontal axis. `Y` has no horizontal partner and maps to itself.
    pub fn horizontal_perpendicular(self) -> Axis {
        match self {
            Axis::X => Axis::Z,
            Axis::Z => Axis::X,
            Axis::Y => Axis::Y,
        }
    }

    /// The two axes other than `self`, in X, Y, Z order.
    pub fn others(self) -> (Axis, Axis) {
        match self {
            Axis::X => (Axis::Y, Axis::Z),
            Axis::Y => (Axis::X, Axis::Z),
            Axis::Z => (Axis::X, Axis::Y),
        }
    }
}

/// Horizontal facing. North is -Z, east is +X.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facing {
    North,
    East,
    South,
    West,
}

impl Facing {
    pub const ALL: [Facing; 4] = [Facing::North, Facing::East, Facing::South, Facing::West];

    pub fn index(self) -> u16 {
        match self {
            Facing::North => 0,
            Facing::East => 1,
            Facing::South => 2,
            Facing::West => 3,
        }
    }

    pub fn from_index(index: u16) -> Facing {
        Facing::ALL[usize::from(index % 4)]
    }

    pub fn offset(self) -> IVec3 {
        match self {
            Facing::North => IVec3::NEG_Z,
            Facing::East => IVec3::X,
            Facing::South => IVec3::Z,
            Facing::West => IVec3::NEG_X,
        }
    }

    pub fn from_offset(offset: IVec3) -> Option<Facing> {
        Facing::ALL.into_iter().find(|facing| facing.offset() == offset)
    }

    pub fn axis(self) -> Axis {
        match self {
            Facing::North | Facing::South => Axis::Z,
            Facing::East | Facing::West => Axis::X,
        }
    }
}
