use std::collections::HashMap;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::coords::{Axis, Facing};

#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: Self = Self(0);
    pub const STONE: Self = Self(1);
    pub const GRASS: Self = Self(2);
    pub const DIRT: Self = Self(3);
    pub const PLANKS: Self = Self(4);
    pub const GLASS: Self = Self(5);
    pub const OBSIDIAN: Self = Self(6);
    pub const PORTAL_X: Self = Self(7);
    pub const PORTAL_Z: Self = Self(8);
    pub const TORCH: Self = Self(9);
    pub const BLACK_CONCRETE: Self = Self(10);
    pub const GRAY_CONCRETE: Self = Self(11);
    pub const BEDROCK: Self = Self(12);
    pub const LEAVES: Self = Self(13);
    pub const SAND: Self = Self(14);
    pub const COBBLESTONE: Self = Self(15);
    pub const STAIRS_NORTH: Self = Self(16);
    pub const STAIRS_EAST: Self = Self(17);
    pub const STAIRS_SOUTH: Self = Self(18);
    pub const STAIRS_WEST: Self = Self(19);
    pub const LADDER_NORTH: Self = Self(20);
    pub const LADDER_EAST: Self = Self(21);
    pub const LADDER_SOUTH: Self = Self(22);
    pub const LADDER_WEST: Self = Self(23);
    pub const SIGN_NORTH: Self = Self(24);
    pub const SIGN_EAST: Self = Self(25);
    pub const SIGN_SOUTH: Self = Self(26);
    pub const SIGN_WEST: Self = Self(27);
    pub const CHEST_NORTH: Self = Self(28);
    pub const CHEST_EAST: Self = Self(29);
    pub const CHEST_SOUTH: Self = Self(30);
    pub const CHEST_WEST: Self = Self(31);
    pub const FURNACE_NORTH: Self = Self(32);
    pub const FURNACE_EAST: Self = Self(33);
    pub const FURNACE_SOUTH: Self = Self(34);
    pub const FURNACE_WEST: Self = Self(35);

    /// Material shown past the atmosphere radius.
    pub const EDGE: Self = Self::BLACK_CONCRETE;
    /// Material of the thin band just inside the atmosphere radius.
    pub const EDGE_TRANSITION: Self = Self::GRAY_CONCRETE;
}

const ORIENTABLE_FIRST: u16 = BlockId::STAIRS_NORTH.0;
const ORIENTABLE_LAST: u16 = BlockId::FURNACE_WEST.0;

pub fn is_portal_block(block: BlockId) -> bool {
    matches!(block, BlockId::PORTAL_X | BlockId::PORTAL_Z)
}

/// Content axis of a portal substance block: the axis along which the
/// aperture is wide.
pub fn portal_axis(block: BlockId) -> Option<Axis> {
    match block {
        BlockId::PORTAL_X => Some(Axis::X),
        BlockId::PORTAL_Z => Some(Axis::Z),
        _ => None,
    }
}

pub fn portal_block_for_axis(axis: Axis) -> BlockId {
    match axis {
        Axis::Z => BlockId::PORTAL_Z,
        _ => BlockId::PORTAL_X,
    }
}

pub fn is_orientable(block: BlockId) -> bool {
    (ORIENTABLE_FIRST..=ORIENTABLE_LAST).contains(&block.0)
}

/// Orientable families are four consecutive ids in N, E, S, W order.
pub fn facing_of(block: BlockId) -> Option<Facing> {
    is_orientable(block).then(|| Facing::from_index((block.0 - ORIENTABLE_FIRST) % 4))
}

pub fn with_facing(block: BlockId, facing: Facing) -> BlockId {
    if !is_orientable(block) {
        return block;
    }
    let family_base = block.0 - (block.0 - ORIENTABLE_FIRST) % 4;
    BlockId(family_base + facing.index())
}

pub fn is_sign(block: BlockId) -> bool {
    (BlockId::SIGN_NORTH.0..=BlockId::SIGN_WEST.0).contains(&block.0)
}

pub fn is_container(block: BlockId) -> bool {
    (BlockId::CHEST_NORTH.0..=BlockId::FURNACE_WEST.0).contains(&block.0)
}

pub fn has_block_entity(block: BlockId) -> bool {
    is_sign(block) || is_container(block)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockProperties {
    pub name: String,
    pub solid: bool,
    pub transparent: bool,
}

impl BlockProperties {
    pub fn is_opaque(&self) -> bool {
        self.solid && !self.transparent
    }
}

#[derive(Default, Debug, Clone)]
pub struct BlockRegistry {
    properties: Vec<BlockProperties>,
    by_name: HashMap<String, BlockId>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            properties: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, props: BlockProperties) -> BlockId {
        if let Some(existing) = self.by_name.get(props.name.as_str()) {
            return *existing;
        }

        let id = BlockId(self.properties.len() as u16);
        self.by_name.insert(props.name.clone(), id);
        self.properties.push(props);
        id
    }

    pub fn get_properties(&self, id: BlockId) -> Option<&BlockProperties> {
        self.properties.get(usize::from(id.0))
    }

    pub fn get_by_name(&self, name: &str) -> Option<BlockId> {
        self.by_name.get(name).copied()
    }

    /// Unknown ids are treated as see-through.
    pub fn is_opaque(&self, id: BlockId) -> bool {
        self.get_properties(id)
            .is_some_and(BlockProperties::is_opaque)
    }

    pub fn is_solid(&self, id: BlockId) -> bool {
        self.get_properties(id).is_some_and(|props| props.solid)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

pub fn register_default_blocks() -> BlockRegistry {
    fn block(name: &str, solid: bool, transparent: bool) -> BlockProperties {
        BlockProperties {
            name: name.to_string(),
            solid,
            transparent,
        }
    }

    let mut registry = BlockRegistry::new();
    let blocks = [
        block("air", false, true),             // 0
        block("stone", true, false),           // 1
        block("grass", true, false),           // 2
        block("dirt", true, false),            // 3
        block("planks", true, false),          // 4
        block("glass", true, true),            // 5
        block("obsidian", true, false),        // 6
        block("portal_x", false, true),        // 7
        block("portal_z", false, true),        // 8
        block("torch", false, true),           // 9
        block("black_concrete", true, false),  // 10
        block("gray_concrete", true, false),   // 11
        block("bedrock", true, false),         // 12
        block("leaves", true, true),           // 13
        block("sand", true, false),            // 14
        block("cobblestone", true, false),     // 15
        block("stairs_north", true, true),     // 16
        block("stairs_east", true, true),      // 17
        block("stairs_south", true, true),     // 18
        block("stairs_west", true, true),      // 19
        block("ladder_north", false, true),    // 20
        block("ladder_east", false, true),     // 21
        block("ladder_south", false, true),    // 22
        block("ladder_west", false, true),     // 23
        block("sign_north", false, true),      // 24
        block("sign_east", false, true),       // 25
        block("sign_south", false, true),      // 26
        block("sign_west", false, true),       // 27
        block("chest_north", true, true),      // 28
        block("chest_east", true, true),       // 29
        block("chest_south", true, true),      // 30
        block("chest_west", true, true),       // 31
        block("furnace_north", true, false),   // 32
        block("furnace_east", true, false),    // 33
        block("furnace_south", true, false),   // 34
        block("furnace_west", true, false),    // 35
    ];
    for props in blocks {
        registry.register(props);
    }
    registry
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BlockEntityData {
    Sign { lines: [String; 4] },
    Container { title: String, slots: Vec<Option<(u16, u8)>> },
}

/// Extended cell data attached to a block, addressed by its world position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockEntity {
    pub pos: IVec3,
    pub data: BlockEntityData,
}

impl BlockEntity {
    /// Copies this block entity into another world context at `pos`, going
    /// through the same serialized form the host persists.
    pub fn rehome(&self, pos: IVec3) -> Result<Self, bincode::Error> {
        let bytes = bincode::serialize(&self.data)?;
        let data = bincode::deserialize(&bytes)?;
        Ok(Self { pos, data })
    }
}
