use std::collections::HashMap;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::block::{has_block_entity, BlockEntity, BlockId};
use crate::coords::{local_to_index, world_to_chunk, LocalPos, CHUNK_VOLUME};

#[derive(Clone, Debug)]
pub struct ChunkData {
    pub blocks: Box<[BlockId; CHUNK_VOLUME]>,
    pub block_entities: HashMap<LocalPos, BlockEntity>,
}

impl ChunkData {
    pub fn new_empty() -> Self {
        Self::new_filled(BlockId::AIR)
    }

    pub fn new_filled(block: BlockId) -> Self {
        Self {
            blocks: Box::new([block; CHUNK_VOLUME]),
            block_entities: HashMap::new(),
        }
    }

    pub fn get(&self, local: LocalPos) -> BlockId {
        self.blocks[local_to_index(local)]
    }

    /// Sets a block. A block entity at `local` is dropped when the new block
    /// cannot carry one.
    pub fn set(&mut self, local: LocalPos, block: BlockId) {
        let index = local_to_index(local);
        self.blocks[index] = block;
        if !has_block_entity(block) {
            self.block_entities.remove(&local);
        }
    }

    pub fn get_index(&self, index: usize) -> BlockId {
        self.blocks[index]
    }

    pub fn set_index(&mut self, index: usize, block: BlockId) {
        self.blocks[index] = block;
    }

    pub fn block_entity(&self, local: LocalPos) -> Option<&BlockEntity> {
        self.block_entities.get(&local)
    }

    pub fn set_block_entity(&mut self, entity: BlockEntity) {
        let (_, local) = world_to_chunk(entity.pos);
        self.block_entities.insert(local, entity);
    }

    pub fn is_uniform(&self, block: BlockId) -> bool {
        self.blocks.iter().all(|candidate| *candidate == block)
    }
}

impl Default for ChunkData {
    fn default() -> Self {
        Self::new_empty()
    }
}

#[derive(Serialize)]
struct ChunkRepr<'a> {
    blocks: &'a [BlockId],
    block_entities: Vec<&'a BlockEntity>,
}

#[derive(Deserialize)]
struct OwnedChunkRepr {
    blocks: Vec<BlockId>,
    block_entities: Vec<BlockEntity>,
}

impl Serialize for ChunkData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut block_entities: Vec<&BlockEntity> = self.block_entities.values().collect();
        block_entities.sort_by_key(|entity| (entity.pos.x, entity.pos.y, entity.pos.z));
        ChunkRepr {
            blocks: self.blocks.as_slice(),
            block_entities,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChunkData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = OwnedChunkRepr::deserialize(deserializer)?;
        if repr.blocks.len() != CHUNK_VOLUME {
            return Err(de::Error::custom(format!(
                "expected {CHUNK_VOLUME} blocks, got {}",
                repr.blocks.len()
            )));
        }

        let blocks: [BlockId; CHUNK_VOLUME] = repr
            .blocks
            .try_into()
            .map_err(|_| de::Error::custom("failed to deserialize chunk block array"))?;

        let block_entities = repr
            .block_entities
            .into_iter()
            .map(|entity| (world_to_chunk(entity.pos).1, entity))
            .collect();

        Ok(Self {
            blocks: Box::new(blocks),
            block_entities,
        })
    }
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::ChunkData;
    use crate::block::{BlockEntity, BlockEntityData, BlockId};
    use crate::coords::{local_to_index, LocalPos};

    fn chest_at(pos: IVec3) -> BlockEntity {
        BlockEntity {
            pos,
            data: BlockEntityData::Container {
                title: "loot".to_string(),
                slots: vec![Some((4, 12)), None],
            },
        }
    }

    #[test]
    fn chunk_creation_and_get_set_work() {
        let mut chunk = ChunkData::new_empty();
        let pos = LocalPos { x: 3, y: 7, z: 11 };
        assert_eq!(chunk.get(pos), BlockId::AIR);

        chunk.set(pos, BlockId::STONE);
        assert_eq!(chunk.get(pos), BlockId::STONE);
        assert_eq!(chunk.get_index(local_to_index(pos)), BlockId::STONE);
        assert!(!chunk.is_uniform(BlockId::AIR));
    }

    #[test]
    fn replacing_a_container_drops_its_block_entity() {
        let mut chunk = ChunkData::new_empty();
        let local = LocalPos { x: 1, y: 2, z: 3 };
        chunk.set(local, BlockId::CHEST_EAST);
        chunk.set_block_entity(chest_at(IVec3::new(17, 2, 3)));
        assert!(chunk.block_entity(local).is_some());

        chunk.set(local, BlockId::CHEST_WEST);
        assert!(chunk.block_entity(local).is_some());

        chunk.set(local, BlockId::STONE);
        assert!(chunk.block_entity(local).is_none());
    }

    #[test]
    fn bincode_keeps_block_entities_keyed_by_local_position() {
        let mut original = ChunkData::new_filled(BlockId::DIRT);
        original.set(LocalPos { x: 15, y: 15, z: 15 }, BlockId::CHEST_NORTH);
        original.set_block_entity(chest_at(IVec3::new(-1, 31, 15)));

        let encoded = bincode::serialize(&original).expect("serialize chunk");
        let decoded: ChunkData = bincode::deserialize(&encoded).expect("deserialize chunk");

        let local = LocalPos { x: 15, y: 15, z: 15 };
        assert_eq!(decoded.get(local), BlockId::CHEST_NORTH);
        assert_eq!(decoded.block_entity(local), original.block_entity(local));
    }
}
