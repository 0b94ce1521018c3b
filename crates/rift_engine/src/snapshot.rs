use std::sync::Arc;

use glam::IVec3;
use rift_shared::block::{BlockEntity, BlockId};
use rift_shared::chunk::ChunkData;
use rift_shared::coords::{world_to_chunk, ChunkPos};
use rustc_hash::FxHashMap;

use crate::host::WorldId;

pub enum ChunkFetch {
    Ready(Arc<ChunkData>),
    /// Not loaded yet; the caller must not wait for it.
    Pending,
}

/// Host voxel storage as seen from the worker thread. Implementations must
/// never block.
pub trait VoxelStore: Send + Sync {
    fn try_chunk(&self, pos: ChunkPos) -> ChunkFetch;

    /// World height as `(min_y, max_y)`, `max_y` exclusive.
    fn height_range(&self) -> (i32, i32);
}

/// Per-session memoizing reader over one world's [`VoxelStore`]. Pending
/// chunks read as air and are retried on the next lookup.
pub struct VoxelSnapshotView {
    world: WorldId,
    store: Arc<dyn VoxelStore>,
    chunks: FxHashMap<ChunkPos, Arc<ChunkData>>,
    misses: usize,
}

impl VoxelSnapshotView {
    pub fn new(world: WorldId, store: Arc<dyn VoxelStore>) -> Self {
        Self {
            world,
            store,
            chunks: FxHashMap::default(),
            misses: 0,
        }
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Starts a new tick against `store`, dropping everything memoized so far.
    pub fn begin_tick(&mut self, store: Arc<dyn VoxelStore>) {
        self.store = store;
        self.chunks.clear();
        self.misses = 0;
    }

    pub fn height_range(&self) -> (i32, i32) {
        self.store.height_range()
    }

    /// Lookups that hit a pending chunk since `begin_tick`.
    pub fn misses(&self) -> usize {
        self.misses
    }

    fn chunk(&mut self, pos: ChunkPos) -> Option<&Arc<ChunkData>> {
        if !self.chunks.contains_key(&pos) {
            match self.store.try_chunk(pos) {
                ChunkFetch::Ready(chunk) => {
                    self.chunks.insert(pos, chunk);
                }
                ChunkFetch::Pending => {
                    self.misses += 1;
                    return None;
                }
            }
        }
        self.chunks.get(&pos)
    }

    pub fn block(&mut self, pos: IVec3) -> BlockId {
        let (min_y, max_y) = self.store.height_range();
        if pos.y < min_y || pos.y >= max_y {
            return BlockId::AIR;
        }
        let (chunk_pos, local) = world_to_chunk(pos);
        self.chunk(chunk_pos)
            .map_or(BlockId::AIR, |chunk| chunk.get(local))
    }

    pub fn block_entity(&mut self, pos: IVec3) -> Option<BlockEntity> {
        let (chunk_pos, local) = world_to_chunk(pos);
        self.chunk(chunk_pos)
            .and_then(|chunk| chunk.block_entity(local).cloned())
    }
}
