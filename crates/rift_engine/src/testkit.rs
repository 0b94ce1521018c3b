use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use glam::IVec3;
use rift_shared::block::{portal_block_for_axis, BlockEntity, BlockId};
use rift_shared::chunk::ChunkData;
use rift_shared::coords::{chunk_to_world, world_to_chunk, Axis, ChunkPos};
use rift_shared::protocol::S2C;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::host::{ClientId, ClientSink};
use crate::snapshot::{ChunkFetch, VoxelStore};

/// In-memory voxel world. Chunks never written read as empty.
pub struct MemoryStore {
    chunks: FxHashMap<ChunkPos, Arc<ChunkData>>,
    empty: Arc<ChunkData>,
    height: (i32, i32),
    pending: Mutex<FxHashSet<ChunkPos>>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            chunks: FxHashMap::default(),
            empty: Arc::new(ChunkData::new_empty()),
            height: (0, 256),
            pending: Mutex::new(FxHashSet::default()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_height(min_y: i32, max_y: i32) -> Self {
        Self {
            height: (min_y, max_y),
            ..Self::new()
        }
    }

    pub fn set_block(&mut self, pos: IVec3, block: BlockId) {
        let (chunk, local) = world_to_chunk(pos);
        let data = self
            .chunks
            .entry(chunk)
            .or_insert_with(|| Arc::new(ChunkData::new_empty()));
        Arc::make_mut(data).set(local, block);
    }

    pub fn set_block_entity(&mut self, entity: BlockEntity) {
        let chunk = ChunkPos::containing(entity.pos);
        let data = self
            .chunks
            .entry(chunk)
            .or_insert_with(|| Arc::new(ChunkData::new_empty()));
        Arc::make_mut(data).set_block_entity(entity);
    }

    pub fn set_pending(&self, pos: ChunkPos, pending: bool) {
        let mut set = self.pending.lock().unwrap();
        if pending {
            set.insert(pos);
        } else {
            set.remove(&pos);
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl VoxelStore for MemoryStore {
    fn try_chunk(&self, pos: ChunkPos) -> ChunkFetch {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if self.pending.lock().unwrap().contains(&pos) {
            return ChunkFetch::Pending;
        }
        ChunkFetch::Ready(self.chunks.get(&pos).unwrap_or(&self.empty).clone())
    }

    fn height_range(&self) -> (i32, i32) {
        self.height
    }
}

/// Aperture cells of a `width` x `height` structure with its min corner at
/// `lower`.
pub fn portal_cells(lower: IVec3, axis: Axis, width: i32, height: i32) -> Vec<IVec3> {
    let step = axis.unit();
    let mut cells = Vec::new();
    for y in 0..height {
        for h in 0..width {
            cells.push(lower + step * h + IVec3::Y * y);
        }
    }
    cells
}

/// Fills a portal aperture and, if `frame` is set, surrounds it with an
/// obsidian ring including corners.
pub fn build_portal(
    store: &mut MemoryStore,
    lower: IVec3,
    axis: Axis,
    width: i32,
    height: i32,
    frame: bool,
) {
    let substance = portal_block_for_axis(axis);
    for cell in portal_cells(lower, axis, width, height) {
        store.set_block(cell, substance);
    }
    if !frame {
        return;
    }
    let step = axis.unit();
    for y in -1..=height {
        for h in -1..=width {
            let on_ring = y == -1 || y == height || h == -1 || h == width;
            if on_ring {
                store.set_block(lower + step * h + IVec3::Y * y, BlockId::OBSIDIAN);
            }
        }
    }
}

/// Flattens bundles.
pub fn unbundle(messages: &[S2C]) -> Vec<S2C> {
    let mut flat = Vec::new();
    for message in messages {
        match message {
            S2C::Bundle { messages } => flat.extend(unbundle(messages)),
            other => flat.push(other.clone()),
        }
    }
    flat
}

/// Every block change in `messages`, in world coordinates.
pub fn block_changes(messages: &[S2C]) -> Vec<(IVec3, BlockId)> {
    unbundle(messages)
        .into_iter()
        .filter_map(|message| match message {
            S2C::BlockUpdates { section, changes } => Some(
                changes
                    .into_iter()
                    .map(move |(local, block)| (chunk_to_world(section, local), block))
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        })
        .flatten()
        .collect()
}

#[derive(Default)]
pub struct RecordingSink {
    pub connected: FxHashSet<ClientId>,
    pub sent: Vec<(ClientId, S2C)>,
    pub near_portal: FxHashMap<ClientId, bool>,
}

impl RecordingSink {
    pub fn with_clients(clients: &[ClientId]) -> Self {
        Self {
            connected: clients.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn sent_to(&self, client: ClientId) -> Vec<S2C> {
        let messages: Vec<S2C> = self
            .sent
            .iter()
            .filter(|(id, _)| *id == client)
            .map(|(_, message)| message.clone())
            .collect();
        unbundle(&messages)
    }
}

impl ClientSink for RecordingSink {
    fn is_connected(&self, client: ClientId) -> bool {
        self.connected.contains(&client)
    }

    fn send(&mut self, client: ClientId, message: S2C) {
        self.sent.push((client, message));
    }

    fn set_near_portal(&mut self, client: ClientId, near: bool) {
        self.near_portal.insert(client, near);
    }
}
