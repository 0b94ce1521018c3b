use std::sync::Arc;

use glam::{IVec3, Vec3};
use rift_core::jobs::JobSystem;
use rift_core::tasks::{task_queue, TaskQueue};
use rift_shared::block::BlockRegistry;
use rift_shared::coords::{ChunkPos, CHUNK_SIZE};
use rift_shared::entity::{EntityId, EntitySnapshot};
use rift_shared::physics::AABB;
use rift_shared::protocol::S2C;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::host::{
    ClientFrame, ClientId, ClientSink, HostFrame, Overwrites, PortalHost, WorldFrame, WorldId,
};
use crate::linker::PortalLinker;
use crate::scheduler::{TickScheduler, Worker};
use crate::session::SessionOutput;

/// Host-thread side of the engine. Worker tasks write into it; `apply`
/// flushes it to the sink.
#[derive(Debug, Default)]
pub struct ApplyState {
    outbox: Vec<(ClientId, Vec<S2C>)>,
    near_portal: FxHashMap<ClientId, bool>,
    flag_changes: Vec<(ClientId, bool)>,
    interest: FxHashMap<ClientId, Vec<AABB>>,
    hidden: FxHashMap<ClientId, Vec<EntityId>>,
    overwrites: FxHashMap<ClientId, Overwrites>,
}

impl ApplyState {
    pub fn queue(&mut self, client: ClientId, messages: Vec<S2C>) {
        if !messages.is_empty() {
            self.outbox.push((client, messages));
        }
    }

    pub fn publish(&mut self, client: ClientId, output: SessionOutput) {
        self.queue(client, output.messages);
        let previous = self.near_portal.insert(client, output.near_portal);
        if previous != Some(output.near_portal) {
            self.flag_changes.push((client, output.near_portal));
        }
        self.interest.insert(client, output.interest);
        self.hidden.insert(client, output.hidden);
    }

    /// Drops per-client bookkeeping. Queued messages stay until flushed.
    pub fn forget(&mut self, client: ClientId) {
        self.near_portal.remove(&client);
        self.interest.remove(&client);
        self.hidden.remove(&client);
        self.overwrites.remove(&client);
        self.flag_changes.retain(|(id, _)| *id != client);
    }

    pub fn interest(&self, client: ClientId) -> &[AABB] {
        self.interest.get(&client).map_or(&[], Vec::as_slice)
    }

    pub fn hidden(&self, client: ClientId) -> &[EntityId] {
        self.hidden.get(&client).map_or(&[], Vec::as_slice)
    }

    /// Records that `client` was sent true-world data for `cells`.
    pub fn overwrite_cells(&mut self, client: ClientId, cells: &[IVec3]) {
        self.overwrites
            .entry(client)
            .or_default()
            .cells
            .extend_from_slice(cells);
    }

    /// Records that `client` was sent a whole chunk of true-world data.
    pub fn overwrite_chunk(&mut self, client: ClientId, chunk: ChunkPos) {
        self.overwrites.entry(client).or_default().chunks.push(chunk);
    }

    fn take_overwrites(&mut self, client: ClientId) -> Overwrites {
        self.overwrites.remove(&client).unwrap_or_default()
    }

    /// Sends everything queued. Clients that are no longer connected lose
    /// their messages.
    pub fn flush(&mut self, sink: &mut dyn ClientSink) -> usize {
        let mut sent = 0;
        for (client, messages) in self.outbox.drain(..) {
            if !sink.is_connected(client) {
                debug!(
                    "Dropping {} portal message(s) for disconnected client {client}",
                    messages.len()
                );
                continue;
            }
            for message in messages {
                sink.send(client, message);
                sent += 1;
            }
        }
        for (client, near) in self.flag_changes.drain(..) {
            if sink.is_connected(client) {
                sink.set_near_portal(client, near);
            }
        }
        sent
    }
}

/// Portal view engine. Lives on the host thread; the heavy lifting happens on
/// a worker thread it owns.
pub struct PortalEngine {
    config: Arc<EngineConfig>,
    scheduler: TickScheduler,
    tasks: TaskQueue<ApplyState>,
    state: ApplyState,
    tick: u64,
    seen: FxHashMap<ClientId, WorldId>,
}

impl PortalEngine {
    pub fn start(
        config: EngineConfig,
        blocks: BlockRegistry,
        linker: Arc<dyn PortalLinker>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config.sanitize());
        let jobs = JobSystem::new(config.worker_threads, "rift-portal-job")?;
        let (sender, tasks) = task_queue();
        let worker = Worker::new(config.clone(), Arc::new(blocks), linker, jobs, sender);
        let scheduler = TickScheduler::spawn(worker, config.tick_interval())?;
        info!(
            "Portal engine started: {} Hz, render distance {}, atmosphere {}",
            config.tick_rate, config.render_distance, config.atmosphere_radius
        );
        Ok(Self {
            config,
            scheduler,
            tasks,
            state: ApplyState::default(),
            tick: 0,
            seen: FxHashMap::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Captures this host tick's snapshot and hands it to the worker.
    pub fn collect(&mut self, host: &dyn PortalHost) {
        let frame = capture_frame(host, &self.config, self.tick, &mut self.seen, &mut self.state);
        self.tick += 1;
        if !self.scheduler.submit(frame) {
            debug!("Portal worker is not running; frame dropped");
        }
    }

    /// Tells the engine the host sent `client` true-world blocks at `cells`,
    /// so any portal view cached there is sent again.
    pub fn invalidate_cells(&mut self, client: ClientId, cells: &[IVec3]) {
        self.state.overwrite_cells(client, cells);
    }

    /// Same as [`Self::invalidate_cells`] for a whole chunk.
    pub fn invalidate_chunk(&mut self, client: ClientId, chunk: ChunkPos) {
        self.state.overwrite_chunk(client, chunk);
    }

    /// Runs every task the worker produced and flushes the results.
    pub fn apply(&mut self, sink: &mut dyn ClientSink) -> usize {
        self.tasks.drain(&mut self.state);
        self.state.flush(sink)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stops and joins the worker, then delivers whatever it left behind.
    pub fn shutdown(&mut self, sink: &mut dyn ClientSink) {
        self.scheduler.stop();
        self.apply(sink);
        info!("Portal engine stopped after {} tick(s)", self.tick);
    }
}

/// Builds a [`HostFrame`] from the host's current state. Discovery markers
/// are captured on scan ticks and whenever a client is new or switched world.
pub(crate) fn capture_frame(
    host: &dyn PortalHost,
    config: &EngineConfig,
    tick: u64,
    seen: &mut FxHashMap<ClientId, WorldId>,
    state: &mut ApplyState,
) -> HostFrame {
    let scan_tick = tick % config.scan_interval_ticks == 0;
    let chunk_radius = (config.render_distance / CHUNK_SIZE as f32).ceil() as i32;
    let mut clients = Vec::new();

    for view in host.clients() {
        let world = view.world;
        let Some(store) = host.voxel_store(world) else {
            continue;
        };
        let destination = host
            .destination_world(world)
            .and_then(|id| host.voxel_store(id).map(|store| WorldFrame { id, store }));

        let fresh = seen.insert(view.id, world) != Some(world);
        let markers = (scan_tick || fresh).then(|| {
            let center = ChunkPos::containing(view.eye.floor().as_ivec3());
            host.portal_markers(world, center, chunk_radius)
        });

        let viewer = view.entity;
        let mut nearby_entities = host.entities(
            world,
            &AABB::from_center(view.eye, Vec3::splat(config.entity_hide_distance)),
            &|entity: &EntitySnapshot| entity.id != viewer,
        );
        // Hidden entities stay in the frame until they are re-shown, however
        // far they wander.
        for &id in state.hidden(view.id) {
            if nearby_entities.iter().all(|entity| entity.id != id) {
                nearby_entities.extend(host.entity(world, id));
            }
        }

        let mut destination_entities = Vec::new();
        if let Some(destination) = &destination {
            let mut ids = FxHashSet::default();
            for bounds in state.interest(view.id) {
                for entity in host.entities(destination.id, bounds, &|_: &EntitySnapshot| true) {
                    if ids.insert(entity.id) {
                        destination_entities.push(entity);
                    }
                }
            }
        }

        let overwritten = state.take_overwrites(view.id);
        clients.push(ClientFrame {
            view,
            source: WorldFrame { id: world, store },
            destination,
            markers,
            nearby_entities,
            destination_entities,
            overwritten,
        });
    }

    seen.retain(|id, _| clients.iter().any(|client| client.view.id == *id));
    HostFrame { tick, clients }
}
