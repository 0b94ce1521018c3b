use std::sync::Arc;

use glam::Vec3;
use rift_shared::block::BlockRegistry;
use rift_shared::entity::{EntityId, EntitySnapshot};
use rift_shared::physics::AABB;
use rift_shared::protocol::S2C;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::diff_cache::SpatialDiffCache;
use crate::error::EngineError;
use crate::frustum::ViewFrustum;
use crate::host::{ClientFlags, ClientFrame, ClientId, WorldFrame, WorldId};
use crate::linker::PortalLinker;
use crate::occlusion::EntityOcclusion;
use crate::proxy::{ProxyEntityManager, VisiblePortal};
use crate::registry::PortalRegistry;
use crate::renderer::{
    diff_against_cache, revert_all, CellState, PortalRenderer, RenderOutcome, RenderTarget,
};
use crate::snapshot::VoxelSnapshotView;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    TornDown,
}

/// What one session produced for one tick.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Empty, or a single bundle.
    pub messages: Vec<S2C>,
    pub near_portal: bool,
    /// Destination-space boxes whose entities the next frame should carry.
    pub interest: Vec<AABB>,
    /// Real entities currently hidden from the client.
    pub hidden: Vec<EntityId>,
}

/// All portal state for one connected client. Owned and ticked by the worker.
pub struct ClientPortalSession {
    client: ClientId,
    state: SessionState,
    world: Option<WorldId>,
    config: Arc<EngineConfig>,
    blocks: Arc<BlockRegistry>,
    linker: Arc<dyn PortalLinker>,
    source: Option<VoxelSnapshotView>,
    destination: Option<VoxelSnapshotView>,
    registry: PortalRegistry,
    renderer: PortalRenderer,
    cache: SpatialDiffCache<CellState>,
    proxies: ProxyEntityManager,
    occlusion: EntityOcclusion,
}

impl ClientPortalSession {
    pub fn new(
        client: ClientId,
        config: Arc<EngineConfig>,
        blocks: Arc<BlockRegistry>,
        linker: Arc<dyn PortalLinker>,
    ) -> Self {
        let registry = PortalRegistry::new(config.portal_grace_ticks, config.render_distance);
        let proxies = ProxyEntityManager::new(config.flicker_guard_ticks);
        let occlusion = EntityOcclusion::new(config.flicker_guard_ticks);
        Self {
            client,
            state: SessionState::Uninitialized,
            world: None,
            config,
            blocks,
            linker,
            source: None,
            destination: None,
            registry,
            renderer: PortalRenderer::new(),
            cache: SpatialDiffCache::new(),
            proxies,
            occlusion,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn portal_count(&self) -> usize {
        self.registry.len()
    }

    pub fn tick(&mut self, frame: &ClientFrame, tick: u64) -> Result<SessionOutput, EngineError> {
        let view = &frame.view;
        let mut messages = Vec::new();

        if self.world.is_some_and(|world| world != view.world) {
            info!(
                "Client {} changed world {:?} -> {:?}; purging portal state",
                self.client, self.world, view.world
            );
            messages.extend(self.purge());
        }
        self.world = Some(view.world);

        if !frame.overwritten.is_empty() {
            // The client holds true-world data there now.
            let overwritten = &frame.overwritten;
            self.cache.retain(|pos, _| !overwritten.covers(pos));
        }

        let destination_frame = frame
            .destination
            .as_ref()
            .filter(|_| view.flags.contains(ClientFlags::ENABLED));
        let Some(destination_frame) = destination_frame else {
            if self.state == SessionState::Active {
                debug!("Portal view disabled for client {}", self.client);
                messages.extend(self.deactivate(&frame.source, &frame.nearby_entities));
            }
            return Ok(SessionOutput {
                messages: bundle(messages),
                ..SessionOutput::default()
            });
        };

        if self.destination.as_ref().map(VoxelSnapshotView::world) != Some(destination_frame.id) {
            // Links point into the old destination.
            self.registry.clear();
            self.renderer.clear();
        }
        let source = refresh_view(&mut self.source, &frame.source);
        let destination = refresh_view(&mut self.destination, destination_frame);
        self.state = SessionState::Active;

        let eye = view.eye;
        if let Some(markers) = &frame.markers {
            self.registry.scan(
                markers,
                source,
                destination,
                self.linker.as_ref(),
                &self.blocks,
                eye,
            );
        }
        for key in self.registry.decay(tick, eye) {
            self.renderer.forget(key);
        }

        self.renderer.begin_tick(eye);
        let mut target = RenderTarget::default();
        let mut visible = Vec::new();
        for portal in self.registry.portals() {
            let outcome = self.renderer.render(
                portal,
                &self.config,
                &self.blocks,
                source,
                destination,
                &mut target,
            )?;
            if let RenderOutcome::Rendered { .. } = outcome {
                if let Some(frustum) = self.renderer.cached_frustum(portal.key) {
                    visible.push(VisiblePortal {
                        key: portal.key,
                        frustum: *frustum,
                        transform: portal.transform,
                    });
                }
            }
        }
        messages.extend(diff_against_cache(&mut self.cache, &target, source));

        messages.extend(self.proxies.update(&visible, &frame.destination_entities));
        let frustums: Vec<ViewFrustum> = visible.iter().map(|portal| portal.frustum).collect();
        messages.extend(
            self.occlusion
                .update(&frustums, &frame.nearby_entities, view.entity),
        );

        let near_sq = self.config.near_portal_distance * self.config.near_portal_distance;
        let portals = self.registry.portals();
        let near_portal = portals
            .iter()
            .any(|portal| portal.center().distance_squared(eye) <= near_sq);
        let interest = portals
            .iter()
            .map(|portal| {
                AABB::from_center(
                    portal.transform.transform_position(portal.center()),
                    Vec3::splat(self.config.atmosphere_radius),
                )
            })
            .collect();

        Ok(SessionOutput {
            messages: bundle(messages),
            near_portal,
            interest,
            hidden: self.occlusion.hidden_ids(),
        })
    }

    /// Final messages for a departing client: every proxy destroyed and every
    /// overridden cell reverted.
    pub fn tear_down(&mut self) -> Vec<S2C> {
        let mut messages = self.proxies.destroy_all();
        match self.source.as_mut() {
            Some(source) => messages.extend(revert_all(&mut self.cache, source)),
            None => self.cache.clear(),
        }
        self.registry.clear();
        self.renderer.clear();
        self.occlusion.forget();
        self.state = SessionState::TornDown;
        bundle(messages)
    }

    /// Drops everything tied to the previous world. Cells there are not
    /// reverted; the client no longer shows them.
    fn purge(&mut self) -> Vec<S2C> {
        let messages = self.proxies.destroy_all();
        self.cache.clear();
        self.registry.clear();
        self.renderer.clear();
        self.occlusion.forget();
        self.source = None;
        self.destination = None;
        self.state = SessionState::Uninitialized;
        messages
    }

    /// Returns the client to the true world.
    fn deactivate(&mut self, source: &WorldFrame, nearby: &[EntitySnapshot]) -> Vec<S2C> {
        let view = refresh_view(&mut self.source, source);
        let mut messages = revert_all(&mut self.cache, view);
        messages.extend(self.proxies.destroy_all());
        messages.extend(self.occlusion.reveal_all(nearby));
        self.registry.clear();
        self.renderer.clear();
        self.state = SessionState::Uninitialized;
        messages
    }
}

fn refresh_view<'a>(
    slot: &'a mut Option<VoxelSnapshotView>,
    frame: &WorldFrame,
) -> &'a mut VoxelSnapshotView {
    let view = match slot.take() {
        Some(mut view) if view.world() == frame.id => {
            view.begin_tick(frame.store.clone());
            view
        }
        _ => VoxelSnapshotView::new(frame.id, frame.store.clone()),
    };
    slot.insert(view)
}

fn bundle(messages: Vec<S2C>) -> Vec<S2C> {
    if messages.is_empty() {
        messages
    } else {
        vec![S2C::Bundle { messages }]
    }
}
