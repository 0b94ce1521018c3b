use rift_shared::entity::{EntityId, EntitySnapshot, WireEntityId};
use rift_shared::protocol::S2C;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::frustum::ViewFrustum;
use crate::proxy::{spawn_sequence, tick_guards, Motion};

/// Hides real entities standing in a portal's line of sight, so they do not
/// block the view into the destination. Hidden entities are re-sent in full
/// once they step out.
#[derive(Debug)]
pub struct EntityOcclusion {
    guard_ticks: u32,
    hidden: FxHashMap<EntityId, Hidden>,
    guards: FxHashMap<EntityId, u32>,
}

#[derive(Debug)]
struct Hidden {
    last_seen: EntitySnapshot,
    /// Consecutive updates the entity was absent from.
    missing: u32,
}

impl EntityOcclusion {
    pub fn new(guard_ticks: u32) -> Self {
        Self {
            guard_ticks,
            hidden: FxHashMap::default(),
            guards: FxHashMap::default(),
        }
    }

    pub fn is_hidden(&self, entity: EntityId) -> bool {
        self.hidden.contains_key(&entity)
    }

    /// Hidden entity ids, sorted. The host keeps these in the next frame
    /// wherever they are.
    pub fn hidden_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.hidden.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn update(
        &mut self,
        frustums: &[ViewFrustum],
        entities: &[EntitySnapshot],
        viewer: EntityId,
    ) -> Vec<S2C> {
        tick_guards(&mut self.guards);

        let in_sight = |entity: &EntitySnapshot| {
            let center = entity.bounding_box().center();
            frustums
                .iter()
                .any(|frustum| frustum.contains_side_planes_only(center))
        };

        let mut hide: Vec<&EntitySnapshot> = entities
            .iter()
            .filter(|entity| entity.id != viewer)
            .filter(|entity| {
                !self.hidden.contains_key(&entity.id) && !self.guards.contains_key(&entity.id)
            })
            .filter(|entity| in_sight(*entity))
            .collect();
        hide.sort_by_key(|entity| entity.id);

        let mut reveal: Vec<&EntitySnapshot> = entities
            .iter()
            .filter(|entity| self.hidden.contains_key(&entity.id) && !in_sight(*entity))
            .collect();
        reveal.sort_by_key(|entity| entity.id);

        let present: FxHashSet<EntityId> = entities.iter().map(|entity| entity.id).collect();
        let guard_ticks = self.guard_ticks;
        for (id, hidden) in self.hidden.iter_mut() {
            if present.contains(id) {
                hidden.missing = 0;
            } else {
                hidden.missing += 1;
            }
        }
        // Absent for a whole guard window: the host stopped tracking it and
        // already destroyed it on its side.
        self.hidden.retain(|_, hidden| hidden.missing <= guard_ticks);

        let mut messages = Vec::new();
        if !hide.is_empty() {
            messages.push(S2C::EntityDestroy {
                ids: hide.iter().map(|entity| WireEntityId::from(entity.id)).collect(),
            });
        }
        for entity in entities {
            if let Some(hidden) = self.hidden.get_mut(&entity.id) {
                hidden.last_seen = entity.clone();
            }
        }
        for entity in hide {
            self.hidden.insert(
                entity.id,
                Hidden {
                    last_seen: entity.clone(),
                    missing: 0,
                },
            );
        }
        for entity in reveal {
            self.hidden.remove(&entity.id);
            self.guards.insert(entity.id, self.guard_ticks);
            messages.extend(spawn_sequence(entity.id.into(), entity, Motion::of(entity)));
        }
        messages
    }

    /// Re-sends every hidden entity, using the snapshot in `entities` when
    /// there is one and the last one seen otherwise.
    pub fn reveal_all(&mut self, entities: &[EntitySnapshot]) -> Vec<S2C> {
        let mut reveal: Vec<&EntitySnapshot> = self
            .hidden
            .iter()
            .map(|(id, hidden)| {
                entities
                    .iter()
                    .find(|entity| entity.id == *id)
                    .unwrap_or(&hidden.last_seen)
            })
            .collect();
        reveal.sort_by_key(|entity| entity.id);
        let messages = reveal
            .into_iter()
            .flat_map(|entity| spawn_sequence(entity.id.into(), entity, Motion::of(entity)))
            .collect();
        self.forget();
        messages
    }

    pub fn forget(&mut self) {
        self.hidden.clear();
        self.guards.clear();
    }
}

#[cfg(test)]
mod tests {
    use glam::{IVec3, Vec3};
    use rift_shared::coords::Axis;
    use rift_shared::entity::{EntityId, EntityKind, EntitySnapshot, WireEntityId};
    use rift_shared::protocol::S2C;

    use super::EntityOcclusion;
    use crate::frustum::{Aperture, ViewFrustum};

    const VIEWER: EntityId = EntityId(99);

    fn frustum() -> ViewFrustum {
        let aperture = Aperture::from_cells(Axis::Z, IVec3::new(0, 64, 0), IVec3::new(1, 66, 0));
        ViewFrustum::new(Vec3::new(1.0, 65.5, -8.0), aperture)
    }

    fn pig(position: Vec3) -> EntitySnapshot {
        EntitySnapshot::new(EntityId(5), EntityKind::Pig, position)
    }

    // Between the viewer and the aperture, on the sightline.
    const IN_FRONT: Vec3 = Vec3::new(1.0, 65.0, -3.0);
    const ASIDE: Vec3 = Vec3::new(9.0, 65.0, -3.0);

    #[test]
    fn entity_in_front_of_the_portal_is_hidden_then_resent() {
        let mut occlusion = EntityOcclusion::new(10);

        let messages = occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER);
        assert_eq!(messages, vec![S2C::EntityDestroy { ids: vec![WireEntityId(5)] }]);
        assert!(occlusion.is_hidden(EntityId(5)));
        assert!(occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER).is_empty());

        let messages = occlusion.update(&[frustum()], &[pig(ASIDE)], VIEWER);
        assert!(matches!(
            messages.as_slice(),
            [S2C::EntitySpawn { id: WireEntityId(5), .. }]
        ));
        assert!(!occlusion.is_hidden(EntityId(5)));

        // Stepping straight back in is suppressed by the guard.
        assert!(occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER).is_empty());
    }

    #[test]
    fn hidden_entity_absent_for_a_frame_is_still_resent() {
        let mut occlusion = EntityOcclusion::new(10);
        occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER);

        assert!(occlusion.update(&[frustum()], &[], VIEWER).is_empty());
        assert!(occlusion.is_hidden(EntityId(5)));
        assert_eq!(occlusion.hidden_ids(), vec![EntityId(5)]);

        let out_of_sight = Vec3::new(12.0, 65.0, -3.0);
        let messages = occlusion.update(&[frustum()], &[pig(out_of_sight)], VIEWER);
        assert!(matches!(
            messages.as_slice(),
            [S2C::EntitySpawn { id: WireEntityId(5), .. }]
        ));
        assert!(!occlusion.is_hidden(EntityId(5)));
    }

    #[test]
    fn entity_gone_for_a_guard_window_is_dropped_silently() {
        let mut occlusion = EntityOcclusion::new(3);
        occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER);
        for _ in 0..4 {
            assert!(occlusion.update(&[frustum()], &[], VIEWER).is_empty());
        }
        assert!(!occlusion.is_hidden(EntityId(5)));
        assert!(occlusion.reveal_all(&[]).is_empty());
    }

    #[test]
    fn reveal_all_falls_back_to_the_last_snapshot() {
        let mut occlusion = EntityOcclusion::new(10);
        occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER);
        let messages = occlusion.reveal_all(&[]);
        assert!(matches!(
            messages.as_slice(),
            [S2C::EntitySpawn { id: WireEntityId(5), .. }]
        ));
    }

    #[test]
    fn the_viewer_is_never_hidden() {
        let mut occlusion = EntityOcclusion::new(10);
        let me = EntitySnapshot::new(VIEWER, EntityKind::Player, IN_FRONT);
        assert!(occlusion.update(&[frustum()], &[me], VIEWER).is_empty());
    }

    #[test]
    fn reveal_all_resends_everything_hidden() {
        let mut occlusion = EntityOcclusion::new(10);
        occlusion.update(&[frustum()], &[pig(IN_FRONT)], VIEWER);
        let messages = occlusion.reveal_all(&[pig(IN_FRONT)]);
        assert!(matches!(messages.as_slice(), [S2C::EntitySpawn { .. }]));
        assert!(!occlusion.is_hidden(EntityId(5)));
        assert!(occlusion.reveal_all(&[pig(IN_FRONT)]).is_empty());
    }
}
