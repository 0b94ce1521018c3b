use glam::Vec3;
use rift_shared::entity::{EntityId, EntitySnapshot, WireEntityId};
use rift_shared::protocol::S2C;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::frustum::ViewFrustum;
use crate::registry::PortalKey;
use crate::transform::CoordinateTransform;

/// A portal rendered unoccluded this tick, with the frustum it was seen
/// through.
#[derive(Copy, Clone, Debug)]
pub struct VisiblePortal {
    pub key: PortalKey,
    pub frustum: ViewFrustum,
    pub transform: CoordinateTransform,
}

/// Position and orientation as the client should see an entity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Motion {
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub head_yaw: f32,
    pub on_ground: bool,
}

impl Motion {
    pub fn of(entity: &EntitySnapshot) -> Self {
        Self {
            position: entity.position,
            velocity: entity.velocity,
            yaw: entity.yaw,
            pitch: entity.pitch,
            head_yaw: entity.head_yaw,
            on_ground: entity.on_ground,
        }
    }

    /// Destination-side motion mapped back into source space.
    pub fn through(entity: &EntitySnapshot, transform: &CoordinateTransform) -> Self {
        Self {
            position: transform.untransform_position(entity.position),
            velocity: transform.untransform_vector(entity.velocity),
            yaw: transform.untransform_yaw(entity.yaw),
            pitch: entity.pitch,
            head_yaw: transform.untransform_yaw(entity.head_yaw),
            on_ground: entity.on_ground,
        }
    }

    pub fn to_move(self, id: WireEntityId) -> S2C {
        S2C::EntityMove {
            id,
            position: self.position,
            velocity: self.velocity,
            yaw: self.yaw,
            pitch: self.pitch,
            head_yaw: self.head_yaw,
            on_ground: self.on_ground,
        }
    }
}

/// Spawn followed by the complete equipment and attribute state.
pub(crate) fn spawn_sequence(id: WireEntityId, entity: &EntitySnapshot, motion: Motion) -> Vec<S2C> {
    let mut messages = vec![S2C::EntitySpawn {
        id,
        kind: entity.kind,
        position: motion.position,
        velocity: motion.velocity,
        yaw: motion.yaw,
        pitch: motion.pitch,
        head_yaw: motion.head_yaw,
    }];
    if !entity.equipment.is_empty() {
        messages.push(S2C::EntityEquipment {
            id,
            slots: entity.equipment.clone(),
        });
    }
    if !entity.attributes.is_empty() {
        messages.push(S2C::EntityAttributes {
            id,
            attributes: entity.attributes.clone(),
        });
    }
    messages
}

pub(crate) fn tick_guards(guards: &mut FxHashMap<EntityId, u32>) {
    guards.retain(|_, remaining| {
        *remaining = remaining.saturating_sub(1);
        *remaining > 0
    });
}

#[derive(Debug)]
struct ShownProxy {
    motion: Motion,
    passengers: Vec<WireEntityId>,
}

/// Client-local stand-ins for destination entities seen through portals.
/// Proxy ids are negative and never handed out twice for one client.
#[derive(Debug)]
pub struct ProxyEntityManager {
    guard_ticks: u32,
    /// `None` once the negative range is used up.
    next_fake_id: Option<i32>,
    wire_ids: FxHashMap<EntityId, WireEntityId>,
    shown: FxHashMap<EntityId, ShownProxy>,
    guards: FxHashMap<EntityId, u32>,
    last_vehicles: FxHashMap<EntityId, EntityId>,
}

impl ProxyEntityManager {
    pub fn new(guard_ticks: u32) -> Self {
        Self {
            guard_ticks,
            next_fake_id: Some(-1),
            wire_ids: FxHashMap::default(),
            shown: FxHashMap::default(),
            guards: FxHashMap::default(),
            last_vehicles: FxHashMap::default(),
        }
    }

    pub fn shown_count(&self) -> usize {
        self.shown.len()
    }

    pub fn wire_id(&self, entity: EntityId) -> Option<WireEntityId> {
        self.wire_ids.get(&entity).copied()
    }

    fn allocate(&mut self, entity: EntityId) -> Option<WireEntityId> {
        if let Some(id) = self.wire_ids.get(&entity) {
            return Some(*id);
        }
        let id = WireEntityId(self.next_fake_id?);
        self.next_fake_id = id.0.checked_sub(1);
        if self.next_fake_id.is_none() {
            warn!("Proxy ids exhausted; no further proxies will be spawned for this client");
        }
        self.wire_ids.insert(entity, id);
        Some(id)
    }

    /// Brings the client's proxies in line with what is visible through
    /// `portals` this tick. Destroys always precede spawns.
    pub fn update(&mut self, portals: &[VisiblePortal], entities: &[EntitySnapshot]) -> Vec<S2C> {
        tick_guards(&mut self.guards);

        let by_id: FxHashMap<EntityId, &EntitySnapshot> =
            entities.iter().map(|entity| (entity.id, entity)).collect();

        // Entity -> index of the portal it is seen through.
        let mut visible: FxHashMap<EntityId, usize> = FxHashMap::default();
        for entity in entities {
            let center = entity.bounding_box().center();
            if let Some(index) = portals.iter().position(|portal| {
                portal
                    .frustum
                    .contains(portal.transform.untransform_position(center))
            }) {
                visible.insert(entity.id, index);
            }
        }

        // Keep last tick's vehicles for one more tick so mounting and
        // dismounting never leave a gap.
        for (rider, vehicle) in &self.last_vehicles {
            if let Some(&index) = visible.get(rider) {
                if by_id.contains_key(vehicle) {
                    visible.entry(*vehicle).or_insert(index);
                }
            }
        }
        loop {
            let missing: Vec<(EntityId, usize)> = visible
                .iter()
                .filter_map(|(id, index)| {
                    let vehicle = by_id.get(id)?.vehicle?;
                    (by_id.contains_key(&vehicle) && !visible.contains_key(&vehicle))
                        .then_some((vehicle, *index))
                })
                .collect();
            if missing.is_empty() {
                break;
            }
            visible.extend(missing);
        }
        self.last_vehicles = entities
            .iter()
            .filter(|entity| visible.contains_key(&entity.id))
            .filter_map(|entity| entity.vehicle.map(|vehicle| (entity.id, vehicle)))
            .collect();

        let mut messages = Vec::new();

        let mut leaving: Vec<EntityId> = self
            .shown
            .keys()
            .filter(|id| !visible.contains_key(*id))
            .copied()
            .collect();
        leaving.sort();
        if !leaving.is_empty() {
            let mut ids = Vec::with_capacity(leaving.len());
            for id in leaving {
                self.shown.remove(&id);
                self.guards.insert(id, self.guard_ticks);
                if let Some(wire) = self.wire_ids.get(&id) {
                    ids.push(*wire);
                }
            }
            messages.push(S2C::EntityDestroy { ids });
        }

        let mut entering: Vec<EntityId> = visible
            .keys()
            .filter(|id| !self.shown.contains_key(*id) && !self.guards.contains_key(*id))
            .copied()
            .collect();
        entering.sort();
        let entered: FxHashSet<EntityId> = entering.iter().copied().collect();
        for id in entering {
            let Some(entity) = by_id.get(&id) else {
                continue;
            };
            let Some(wire) = self.allocate(id) else {
                continue;
            };
            let motion = Motion::through(entity, &portals[visible[&id]].transform);
            trace!("Spawning proxy {wire:?} for {id:?}");
            messages.extend(spawn_sequence(wire, entity, motion));
            self.shown.insert(
                id,
                ShownProxy {
                    motion,
                    passengers: Vec::new(),
                },
            );
        }

        let mut staying: Vec<EntityId> = self
            .shown
            .keys()
            .filter(|id| !entered.contains(*id))
            .copied()
            .collect();
        staying.sort();
        for id in staying {
            let (Some(entity), Some(&index), Some(&wire)) =
                (by_id.get(&id), visible.get(&id), self.wire_ids.get(&id))
            else {
                continue;
            };
            let motion = Motion::through(entity, &portals[index].transform);
            if let Some(proxy) = self.shown.get_mut(&id) {
                if proxy.motion != motion {
                    proxy.motion = motion;
                    messages.push(motion.to_move(wire));
                }
            }
            if !entity.dirty_attributes.is_empty() {
                messages.push(S2C::EntityAttributes {
                    id: wire,
                    attributes: entity.dirty_attributes.clone(),
                });
            }
        }

        messages.extend(self.passenger_updates(entities));

        // Forget ids for entities that are gone and not on screen.
        self.wire_ids
            .retain(|id, _| by_id.contains_key(id) || self.shown.contains_key(id));
        messages
    }

    fn passenger_updates(&mut self, entities: &[EntitySnapshot]) -> Vec<S2C> {
        let mut riders: FxHashMap<EntityId, Vec<WireEntityId>> = FxHashMap::default();
        for entity in entities {
            let Some(vehicle) = entity.vehicle else {
                continue;
            };
            if !self.shown.contains_key(&entity.id) {
                continue;
            }
            if let Some(wire) = self.wire_ids.get(&entity.id) {
                riders.entry(vehicle).or_default().push(*wire);
            }
        }

        let mut vehicles: Vec<EntityId> = self.shown.keys().copied().collect();
        vehicles.sort();
        let mut messages = Vec::new();
        for vehicle in vehicles {
            let mut passengers = riders.remove(&vehicle).unwrap_or_default();
            passengers.sort();
            let (Some(proxy), Some(&wire)) =
                (self.shown.get_mut(&vehicle), self.wire_ids.get(&vehicle))
            else {
                continue;
            };
            if proxy.passengers != passengers {
                proxy.passengers = passengers.clone();
                messages.push(S2C::EntityPassengers {
                    vehicle: wire,
                    passengers,
                });
            }
        }
        messages
    }

    /// Destroys every shown proxy and forgets all per-entity state. Ids are
    /// not reused afterwards.
    pub fn destroy_all(&mut self) -> Vec<S2C> {
        let mut ids: Vec<WireEntityId> = self
            .shown
            .keys()
            .filter_map(|id| self.wire_ids.get(id).copied())
            .collect();
        ids.sort();
        self.shown.clear();
        self.guards.clear();
        self.last_vehicles.clear();
        self.wire_ids.clear();
        if ids.is_empty() {
            Vec::new()
        } else {
            vec![S2C::EntityDestroy { ids }]
        }
    }
}
