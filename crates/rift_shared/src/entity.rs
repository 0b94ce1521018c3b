use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::physics::AABB;

/// Host-side entity identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Identity as seen by a client. Non-negative values mirror host ids;
/// negative values are reserved for client-local proxies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WireEntityId(pub i32);

impl WireEntityId {
    pub fn is_proxy(self) -> bool {
        self.0 < 0
    }
}

impl From<EntityId> for WireEntityId {
    fn from(id: EntityId) -> Self {
        Self(id.0.min(i32::MAX as u32) as i32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Player,
    Chicken,
    Pig,
    Cow,
    Zombie,
    Skeleton,
    Minecart,
    Boat,
}

impl EntityKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "player" => Some(Self::Player),
            "chicken" => Some(Self::Chicken),
            "pig" => Some(Self::Pig),
            "cow" => Some(Self::Cow),
            "zombie" => Some(Self::Zombie),
            "skeleton" => Some(Self::Skeleton),
            "minecart" => Some(Self::Minecart),
            "boat" => Some(Self::Boat),
            _ => None,
        }
    }

    /// Hitbox (width, height).
    pub fn dimensions(self) -> (f32, f32) {
        match self {
            EntityKind::Player => (0.6, 1.8),
            EntityKind::Chicken => (0.4, 0.7),
            EntityKind::Pig => (0.9, 0.9),
            EntityKind::Cow => (0.9, 1.4),
            EntityKind::Zombie | EntityKind::Skeleton => (0.6, 1.95),
            EntityKind::Minecart => (0.98, 0.7),
            EntityKind::Boat => (1.375, 0.5625),
        }
    }

    pub fn eye_height(self) -> f32 {
        self.dimensions().1 * 0.85
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EquipmentSlot {
    MainHand,
    OffHand,
    Head,
    Chest,
    Legs,
    Feet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: u16,
    pub count: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Flag(bool),
    Int(i32),
    Float(f32),
}

/// One entry of an entity's tracked state (health, pose, flags and so on).
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedAttribute {
    pub key: u8,
    pub value: AttributeValue,
}

/// Immutable copy of one entity captured on the host thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub head_yaw: f32,
    pub on_ground: bool,
    pub vehicle: Option<EntityId>,
    pub equipment: Vec<(EquipmentSlot, ItemStack)>,
    pub attributes: Vec<TrackedAttribute>,
    /// Attributes changed since the previous host tick.
    pub dirty_attributes: Vec<TrackedAttribute>,
}

impl EntitySnapshot {
    pub fn new(id: EntityId, kind: EntityKind, position: Vec3) -> Self {
        Self {
            id,
            kind,
            position,
            velocity: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            head_yaw: 0.0,
            on_ground: true,
            vehicle: None,
            equipment: Vec::new(),
            attributes: Vec::new(),
            dirty_attributes: Vec::new(),
        }
    }

    pub fn bounding_box(&self) -> AABB {
        let (width, height) = self.kind.dimensions();
        let half = width * 0.5;
        AABB {
            min: self.position - Vec3::new(half, 0.0, half),
            max: self.position + Vec3::new(half, height, half),
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::{EntityId, EntityKind, EntitySnapshot, WireEntityId};

    #[test]
    fn wire_ids_mirror_host_ids() {
        assert_eq!(WireEntityId::from(EntityId(42)), WireEntityId(42));
        assert!(!WireEntityId::from(EntityId(0)).is_proxy());
        assert!(WireEntityId(-1).is_proxy());
    }

    #[test]
    fn bounding_box_sits_on_feet_position() {
        let cow = EntitySnapshot::new(EntityId(1), EntityKind::Cow, Vec3::new(10.0, 64.0, -2.0));
        let aabb = cow.bounding_box();
        assert!(aabb.contains(Vec3::new(10.0, 64.5, -2.0)));
        assert!(!aabb.contains(Vec3::new(10.0, 63.9, -2.0)));
        assert!((aabb.max.y - 65.4).abs() < 1e-5);
    }

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!(EntityKind::parse("Zombie"), Some(EntityKind::Zombie));
        assert_eq!(EntityKind::parse("dragon"), None);
    }
}
