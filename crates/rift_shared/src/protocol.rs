use glam::{IVec3, Vec3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::block::{BlockEntity, BlockId};
use crate::coords::{ChunkPos, LocalPos};
use crate::entity::{EntityKind, EquipmentSlot, ItemStack, TrackedAttribute, WireEntityId};

pub const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum C2S {
    Handshake {
        protocol_version: u32,
        username: String,
    },
    RequestChunks {
        positions: Vec<ChunkPos>,
    },
    BlockEdit {
        world_pos: IVec3,
        new_block: BlockId,
    },
    PlayerInput {
        tick: u64,
        position: Vec3,
        yaw: f32,
        pitch: f32,
    },
    Chat {
        message: String,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum S2C {
    HandshakeAccept {
        player_id: u64,
        entity_id: WireEntityId,
        spawn_position: Vec3,
        tick_rate: u32,
    },
    HandshakeReject {
        reason: String,
    },
    ChunkData {
        pos: ChunkPos,
        data: Vec<u8>,
    },
    ChunkUnload {
        pos: ChunkPos,
    },
    /// Cell updates scoped to one chunk section.
    BlockUpdates {
        section: ChunkPos,
        changes: Vec<(LocalPos, BlockId)>,
    },
    BlockEntityUpdate {
        entity: BlockEntity,
    },
    BlockEditReject {
        world_pos: IVec3,
        reason: String,
    },
    EntitySpawn {
        id: WireEntityId,
        kind: EntityKind,
        position: Vec3,
        velocity: Vec3,
        yaw: f32,
        pitch: f32,
        head_yaw: f32,
    },
    EntityMove {
        id: WireEntityId,
        position: Vec3,
        velocity: Vec3,
        yaw: f32,
        pitch: f32,
        head_yaw: f32,
        on_ground: bool,
    },
    EntityEquipment {
        id: WireEntityId,
        slots: Vec<(EquipmentSlot, ItemStack)>,
    },
    EntityAttributes {
        id: WireEntityId,
        attributes: Vec<TrackedAttribute>,
    },
    EntityDestroy {
        ids: Vec<WireEntityId>,
    },
    EntityPassengers {
        vehicle: WireEntityId,
        passengers: Vec<WireEntityId>,
    },
    /// Messages the client applies as one unit.
    Bundle {
        messages: Vec<S2C>,
    },
    Chat {
        sender_id: u64,
        sender_name: String,
        message: String,
    },
}

pub fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).expect("failed to encode protocol payload")
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use glam::{IVec3, Vec3};

    use super::{decode, encode, C2S, S2C};
    use crate::block::{BlockEntity, BlockEntityData, BlockId};
    use crate::coords::{ChunkPos, LocalPos};
    use crate::entity::{EntityKind, WireEntityId};

    #[test]
    fn player_input_survives_the_wire() {
        let input = C2S::PlayerInput {
            tick: 12,
            position: Vec3::new(4.0, 65.2, -7.5),
            yaw: 0.7,
            pitch: -0.3,
        };
        let bytes = encode(&input);
        let decoded: C2S = decode(&bytes).expect("decode C2S player input");
        assert_eq!(decoded, input);
    }

    #[test]
    fn bundles_nest_block_and_entity_messages() {
        let bundle = S2C::Bundle {
            messages: vec![
                S2C::EntityDestroy {
                    ids: vec![WireEntityId(-1)],
                },
                S2C::EntitySpawn {
                    id: WireEntityId(-2),
                    kind: EntityKind::Pig,
                    position: Vec3::new(1.0, 65.0, 3.0),
                    velocity: Vec3::ZERO,
                    yaw: 0.5,
                    pitch: 0.0,
                    head_yaw: 0.5,
                },
                S2C::BlockUpdates {
                    section: ChunkPos { x: 0, y: 4, z: 0 },
                    changes: vec![(LocalPos { x: 1, y: 1, z: 0 }, BlockId::STONE)],
                },
                S2C::BlockEntityUpdate {
                    entity: BlockEntity {
                        pos: IVec3::new(1, 65, 0),
                        data: BlockEntityData::Container {
                            title: "chest".to_string(),
                            slots: vec![None],
                        },
                    },
                },
            ],
        };
        let bytes = encode(&bundle);
        let decoded: S2C = decode(&bytes).expect("decode S2C bundle");
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let bytes = encode(&C2S::Chat {
            message: "/portals off".to_string(),
        });
        assert!(decode::<C2S>(&bytes[..bytes.len() - 2]).is_err());
    }
}
