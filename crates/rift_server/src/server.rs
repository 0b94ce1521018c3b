use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{IVec3, Vec3};
use rift_engine::linker::MatchingPortalLinker;
use rift_engine::{ClientFlags, PortalEngine, WorldId};
use rift_shared::block::{register_default_blocks, BlockId, BlockRegistry};
use rift_shared::coords::{world_to_chunk, ChunkPos};
use rift_shared::entity::{EntityId, EntityKind, EntitySnapshot, WireEntityId};
use rift_shared::physics::AABB;
use rift_shared::protocol::{self, C2S, S2C};
use tracing::{debug, info, warn};

use crate::commands::{self, parse_self_toggle, Command};
use crate::config::ServerConfig;
use crate::host::{NetworkSink, ServerHost};
use crate::net::{NetworkServer, RELIABLE_ORDERED_CHANNEL, UNRELIABLE_CHANNEL};
use crate::player::PlayerState;
use crate::world::{WorldSet, OVERWORLD, SPAWN_POSITION, SPAWN_YAW};

const TICK_RATE: u32 = 20;
const TICK_DURATION: Duration = Duration::from_millis(1000 / TICK_RATE as u64);
const MAX_BLOCK_EDIT_REACH: f32 = 8.0;
const MAX_BLOCK_EDIT_REACH_SQ: f32 = MAX_BLOCK_EDIT_REACH * MAX_BLOCK_EDIT_REACH;
const MAX_PLAYER_MOVE_PER_TICK: f32 = 1.5;
const ENTITY_TRACKING_RANGE: f32 = 48.0;

pub struct Server {
    config: ServerConfig,
    network: NetworkServer,
    worlds: WorldSet,
    blocks: BlockRegistry,
    engine: PortalEngine,
    players: HashMap<u64, PlayerState>,
    tick: u64,
    running: Arc<AtomicBool>,
    command_rx: Receiver<Command>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        running: Arc<AtomicBool>,
        command_rx: Receiver<Command>,
    ) -> io::Result<Self> {
        let network = NetworkServer::bind(config.port)?;
        let linker = Arc::new(MatchingPortalLinker::new(
            config.engine.destination_offset(),
            config.engine.link_search_radius,
        ));
        let engine = PortalEngine::start(config.engine.clone(), register_default_blocks(), linker)
            .map_err(io::Error::other)?;

        Ok(Self {
            network,
            worlds: WorldSet::paired(),
            blocks: register_default_blocks(),
            engine,
            players: HashMap::new(),
            tick: 0,
            config,
            running,
            command_rx,
        })
    }

    pub fn run(&mut self) {
        info!("Starting riftview server on port {}", self.config.port);

        while self.running.load(Ordering::SeqCst) {
            let tick_start = Instant::now();

            self.handle_console_commands();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.network.update(TICK_DURATION);
            self.handle_connections();
            self.handle_disconnections();
            self.receive_messages();
            self.tick += 1;

            self.sync_tracked_entities();
            self.engine.collect(&ServerHost {
                worlds: &self.worlds,
                players: &self.players,
            });
            self.engine.apply(&mut NetworkSink {
                network: &mut self.network,
                players: &mut self.players,
            });
            if !self.engine.is_running() {
                warn!("Portal engine stopped unexpectedly");
            }

            let elapsed = tick_start.elapsed();
            if elapsed < TICK_DURATION {
                std::thread::sleep(TICK_DURATION - elapsed);
            }
        }

        self.engine.shutdown(&mut NetworkSink {
            network: &mut self.network,
            players: &mut self.players,
        });
        self.disconnect_all_players();
        self.network.update(Duration::from_millis(0));
        self.handle_disconnections();
        info!("Server stopped. Goodbye!");
    }

    fn handle_connections(&mut self) {
        for client_id in self.network.take_connected() {
            let addr = self
                .network
                .client_addr(client_id)
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            info!("Client {client_id} connected from {addr}, waiting for handshake");
        }
    }

    fn handle_disconnections(&mut self) {
        for (client_id, addr) in self.network.take_disconnected() {
            let addr = addr.map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
            info!("Client disconnects: addr={addr}, id={client_id}");
            let Some(player) = self.players.remove(&client_id) else {
                continue;
            };
            self.worlds.remove_entity(player.world, player.entity);
        }
    }

    fn receive_messages(&mut self) {
        for client_id in self.network.connected_clients() {
            while let Some(data) = self.network.receive(client_id, RELIABLE_ORDERED_CHANNEL) {
                match protocol::decode::<C2S>(&data) {
                    Ok(msg) => self.handle_c2s(client_id, msg),
                    Err(err) => warn!("Failed to decode reliable C2S from {client_id}: {err}"),
                }
            }

            while let Some(data) = self.network.receive(client_id, UNRELIABLE_CHANNEL) {
                match protocol::decode::<C2S>(&data) {
                    Ok(msg) => self.handle_c2s(client_id, msg),
                    Err(err) => warn!("Failed to decode unreliable C2S from {client_id}: {err}"),
                }
            }
        }
    }

    fn handle_c2s(&mut self, client_id: u64, msg: C2S) {
        match msg {
            C2S::Handshake {
                protocol_version,
                username,
            } => self.handle_handshake(client_id, protocol_version, username),
            C2S::RequestChunks { positions } => {
                let Some(player) = self.players.get_mut(&client_id) else {
                    warn!("Ignoring RequestChunks from non-handshaken client {client_id}");
                    return;
                };
                let Some(world) = self.worlds.get(player.world) else {
                    return;
                };

                debug!(
                    "Streaming {} chunk(s) of world {} to {client_id}",
                    positions.len(),
                    player.world.0
                );
                for pos in positions {
                    let chunk = world.chunk(pos);
                    let response = S2C::ChunkData {
                        pos,
                        data: protocol::encode(&*chunk),
                    };
                    self.network
                        .send(client_id, RELIABLE_ORDERED_CHANNEL, &response);
                    self.engine.invalidate_chunk(client_id, pos);
                    player.received_chunks.insert(pos);
                }
            }
            C2S::BlockEdit {
                world_pos,
                new_block,
            } => self.handle_block_edit(client_id, world_pos, new_block),
            C2S::PlayerInput {
                tick: _client_tick,
                position,
                yaw,
                pitch,
            } => {
                let Some(player) = self.players.get_mut(&client_id) else {
                    warn!("Ignoring PlayerInput from non-handshaken client {client_id}");
                    return;
                };

                let elapsed_ticks = self.tick.saturating_sub(player.last_position_tick).max(1);
                let max_distance = MAX_PLAYER_MOVE_PER_TICK * elapsed_ticks as f32;
                let delta = position - player.position;
                let distance = delta.length();
                if distance > max_distance {
                    warn!(
                        "Suspicious movement from {client_id}: moved {:.2} blocks in {} tick(s), max {:.2}",
                        distance, elapsed_ticks, max_distance
                    );
                    player.position += delta.normalize_or_zero() * max_distance;
                } else {
                    player.position = position;
                }
                player.last_position_tick = self.tick;
                player.yaw = yaw;
                player.pitch = pitch;

                let (world, entity, position) = (player.world, player.entity, player.position);
                self.worlds.move_entity(world, entity, position, yaw, pitch);
            }
            C2S::Chat { message } => self.handle_chat(client_id, message),
            C2S::Disconnect => {
                info!("Disconnect message received from client {client_id}");
                self.network.disconnect(client_id);
            }
        }
    }

    fn handle_handshake(&mut self, client_id: u64, protocol_version: u32, username: String) {
        info!("Handshake from {client_id}: username='{username}', protocol={protocol_version}");
        if protocol_version != protocol::PROTOCOL_VERSION {
            let reject = S2C::HandshakeReject {
                reason: format!(
                    "Unsupported protocol version {protocol_version}, expected {}",
                    protocol::PROTOCOL_VERSION
                ),
            };
            self.network
                .send(client_id, RELIABLE_ORDERED_CHANNEL, &reject);
            self.network.disconnect(client_id);
            return;
        }
        if self.players.contains_key(&client_id) {
            warn!("Ignoring repeated handshake from {client_id}");
            return;
        }

        let Some(entity) = self
            .worlds
            .spawn_entity(OVERWORLD, EntityKind::Player, SPAWN_POSITION)
        else {
            warn!("Spawn world is missing; rejecting {client_id}");
            self.network.disconnect(client_id);
            return;
        };
        self.worlds
            .move_entity(OVERWORLD, entity, SPAWN_POSITION, SPAWN_YAW, 0.0);

        let mut player = PlayerState::new(client_id, username, entity, OVERWORLD);
        player.position = SPAWN_POSITION;
        player.yaw = SPAWN_YAW;
        player.last_position_tick = self.tick;
        self.players.insert(client_id, player);

        let accept = S2C::HandshakeAccept {
            player_id: client_id,
            entity_id: entity.into(),
            spawn_position: SPAWN_POSITION,
            tick_rate: TICK_RATE,
        };
        self.network
            .send(client_id, RELIABLE_ORDERED_CHANNEL, &accept);
        info!("Player {client_id} joined as entity {}", entity.0);
    }

    fn handle_block_edit(&mut self, client_id: u64, world_pos: IVec3, new_block: BlockId) {
        let Some(player) = self.players.get(&client_id) else {
            self.send_block_edit_reject(
                client_id,
                world_pos,
                "handshake required before editing blocks".to_string(),
            );
            return;
        };

        if usize::from(new_block.0) >= self.blocks.len() {
            self.send_block_edit_reject(
                client_id,
                world_pos,
                format!("invalid block id {}", new_block.0),
            );
            return;
        }

        // Cells around the portal may show the other world on this client.
        if player.is_near_portal() {
            self.send_block_edit_reject(
                client_id,
                world_pos,
                "cannot edit blocks while standing next to a portal".to_string(),
            );
            return;
        }

        let block_center = world_pos.as_vec3() + Vec3::splat(0.5);
        let distance_sq = player.eye().distance_squared(block_center);
        if distance_sq > MAX_BLOCK_EDIT_REACH_SQ {
            self.send_block_edit_reject(
                client_id,
                world_pos,
                format!(
                    "block out of reach: distance {:.2} > max {:.2}",
                    distance_sq.sqrt(),
                    MAX_BLOCK_EDIT_REACH
                ),
            );
            return;
        }

        let world_id = player.world;
        let Some(world) = self.worlds.get_mut(world_id) else {
            return;
        };
        if !world.contains_y(world_pos.y) {
            self.send_block_edit_reject(client_id, world_pos, "outside the world".to_string());
            return;
        }
        let previous = world.block(world_pos);
        if world.set_block(world_pos, new_block) {
            debug!(
                "Client {client_id} set {world_pos} from {} to {} in world {}",
                previous.0, new_block.0, world_id.0
            );
            self.broadcast_block_change(world_id, world_pos, new_block);
        }
    }

    fn handle_chat(&mut self, client_id: u64, message: String) {
        let Some(player) = self.players.get_mut(&client_id) else {
            warn!("Ignoring Chat from non-handshaken client {client_id}");
            return;
        };

        if let Some(rest) = message.strip_prefix("/portals") {
            let reply = match parse_self_toggle(rest) {
                Ok(enabled) => {
                    let enabled = enabled.unwrap_or(!player.portals_enabled());
                    player.flags.set(ClientFlags::ENABLED, enabled);
                    info!("{} turned portal views {}", player.username, on_off(enabled));
                    format!("Portal views {}", on_off(enabled))
                }
                Err(usage) => usage.to_string(),
            };
            self.send_server_chat(client_id, reply);
            return;
        }

        let chat = S2C::Chat {
            sender_id: client_id,
            sender_name: player.username.clone(),
            message,
        };
        let encoded = protocol::encode(&chat);
        for &cid in self.players.keys() {
            self.network
                .send_encoded(cid, RELIABLE_ORDERED_CHANNEL, encoded.clone());
        }
    }

    fn handle_console_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            self.execute_console_command(command);
        }
    }

    fn execute_console_command(&mut self, command: Command) {
        match command {
            Command::Noop => {}
            Command::Stop => self.request_shutdown("console /stop"),
            Command::List => self.log_player_list(),
            Command::Portals { player, enabled } => match self.resolve_player_target(&player) {
                Ok(client_id) => {
                    if let Some(target) = self.players.get_mut(&client_id) {
                        let enabled = enabled.unwrap_or(!target.portals_enabled());
                        target.flags.set(ClientFlags::ENABLED, enabled);
                        info!(
                            "[CONSOLE] portal views {} for {} (id {client_id})",
                            on_off(enabled),
                            target.username
                        );
                        let reply = format!("Portal views {}", on_off(enabled));
                        self.send_server_chat(client_id, reply);
                    }
                }
                Err(err) => warn!("[CONSOLE] /portals failed: {err}"),
            },
            Command::Summon { kind, world, x, y, z } => {
                let position = Vec3::new(x, y, z);
                match self.worlds.spawn_entity(WorldId(world), kind, position) {
                    Some(id) => info!(
                        "[CONSOLE] summoned {kind:?} {} in world {world} at {position}",
                        id.0
                    ),
                    None => warn!("[CONSOLE] /summon failed: no world {world}"),
                }
            }
            Command::Help => self.log_help(),
            Command::InvalidUsage(message) => warn!("[CONSOLE] {message}"),
            Command::Unknown(input) => {
                warn!("[CONSOLE] unknown command '{input}' (try /help)")
            }
        }
    }

    fn request_shutdown(&mut self, source: &str) {
        info!("Shutdown requested via {source}");
        let clients: Vec<u64> = self.players.keys().copied().collect();
        for client_id in clients {
            self.send_server_chat(client_id, "Server shutting down...".to_string());
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn disconnect_all_players(&mut self) {
        let connected = self.network.connected_clients();
        if connected.is_empty() {
            return;
        }

        info!("Disconnecting {} connected player(s)", connected.len());
        for client_id in connected {
            self.network.disconnect(client_id);
        }
    }

    fn resolve_player_target(&self, target: &str) -> Result<u64, String> {
        if let Ok(client_id) = target.parse::<u64>() {
            if self.players.contains_key(&client_id) {
                return Ok(client_id);
            }
            return Err(format!("player id {client_id} is not connected"));
        }

        let mut matches = self
            .players
            .iter()
            .filter(|(_, player)| player.username.eq_ignore_ascii_case(target))
            .map(|(client_id, _)| *client_id);

        let Some(first_match) = matches.next() else {
            return Err(format!("player '{target}' is not connected"));
        };

        if matches.next().is_some() {
            return Err(format!(
                "multiple players match '{target}', use /list and target by id"
            ));
        }

        Ok(first_match)
    }

    fn send_server_chat(&mut self, client_id: u64, message: String) {
        let chat = S2C::Chat {
            sender_id: 0,
            sender_name: "Server".to_string(),
            message,
        };
        self.network
            .send(client_id, RELIABLE_ORDERED_CHANNEL, &chat);
    }

    fn log_player_list(&self) {
        for world in self.worlds.iter() {
            info!(
                "[CONSOLE] world {}: {} entit(ies), {} edited chunk(s)",
                world.id().0,
                world.entity_count(),
                world.store().edited_count()
            );
        }
        if self.players.is_empty() {
            info!("[CONSOLE] no connected players");
            return;
        }

        let mut players: Vec<&PlayerState> = self.players.values().collect();
        players.sort_by_key(|player| player.player_id);
        info!("[CONSOLE] connected players ({}):", players.len());
        for player in players {
            info!(
                "[CONSOLE] - {} (id: {}, world: {}, portals: {})",
                player.username,
                player.player_id,
                player.world.0,
                on_off(player.portals_enabled())
            );
        }
    }

    fn log_help(&self) {
        info!("[CONSOLE] Available commands:");
        info!("[CONSOLE]   /help");
        info!("[CONSOLE]   /list");
        info!("[CONSOLE]   /portals <player|id> [on|off]");
        info!("[CONSOLE]   /summon <kind> <world> <x> <y> <z>");
        info!("[CONSOLE]   /stop");
    }

    /// Spawns, moves and destroys real entities on each client according to
    /// tracking range. Portal views layer their own changes on top.
    fn sync_tracked_entities(&mut self) {
        for player in self.players.values_mut() {
            let Some(world) = self.worlds.get(player.world) else {
                continue;
            };
            let viewer = player.entity;
            let range = AABB::from_center(player.position, Vec3::splat(ENTITY_TRACKING_RANGE));
            let visible = world.entities_in(&range, &|entity: &EntitySnapshot| entity.id != viewer);
            let present: HashSet<EntityId> = visible.iter().map(|entity| entity.id).collect();

            let mut messages = Vec::new();
            let mut gone: Vec<EntityId> = player
                .tracked
                .keys()
                .filter(|id| !present.contains(*id))
                .copied()
                .collect();
            if !gone.is_empty() {
                gone.sort_unstable();
                for id in &gone {
                    player.tracked.remove(id);
                }
                messages.push(S2C::EntityDestroy {
                    ids: gone.into_iter().map(WireEntityId::from).collect(),
                });
            }

            for entity in &visible {
                match player.tracked.insert(entity.id, entity.position) {
                    None => messages.push(S2C::EntitySpawn {
                        id: entity.id.into(),
                        kind: entity.kind,
                        position: entity.position,
                        velocity: entity.velocity,
                        yaw: entity.yaw,
                        pitch: entity.pitch,
                        head_yaw: entity.head_yaw,
                    }),
                    Some(last) if last != entity.position => messages.push(S2C::EntityMove {
                        id: entity.id.into(),
                        position: entity.position,
                        velocity: entity.velocity,
                        yaw: entity.yaw,
                        pitch: entity.pitch,
                        head_yaw: entity.head_yaw,
                        on_ground: entity.on_ground,
                    }),
                    Some(_) => {}
                }
            }

            for message in messages {
                self.network
                    .send(player.player_id, RELIABLE_ORDERED_CHANNEL, &message);
            }
        }
    }

    /// Sends a true-world cell change to every player in `world` holding
    /// the chunk that contains it.
    fn broadcast_block_change(&mut self, world: WorldId, world_pos: IVec3, block: BlockId) {
        let (section, local) = world_to_chunk(world_pos);
        let update = S2C::BlockUpdates {
            section,
            changes: vec![(local, block)],
        };
        let encoded = protocol::encode(&update);
        for recipient in self.chunk_recipients(world, section) {
            self.network
                .send_encoded(recipient, RELIABLE_ORDERED_CHANNEL, encoded.clone());
            self.engine.invalidate_cells(recipient, &[world_pos]);
        }
    }

    fn chunk_recipients(&self, world: WorldId, chunk_pos: ChunkPos) -> Vec<u64> {
        self.players
            .values()
            .filter(|player| player.world == world && player.received_chunks.contains(&chunk_pos))
            .map(|player| player.player_id)
            .collect()
    }

    fn send_block_edit_reject(&mut self, client_id: u64, world_pos: IVec3, reason: String) {
        let reject = S2C::BlockEditReject { world_pos, reason };
        self.network
            .send(client_id, RELIABLE_ORDERED_CHANNEL, &reject);
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

pub fn run(config: ServerConfig, running: Arc<AtomicBool>) -> io::Result<()> {
    let (command_tx, command_rx) = mpsc::channel();
    spawn_console_command_thread(command_tx);

    let mut server = Server::new(config, running, command_rx)?;
    server.run();
    Ok(())
}

fn spawn_console_command_thread(command_tx: Sender<Command>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line_result in stdin.lock().lines() {
            let line = match line_result {
                Ok(line) => line,
                Err(err) => {
                    warn!("Failed to read server console input: {err}");
                    break;
                }
            };

            let command = commands::parse_command(&line);
            if command_tx.send(command).is_err() {
                break;
            }
        }
    });
}
