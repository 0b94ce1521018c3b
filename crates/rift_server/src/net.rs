use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use renet::{ChannelConfig, ConnectionConfig, RenetServer, SendType, ServerEvent};
use rift_shared::protocol::{self, S2C};
use tracing::{info, warn};

pub const RELIABLE_ORDERED_CHANNEL: u8 = 0;
pub const UNRELIABLE_CHANNEL: u8 = 1;

pub const MAX_CLIENTS: usize = 32;

/// Two-way mapping between peer addresses and the ids renet knows them by.
#[derive(Default)]
struct AddressBook {
    by_client: HashMap<u64, SocketAddr>,
    by_addr: HashMap<SocketAddr, u64>,
    next_client_id: u64,
}

impl AddressBook {
    fn lookup(&self, addr: SocketAddr) -> Option<u64> {
        self.by_addr.get(&addr).copied()
    }

    fn assign(&mut self, addr: SocketAddr) -> u64 {
        self.next_client_id = self.next_client_id.saturating_add(1);
        let client_id = self.next_client_id;
        self.by_addr.insert(addr, client_id);
        self.by_client.insert(client_id, addr);
        client_id
    }

    fn addr(&self, client_id: u64) -> Option<SocketAddr> {
        self.by_client.get(&client_id).copied()
    }

    fn release(&mut self, client_id: u64) -> Option<SocketAddr> {
        let addr = self.by_client.remove(&client_id)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }

    fn len(&self) -> usize {
        self.by_client.len()
    }
}

/// renet server driven over a plain nonblocking UDP socket.
pub struct NetworkServer {
    server: RenetServer,
    socket: UdpSocket,
    addresses: AddressBook,
    connected_events: Vec<u64>,
    disconnected_events: Vec<(u64, Option<SocketAddr>)>,
}

impl NetworkServer {
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        info!("Listening on UDP 0.0.0.0:{port}");

        Ok(Self {
            server: RenetServer::new(Self::connection_config()),
            socket,
            addresses: AddressBook::default(),
            connected_events: Vec::new(),
            disconnected_events: Vec::new(),
        })
    }

    pub fn update(&mut self, dt: Duration) {
        self.server.update(dt);
        self.process_incoming_packets();

        for client_id in self.server.disconnections_id() {
            self.server.remove_connection(client_id);
        }

        self.process_server_events();
        self.flush_outgoing_packets();
    }

    pub fn send(&mut self, client_id: u64, channel: u8, message: &S2C) {
        self.server
            .send_message(client_id, channel, protocol::encode(message));
    }

    pub fn send_encoded(&mut self, client_id: u64, channel: u8, data: Vec<u8>) {
        self.server.send_message(client_id, channel, data);
    }

    pub fn receive(&mut self, client_id: u64, channel: u8) -> Option<Vec<u8>> {
        self.server
            .receive_message(client_id, channel)
            .map(|bytes| bytes.to_vec())
    }

    pub fn connected_clients(&self) -> Vec<u64> {
        self.server.clients_id()
    }

    pub fn is_connected(&self, client_id: u64) -> bool {
        self.server.is_connected(client_id)
    }

    pub fn disconnect(&mut self, client_id: u64) {
        self.server.disconnect(client_id);
    }

    pub fn client_addr(&self, client_id: u64) -> Option<SocketAddr> {
        self.addresses.addr(client_id)
    }

    pub fn take_connected(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.connected_events)
    }

    /// Clients that left since the last call, with the address they had.
    pub fn take_disconnected(&mut self) -> Vec<(u64, Option<SocketAddr>)> {
        std::mem::take(&mut self.disconnected_events)
    }

    fn connection_config() -> ConnectionConfig {
        const CHANNEL_MEMORY_BYTES: usize = 32 * 1024 * 1024;
        let channels = vec![
            ChannelConfig {
                channel_id: RELIABLE_ORDERED_CHANNEL,
                max_memory_usage_bytes: CHANNEL_MEMORY_BYTES,
                send_type: SendType::ReliableOrdered {
                    resend_time: Duration::from_millis(250),
                },
            },
            ChannelConfig {
                channel_id: UNRELIABLE_CHANNEL,
                max_memory_usage_bytes: CHANNEL_MEMORY_BYTES,
                send_type: SendType::Unreliable,
            },
        ];

        ConnectionConfig {
            available_bytes_per_tick: 200_000,
            server_channels_config: channels.clone(),
            client_channels_config: channels,
        }
    }

    fn process_incoming_packets(&mut self) {
        let mut packet_buffer = [0u8; 65_535];
        loop {
            match self.socket.recv_from(&mut packet_buffer) {
                Ok((bytes_received, from_addr)) => {
                    let Some(client_id) = self.resolve_client_id(from_addr) else {
                        continue;
                    };
                    if let Err(err) = self
                        .server
                        .process_packet_from(&packet_buffer[..bytes_received], client_id)
                    {
                        warn!("failed processing packet from {from_addr} for client {client_id}: {err}");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("UDP receive error: {err}");
                    break;
                }
            }
        }
    }

    fn process_server_events(&mut self) {
        while let Some(event) = self.server.get_event() {
            match event {
                ServerEvent::ClientConnected { client_id } => {
                    self.connected_events.push(client_id);
                }
                ServerEvent::ClientDisconnected { client_id, .. } => {
                    let addr = self.addresses.release(client_id);
                    self.disconnected_events.push((client_id, addr));
                }
            }
        }
    }

    fn flush_outgoing_packets(&mut self) {
        for client_id in self.server.clients_id() {
            let Some(addr) = self.addresses.addr(client_id) else {
                continue;
            };

            let Ok(packets) = self.server.get_packets_to_send(client_id) else {
                continue;
            };

            for packet in packets {
                if let Err(err) = self.socket.send_to(&packet, addr) {
                    if err.kind() != ErrorKind::WouldBlock && err.kind() != ErrorKind::Interrupted
                    {
                        warn!("failed sending packet to client {client_id} ({addr}): {err}");
                    }
                }
            }
        }
    }

    fn resolve_client_id(&mut self, addr: SocketAddr) -> Option<u64> {
        if let Some(client_id) = self.addresses.lookup(addr) {
            return Some(client_id);
        }
        if self.addresses.len() >= MAX_CLIENTS {
            return None;
        }

        let client_id = self.addresses.assign(addr);
        self.server.add_connection(client_id);
        info!("New client {client_id} from {addr}");
        Some(client_id)
    }
}
