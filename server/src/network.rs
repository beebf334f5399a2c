//! Server network layer: TCP handshake handling, UDP endpoint verification
//! and gameplay traffic, and the single event loop that owns the
//! authoritative world.
//!
//! One task accepts TCP connections, one task receives datagrams, and every
//! connection gets a reader and a writer task. All of them only ever talk
//! to the event loop through channels; the world model and the connection
//! table are mutated exclusively on the loop task, so no locks guard them.

use crate::connection::{ClientState, ConnectionTable, PENDING_VERIFICATION_TIMEOUT};
use log::{debug, error, info, warn};
use shared::command;
use shared::protocol::{check_frame_len, Message};
use shared::world::{WorldModel, TYPE_PLAYER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::interval;

const PLAYER_MESH_ID: u32 = 1;
const PLAYER_TEXTURE_ID: u32 = 1;

/// Events delivered from transport tasks to the event loop.
#[derive(Debug)]
pub enum ServerEvent {
    TcpAccepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    TcpMessage {
        conn_id: u32,
        payload: Vec<u8>,
    },
    TcpClosed {
        conn_id: u32,
    },
    UdpDatagram {
        payload: Vec<u8>,
        addr: SocketAddr,
    },
}

/// The authoritative server: owns both sockets, the connection table and
/// the world model.
pub struct Server {
    listener: Option<TcpListener>,
    udp: Arc<UdpSocket>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    table: ConnectionTable,
    world: WorldModel,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    /// Binds both channels and builds the region world. Pass port 0 in
    /// either address to let the OS choose (used by tests).
    pub async fn bind(
        tcp_addr: &str,
        udp_addr: &str,
        figure_size: i32,
    ) -> Result<Server, Box<dyn std::error::Error>> {
        if !(1..=shared::MAX_FIGURE_SIZE).contains(&figure_size) {
            return Err(format!(
                "figure size must be between 1 and {}, got {}",
                shared::MAX_FIGURE_SIZE,
                figure_size
            )
            .into());
        }
        let listener = TcpListener::bind(tcp_addr).await?;
        let udp = Arc::new(UdpSocket::bind(udp_addr).await?);
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;
        info!("server listening on tcp {} / udp {}", tcp_addr, udp_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            udp,
            tcp_addr,
            udp_addr,
            table: ConnectionTable::new(),
            world: WorldModel::cube_world(figure_size),
            event_tx,
            event_rx,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn world(&self) -> &WorldModel {
        &self.world
    }

    /// Runs the event loop until every transport task has gone away.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_acceptor()?;
        self.spawn_udp_receiver();

        let mut purge_interval = interval(Duration::from_secs(1));
        info!("server started");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("server shutting down");
                            break;
                        }
                    }
                },
                _ = purge_interval.tick() => {
                    self.purge_stale_handshakes().await;
                },
            }
        }

        Ok(())
    }

    fn spawn_acceptor(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.listener.take().ok_or("server already running")?;
        let events = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if events.send(ServerEvent::TcpAccepted { stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("tcp accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
        Ok(())
    }

    fn spawn_udp_receiver(&self) {
        let socket = Arc::clone(&self.udp);
        let events = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let event = ServerEvent::UdpDatagram {
                            payload: buffer[..len].to_vec(),
                            addr,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("udp receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::TcpAccepted { stream, addr } => self.handle_accept(stream, addr),
            ServerEvent::TcpMessage { conn_id, payload } => {
                self.handle_tcp_message(conn_id, &payload).await
            }
            ServerEvent::TcpClosed { conn_id } => self.disconnect(conn_id).await,
            ServerEvent::UdpDatagram { payload, addr } => self.handle_datagram(&payload, addr).await,
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let conn_id = self.table.add_client(addr, writer_tx);
        spawn_writer(write_half, writer_rx);
        spawn_reader(conn_id, read_half, self.event_tx.clone());
    }

    async fn handle_tcp_message(&mut self, conn_id: u32, payload: &[u8]) {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("client {}: dropping bad tcp message: {}", conn_id, e);
                return;
            }
        };
        let Some(state) = self.table.get(conn_id).map(|c| c.state) else {
            return;
        };

        match (state, message) {
            (
                ClientState::Connecting,
                Message::Authentication {
                    protocol_version,
                    client_id,
                    udp_port,
                    token,
                },
            ) => {
                if let Some(client) = self.table.get_mut(conn_id) {
                    client.state = ClientState::Authenticating;
                }
                if !validate_auth(protocol_version, client_id, &token) {
                    warn!("client {}: authentication rejected", conn_id);
                    self.disconnect(conn_id).await;
                    return;
                }

                let session_id: u32 = rand::random();
                let verification_code: u64 = rand::random();
                self.table.register_pending(verification_code, conn_id);

                let reply = Message::UdpVerification {
                    session_id,
                    verification_code,
                    timestamp: now_millis(),
                };
                let Some(client) = self.table.get_mut(conn_id) else {
                    return;
                };
                client.session_id = session_id;
                client.verification_code = verification_code;
                client.state = ClientState::Establishing;
                info!(
                    "client {}: authenticated (client_id {}, advertised udp port {}), awaiting udp verification",
                    conn_id, client_id, udp_port
                );
                if !client.send(&reply) {
                    self.disconnect(conn_id).await;
                }
            }

            (ClientState::Establishing, Message::Authentication { .. }) => {
                // Client-driven retry: our reply or its echo was lost.
                let Some(client) = self.table.get(conn_id) else {
                    return;
                };
                debug!("client {}: re-sending udp verification", conn_id);
                let reply = Message::UdpVerification {
                    session_id: client.session_id,
                    verification_code: client.verification_code,
                    timestamp: now_millis(),
                };
                if !client.send(&reply) {
                    self.disconnect(conn_id).await;
                }
            }

            (ClientState::Connecting, other) => {
                warn!(
                    "client {}: first message tag {} is not authentication, closing",
                    conn_id,
                    other.tag()
                );
                self.disconnect(conn_id).await;
            }

            (state, other) => {
                warn!(
                    "client {}: unexpected tcp message tag {} in state {:?}",
                    conn_id,
                    other.tag(),
                    state
                );
            }
        }
    }

    async fn handle_datagram(&mut self, payload: &[u8], addr: SocketAddr) {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping bad datagram from {}: {}", addr, e);
                return;
            }
        };

        if let Message::UdpVerification {
            verification_code, ..
        } = message
        {
            match self.table.resolve_pending(verification_code) {
                Some(conn_id) => self.complete_handshake(conn_id, addr).await,
                None => warn!("unknown or expired verification code from {}", addr),
            }
            return;
        }

        let Some(conn_id) = self.table.find_by_udp(addr) else {
            warn!("dropping datagram from unverified endpoint {}", addr);
            return;
        };
        let Some(client) = self.table.get_mut(conn_id) else {
            return;
        };
        if client.state != ClientState::Connected {
            warn!("client {}: gameplay datagram before sync finished", conn_id);
            return;
        }
        client.touch();
        if !owns_moved_object(&message, client.player_id) {
            warn!(
                "client {}: dropping input for an object it does not own",
                conn_id
            );
            return;
        }

        let outputs = command::handle_incoming(payload, &mut self.world, true);
        for message in &outputs {
            self.broadcast(message).await;
        }
    }

    /// Binds the verified UDP endpoint to the waiting connection, streams
    /// the state snapshot, spawns the client's player and goes live.
    async fn complete_handshake(&mut self, conn_id: u32, addr: SocketAddr) {
        {
            let Some(client) = self.table.get_mut(conn_id) else {
                return;
            };
            client.udp_addr = Some(addr);
            client.state = ClientState::Synchronizing;
            client.touch();
            info!("client {}: udp endpoint {} verified, synchronizing", conn_id, addr);
        }

        let snapshot = self.world.snapshot();
        let sync_ok = match self.table.get(conn_id) {
            Some(client) => snapshot.iter().all(|message| client.send(message)),
            None => false,
        };
        if !sync_ok {
            warn!("client {}: snapshot delivery failed", conn_id);
            self.disconnect(conn_id).await;
            return;
        }

        let Some((player_id, spawn)) = self.world.spawn_player(PLAYER_MESH_ID, PLAYER_TEXTURE_ID)
        else {
            warn!("client {}: region grid is full, cannot spawn player", conn_id);
            self.disconnect(conn_id).await;
            return;
        };
        let root_id = self.world.root_id();
        let spawn_messages = [
            Message::AddGameObject {
                type_id: TYPE_PLAYER,
                obj_id: player_id,
            },
            Message::GameObjectPosition {
                y: spawn.y,
                x: spawn.x,
                obj_id: player_id,
            },
            Message::GameObjectParentObject {
                parent_id: root_id,
                obj_id: player_id,
            },
        ];

        {
            let Some(client) = self.table.get_mut(conn_id) else {
                return;
            };
            client.player_id = player_id;
            client.state = ClientState::Connected;
            // The owner learns its player id from these: the last adds on
            // the reliable channel name its own object.
            for message in &spawn_messages {
                client.send(message);
            }
        }

        for message in &spawn_messages {
            self.broadcast(message).await;
        }
        info!("client {}: connected as player {}", conn_id, player_id);
    }

    /// Sends one gameplay message to every connected client's verified
    /// UDP endpoint. Fire-and-forget; losses are tolerated by design.
    async fn broadcast(&self, message: &Message) {
        let payload = message.encode();
        for (conn_id, addr) in self.table.connected_udp_addrs() {
            if let Err(e) = self.udp.send_to(&payload, addr).await {
                error!("udp send to client {} at {} failed: {}", conn_id, addr, e);
            }
        }
    }

    async fn disconnect(&mut self, conn_id: u32) {
        let Some(client) = self.table.remove(conn_id) else {
            return;
        };
        if client.player_id != 0 && self.world.remove(client.player_id) {
            self.broadcast(&Message::RemoveGameObject {
                obj_id: client.player_id,
            })
            .await;
        }
    }

    async fn purge_stale_handshakes(&mut self) {
        for conn_id in self.table.purge_stale_pending(PENDING_VERIFICATION_TIMEOUT) {
            warn!("client {}: udp verification timed out", conn_id);
            self.disconnect(conn_id).await;
        }
    }
}

/// Input-style messages may only move the sender's own player. Verbatim
/// state mutations carry no mover and pass through.
fn owns_moved_object(message: &Message, player_id: u32) -> bool {
    match *message {
        Message::PlayerInput { player_id: id, .. } => id == player_id,
        Message::WalkOnRidableObject { walker_id, .. } => walker_id == player_id,
        Message::RideOnRidableObject { rider_id, .. } => rider_id == player_id,
        _ => true,
    }
}

/// Authentication hook. Accept-all for now; this is the place to check a
/// real token once one exists.
fn validate_auth(protocol_version: u32, client_id: u32, token: &[u8]) -> bool {
    debug!(
        "auth payload: version {}, client_id {}, token {} bytes",
        protocol_version,
        client_id,
        token.len()
    );
    true
}

/// Reads length-prefixed frames off one connection and forwards the
/// payloads to the event loop. Emits a close event on any error so the
/// loop can tear the connection down.
fn spawn_reader(conn_id: u32, mut read_half: OwnedReadHalf, events: mpsc::UnboundedSender<ServerEvent>) {
    tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = match check_frame_len(u32::from_le_bytes(len_buf)) {
                Ok(len) => len,
                Err(e) => {
                    warn!("client {}: {}", conn_id, e);
                    break;
                }
            };
            let mut payload = vec![0u8; len];
            if read_half.read_exact(&mut payload).await.is_err() {
                break;
            }
            if events.send(ServerEvent::TcpMessage { conn_id, payload }).is_err() {
                return;
            }
        }
        let _ = events.send(ServerEvent::TcpClosed { conn_id });
    });
}

/// Drains one connection's outbound FIFO, writing one frame at a time so
/// all writes on the connection are serialized.
fn spawn_writer(mut write_half: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!("tcp write failed: {}", e);
                break;
            }
        }
    });
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
