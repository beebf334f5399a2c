//! Client connection: handshake driver and replica world.
//!
//! The client opens TCP for the handshake and reliable state stream, binds
//! an ephemeral UDP socket for gameplay traffic, and drives both from one
//! select loop. Everything received is applied to a local replica of the
//! server's world through the shared command pipeline with the network
//! flag set, so nothing the server sent is ever echoed back.

use log::{debug, info, warn};
use shared::command;
use shared::nav::Direction;
use shared::protocol::{check_frame_len, CodecError, Message};
use shared::world::{WorldModel, TYPE_PLAYER};
use shared::PROTOCOL_VERSION;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::interval;

/// How many times the authentication message is sent before the handshake
/// is declared dead. Each attempt waits [`AUTH_RETRY_INTERVAL`].
pub const MAX_AUTH_ATTEMPTS: u32 = 5;
const AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Client-side connection lifecycle. `Failed` is terminal; callers build a
/// fresh [`Client`] to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    EstablishingUdp,
    Connected,
    Failed,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("handshake abandoned after {0} authentication attempts")]
    HandshakeTimeout(u32),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One connection to a server, plus the replica world it keeps in sync.
pub struct Client {
    state: ClientState,
    tcp_rx: mpsc::UnboundedReceiver<Result<Vec<u8>, ClientError>>,
    tcp_tx: mpsc::UnboundedSender<Vec<u8>>,
    udp: Arc<UdpSocket>,
    world: WorldModel,
    player_id: Option<u32>,
    auth_message: Message,
    auth_attempts: u32,
    gameplay_traffic_seen: bool,
}

impl Client {
    /// Opens the TCP connection, binds the gameplay socket and sends the
    /// first authentication attempt. The handshake then progresses inside
    /// [`Client::run_until_connected`] or [`Client::process_for`].
    pub async fn connect(tcp_addr: &str, udp_addr: &str) -> Result<Client, ClientError> {
        let stream = TcpStream::connect(tcp_addr).await?;
        let (read_half, write_half) = stream.into_split();
        let (tcp_tx, writer_rx) = mpsc::unbounded_channel();
        spawn_writer(write_half, writer_rx);
        let (frame_tx, tcp_rx) = mpsc::unbounded_channel();
        spawn_reader(read_half, frame_tx);

        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        udp.connect(udp_addr).await?;
        let udp_port = udp.local_addr()?.port();

        let auth_message = Message::Authentication {
            protocol_version: PROTOCOL_VERSION,
            client_id: std::process::id(),
            udp_port,
            token: Vec::new(),
        };

        let mut client = Client {
            state: ClientState::Connecting,
            tcp_rx,
            tcp_tx,
            udp,
            world: WorldModel::empty(),
            player_id: None,
            auth_message,
            auth_attempts: 0,
            gameplay_traffic_seen: false,
        };
        client.send_auth()?;
        info!("connecting to {} (gameplay port {})", tcp_addr, udp_port);
        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The replica of the server's world.
    pub fn world(&self) -> &WorldModel {
        &self.world
    }

    /// The id of this client's own player object, known once connected.
    pub fn player_id(&self) -> Option<u32> {
        self.player_id
    }

    /// Drives the connection until the handshake completes.
    pub async fn run_until_connected(&mut self) -> Result<(), ClientError> {
        self.run_inner(true).await
    }

    /// Drives the connection until the server goes away.
    pub async fn run(&mut self) -> Result<(), ClientError> {
        self.run_inner(false).await
    }

    /// Drives the connection for at most `duration`, then returns. Transport
    /// and handshake errors still surface immediately.
    pub async fn process_for(&mut self, duration: Duration) -> Result<(), ClientError> {
        match tokio::time::timeout(duration, self.run_inner(false)).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(()),
        }
    }

    /// Sends one movement input for our player over the gameplay channel.
    /// The position change comes back as an authoritative delta.
    pub async fn send_input(&self, direction: Direction) -> Result<(), ClientError> {
        let Some(player_id) = self.player_id else {
            return Err(ClientError::NotConnected);
        };
        let message = Message::PlayerInput {
            direction: direction as u8,
            player_id,
        };
        self.udp.send(&message.encode()).await?;
        Ok(())
    }

    async fn run_inner(&mut self, until_connected: bool) -> Result<(), ClientError> {
        let mut retry = interval(AUTH_RETRY_INTERVAL);
        // The first tick fires immediately; connect() already sent attempt 1.
        retry.tick().await;
        let mut udp_buf = [0u8; 2048];

        loop {
            if until_connected && self.state == ClientState::Connected {
                return Ok(());
            }
            tokio::select! {
                frame = self.tcp_rx.recv() => {
                    let payload = frame.ok_or(ClientError::ConnectionClosed)??;
                    self.handle_tcp_payload(&payload).await?;
                }
                received = self.udp.recv(&mut udp_buf) => {
                    let len = received?;
                    self.handle_udp_payload(&udp_buf[..len]);
                }
                _ = retry.tick() => {
                    self.retry_auth()?;
                }
            }
        }
    }

    async fn handle_tcp_payload(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping bad tcp message: {}", e);
                return Ok(());
            }
        };

        if let Message::UdpVerification {
            session_id,
            verification_code,
            timestamp,
        } = message
        {
            debug!("echoing verification code for session {}", session_id);
            self.state = ClientState::EstablishingUdp;
            let echo = Message::UdpVerification {
                session_id,
                verification_code,
                timestamp,
            };
            self.udp.send(&echo.encode()).await?;
            return Ok(());
        }

        // The reliable stream carries the snapshot and then our own spawn;
        // the last player object added over it is ours.
        if let Message::AddGameObject {
            type_id: TYPE_PLAYER,
            obj_id,
        } = message
        {
            self.player_id = Some(obj_id);
        }

        command::handle_incoming(payload, &mut self.world, true);
        self.update_connected_state();
        Ok(())
    }

    fn handle_udp_payload(&mut self, payload: &[u8]) {
        self.gameplay_traffic_seen = true;
        command::handle_incoming(payload, &mut self.world, true);
        self.update_connected_state();
    }

    /// The server only broadcasts over UDP to clients it has finished
    /// synchronizing, so gameplay traffic plus a known player id means the
    /// handshake is done on both ends.
    fn update_connected_state(&mut self) {
        if self.state == ClientState::EstablishingUdp
            && self.gameplay_traffic_seen
            && self.player_id.is_some()
        {
            self.state = ClientState::Connected;
            info!("connected, playing as object {}", self.player_id.unwrap_or(0));
        }
    }

    fn retry_auth(&mut self) -> Result<(), ClientError> {
        if self.state == ClientState::Connected {
            return Ok(());
        }
        if self.auth_attempts >= MAX_AUTH_ATTEMPTS {
            self.state = ClientState::Failed;
            return Err(ClientError::HandshakeTimeout(self.auth_attempts));
        }
        debug!(
            "handshake not complete, re-sending authentication (attempt {})",
            self.auth_attempts + 1
        );
        self.send_auth()
    }

    fn send_auth(&mut self) -> Result<(), ClientError> {
        self.auth_attempts += 1;
        if self.state == ClientState::Connecting {
            self.state = ClientState::Authenticating;
        }
        if self.tcp_tx.send(self.auth_message.frame()).is_err() {
            self.state = ClientState::Disconnected;
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Reads length-prefixed frames off the reliable stream and hands complete
/// payloads to the select loop. `read_exact` is not cancellation safe, so
/// frame reassembly lives on its own task; a select arm that gets cancelled
/// mid-frame would drop the prefix bytes and desync the stream.
fn spawn_reader(
    mut reader: OwnedReadHalf,
    frames: mpsc::UnboundedSender<Result<Vec<u8>, ClientError>>,
) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(payload) => {
                    if frames.send(Ok(payload)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = frames.send(Err(e));
                    break;
                }
            }
        }
    });
}

/// Reads one length-prefixed frame off the reliable stream.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, ClientError> {
    let mut len_buf = [0u8; 4];
    read_all(reader, &mut len_buf).await?;
    let len = check_frame_len(u32::from_le_bytes(len_buf))?;
    let mut payload = vec![0u8; len];
    read_all(reader, &mut payload).await?;
    Ok(payload)
}

async fn read_all(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<(), ClientError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ClientError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Drains the outbound FIFO so all TCP writes stay serialized.
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listening_pair() -> (TcpListener, UdpSocket, String, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = listener.local_addr().unwrap().to_string();
        let udp_addr = udp.local_addr().unwrap().to_string();
        (listener, udp, tcp_addr, udp_addr)
    }

    #[tokio::test]
    async fn connect_sends_authentication_first() {
        let (listener, _udp, tcp_addr, udp_addr) = listening_pair().await;
        let client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        assert_eq!(client.state(), ClientState::Authenticating);

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut len_buf = [0u8; 4];
        server_side.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        server_side.read_exact(&mut payload).await.unwrap();

        match Message::decode(&payload).unwrap() {
            Message::Authentication {
                protocol_version,
                udp_port,
                token,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_ne!(udp_port, 0);
                assert!(token.is_empty());
            }
            other => panic!("expected authentication, got tag {}", other.tag()),
        }
    }

    #[tokio::test]
    async fn verification_is_echoed_over_udp() {
        let (listener, server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let verification = Message::UdpVerification {
            session_id: 5,
            verification_code: 0xC0DE,
            timestamp: 42,
        };
        server_side.write_all(&verification.frame()).await.unwrap();

        client
            .process_for(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::EstablishingUdp);

        let mut buf = [0u8; 2048];
        let (len, _) = server_udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap(), verification);
    }

    #[tokio::test]
    async fn last_player_add_on_tcp_names_our_player() {
        let (listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        client.state = ClientState::EstablishingUdp;
        client.gameplay_traffic_seen = true;

        // Snapshot: another client's player, then our own spawn.
        for message in [
            Message::AddGameObject {
                type_id: TYPE_PLAYER,
                obj_id: 2,
            },
            Message::AddGameObject {
                type_id: TYPE_PLAYER,
                obj_id: 9,
            },
        ] {
            server_side.write_all(&message.frame()).await.unwrap();
        }

        client
            .process_for(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(client.player_id(), Some(9));
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.world().len(), 2);
    }

    #[tokio::test]
    async fn not_connected_until_gameplay_traffic_arrives() {
        let (listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        client.state = ClientState::EstablishingUdp;

        let spawn = Message::AddGameObject {
            type_id: TYPE_PLAYER,
            obj_id: 4,
        };
        server_side.write_all(&spawn.frame()).await.unwrap();

        client
            .process_for(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(client.player_id(), Some(4));
        // Nothing has arrived on the gameplay channel yet.
        assert_eq!(client.state(), ClientState::EstablishingUdp);
    }

    #[tokio::test]
    async fn split_tcp_frames_survive_processing_pauses() {
        let (listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        // Deliver a valid frame split mid-prefix across two processing
        // windows; reassembly must not lose the first bytes.
        let frame = Message::AddGameObject {
            type_id: TYPE_PLAYER,
            obj_id: 3,
        }
        .frame();
        server_side.write_all(&frame[..3]).await.unwrap();
        client
            .process_for(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(client.world().len(), 0);

        server_side.write_all(&frame[3..]).await.unwrap();
        client
            .process_for(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(client.player_id(), Some(3));
        assert_eq!(client.world().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_gives_up_after_bounded_retries() {
        let (listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        // Accept but never answer; the stream stays open while every
        // authentication attempt goes unanswered.
        let (_server_side, _) = listener.accept().await.unwrap();

        let result = client.run_until_connected().await;
        assert!(matches!(
            result,
            Err(ClientError::HandshakeTimeout(MAX_AUTH_ATTEMPTS))
        ));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test]
    async fn server_close_surfaces_as_connection_closed() {
        let (listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let mut client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);

        let result = client.process_for(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn input_before_connected_is_rejected() {
        let (_listener, _server_udp, tcp_addr, udp_addr) = listening_pair().await;
        let client = Client::connect(&tcp_addr, &udp_addr).await.unwrap();
        let result = client.send_input(Direction::Up).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }
}
