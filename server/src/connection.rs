//! Server-side connection state: the per-client handshake record, the live
//! client table, and the pending UDP-verification table.
//!
//! Every `ClientInfo` is owned exclusively by the server's event loop; the
//! only thing that escapes is the mpsc sender feeding the connection's
//! writer task, which serializes all TCP writes for that client.

use log::info;
use shared::protocol::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long a pending UDP verification may sit unanswered before the
/// handshake is abandoned and the entry purged.
pub const PENDING_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake lifecycle of a server-side connection. Transitions only move
/// forward; `Disconnected` is reachable from every state on transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Authenticating,
    Establishing,
    Synchronizing,
    Connected,
    Disconnected,
}

/// Per-connection record, created on TCP accept.
#[derive(Debug)]
pub struct ClientInfo {
    pub id: u32,
    pub state: ClientState,
    pub tcp_addr: SocketAddr,
    /// Authoritative gameplay endpoint, captured from the source address of
    /// the client's verification datagram.
    pub udp_addr: Option<SocketAddr>,
    pub session_id: u32,
    pub verification_code: u64,
    /// The player object spawned for this client once it is live.
    pub player_id: u32,
    pub last_seen: Instant,
    writer: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientInfo {
    pub fn new(id: u32, tcp_addr: SocketAddr, writer: mpsc::UnboundedSender<Vec<u8>>) -> ClientInfo {
        ClientInfo {
            id,
            state: ClientState::Connecting,
            tcp_addr,
            udp_addr: None,
            session_id: 0,
            verification_code: 0,
            player_id: 0,
            last_seen: Instant::now(),
            writer,
        }
    }

    /// Queues a framed message on the connection's writer task. A full or
    /// closed queue means the connection is going away; the caller handles
    /// that through the reader task's close event.
    pub fn send(&self, message: &Message) -> bool {
        self.writer.send(message.frame()).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

#[derive(Debug)]
struct PendingVerification {
    client_id: u32,
    issued: Instant,
}

/// Owns every `ClientInfo` plus the verification-code lookup used to bind
/// an inbound datagram to the TCP connection that requested it.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    clients: HashMap<u32, ClientInfo>,
    pending: HashMap<u64, PendingVerification>,
    next_client_id: u32,
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            clients: HashMap::new(),
            pending: HashMap::new(),
            next_client_id: 1,
        }
    }

    pub fn add_client(
        &mut self,
        tcp_addr: SocketAddr,
        writer: mpsc::UnboundedSender<Vec<u8>>,
    ) -> u32 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        info!("client {} connected from {}", id, tcp_addr);
        self.clients.insert(id, ClientInfo::new(id, tcp_addr, writer));
        id
    }

    pub fn get(&self, id: u32) -> Option<&ClientInfo> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ClientInfo> {
        self.clients.get_mut(&id)
    }

    /// Removes a client and any pending verification it still holds.
    /// Returns the record so the caller can clean up world state.
    pub fn remove(&mut self, id: u32) -> Option<ClientInfo> {
        let mut client = self.clients.remove(&id)?;
        client.state = ClientState::Disconnected;
        self.pending.retain(|_, entry| entry.client_id != id);
        info!("client {} disconnected", id);
        Some(client)
    }

    /// Registers a verification code handed to a client over TCP.
    pub fn register_pending(&mut self, code: u64, client_id: u32) {
        self.pending.insert(
            code,
            PendingVerification {
                client_id,
                issued: Instant::now(),
            },
        );
    }

    /// Resolves an inbound verification code to its waiting connection,
    /// consuming the entry.
    pub fn resolve_pending(&mut self, code: u64) -> Option<u32> {
        self.pending.remove(&code).map(|entry| entry.client_id)
    }

    /// Purges verification entries older than the timeout and returns the
    /// ids of the connections whose handshake is now abandoned.
    pub fn purge_stale_pending(&mut self, timeout: Duration) -> Vec<u32> {
        let stale: Vec<u32> = self
            .pending
            .values()
            .filter(|entry| entry.issued.elapsed() > timeout)
            .map(|entry| entry.client_id)
            .collect();
        self.pending.retain(|_, entry| entry.issued.elapsed() <= timeout);
        stale
    }

    pub fn find_by_udp(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.udp_addr == Some(addr))
            .map(|(id, _)| *id)
    }

    /// Gameplay endpoints of every fully connected client.
    pub fn connected_udp_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .filter(|(_, client)| client.state == ClientState::Connected)
            .filter_map(|(id, client)| client.udp_addr.map(|addr| (*id, addr)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn add_test_client(table: &mut ConnectionTable, port: u16) -> u32 {
        let (tx, _rx) = mpsc::unbounded_channel();
        table.add_client(test_addr(port), tx)
    }

    #[test]
    fn clients_get_sequential_ids() {
        let mut table = ConnectionTable::new();
        assert_eq!(add_test_client(&mut table, 5000), 1);
        assert_eq!(add_test_client(&mut table, 5001), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn new_clients_start_connecting() {
        let mut table = ConnectionTable::new();
        let id = add_test_client(&mut table, 5000);
        assert_eq!(table.get(id).unwrap().state, ClientState::Connecting);
        assert!(table.get(id).unwrap().udp_addr.is_none());
    }

    #[test]
    fn remove_drops_pending_entries() {
        let mut table = ConnectionTable::new();
        let id = add_test_client(&mut table, 5000);
        table.register_pending(0xDEAD, id);
        assert_eq!(table.pending_len(), 1);

        assert!(table.remove(id).is_some());
        assert_eq!(table.pending_len(), 0);
        assert!(table.get(id).is_none());
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn pending_resolution_is_one_shot() {
        let mut table = ConnectionTable::new();
        let id = add_test_client(&mut table, 5000);
        table.register_pending(77, id);

        assert_eq!(table.resolve_pending(77), Some(id));
        assert_eq!(table.resolve_pending(77), None);
    }

    #[test]
    fn stale_pending_entries_are_purged() {
        let mut table = ConnectionTable::new();
        let fresh = add_test_client(&mut table, 5000);
        let stale = add_test_client(&mut table, 5001);
        table.register_pending(1, fresh);
        table.register_pending(2, stale);
        table.pending.get_mut(&2).unwrap().issued = Instant::now() - Duration::from_secs(60);

        let purged = table.purge_stale_pending(PENDING_VERIFICATION_TIMEOUT);
        assert_eq!(purged, vec![stale]);
        assert_eq!(table.pending_len(), 1);
        assert_eq!(table.resolve_pending(1), Some(fresh));
    }

    #[test]
    fn only_connected_clients_receive_broadcasts() {
        let mut table = ConnectionTable::new();
        let a = add_test_client(&mut table, 5000);
        let b = add_test_client(&mut table, 5001);

        let udp_a = test_addr(6000);
        table.get_mut(a).unwrap().udp_addr = Some(udp_a);
        table.get_mut(a).unwrap().state = ClientState::Connected;
        table.get_mut(b).unwrap().state = ClientState::Establishing;

        let addrs = table.connected_udp_addrs();
        assert_eq!(addrs, vec![(a, udp_a)]);
    }

    #[test]
    fn find_by_udp_matches_verified_endpoint() {
        let mut table = ConnectionTable::new();
        let id = add_test_client(&mut table, 5000);
        let udp = test_addr(6000);
        table.get_mut(id).unwrap().udp_addr = Some(udp);

        assert_eq!(table.find_by_udp(udp), Some(id));
        assert_eq!(table.find_by_udp(test_addr(6001)), None);
    }
}
