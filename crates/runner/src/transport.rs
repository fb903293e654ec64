//! Loopback transport for in-process sessions.
//!
//! [`LoopbackNetwork`] is a cloneable hub of named rooms. Each connected peer
//! owns a [`LoopbackTransport`] with its own inbox; peer lifecycle events and
//! messages are delivered in send order. The network never touches a socket,
//! which makes it suitable for local play and for driving several peers from a
//! single test.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pilot_sim::PeerId;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::config::GameMode;
use crate::error::{ConnectError, TransportError};

/// First id handed out in a room. Ids are never reused within a room.
const FIRST_PEER_ID: PeerId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer holding the session shut down.
    HostShutdown,
    /// The connection of this peer was dropped by the network.
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Message { from: PeerId, payload: Vec<u8> },
    Disconnected(DisconnectReason),
}

/// One peer's connection to a session.
///
/// The sender of every delivered message is bound by the transport.
pub trait Transport {
    fn local_peer(&self) -> PeerId;

    /// Peer that created the session.
    fn host_peer(&self) -> PeerId;

    fn send(&self, to: PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Send to every other connected peer.
    fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Drain everything delivered since the last poll.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Leave the session. Idempotent.
    fn disconnect(&mut self);
}

#[derive(Debug)]
struct Room {
    host: PeerId,
    /// False for dedicated hosts, which are not announced as players.
    host_is_player: bool,
    capacity: usize,
    next_peer_id: PeerId,
    members: BTreeMap<PeerId, UnboundedSender<TransportEvent>>,
}

impl Room {
    fn notify(&self, peer: PeerId, event: TransportEvent) {
        if let Some(sender) = self.members.get(&peer) {
            // A closed inbox means the peer is already gone.
            let _ = sender.send(event);
        }
    }

    fn notify_others(&self, except: PeerId, event: &TransportEvent) {
        for (&peer, sender) in &self.members {
            if peer != except {
                let _ = sender.send(event.clone());
            }
        }
    }

    fn players(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members
            .keys()
            .copied()
            .filter(|&peer| peer != self.host || self.host_is_player)
    }
}

#[derive(Debug)]
struct NetworkState {
    rooms: HashMap<String, Room>,
    reachable: bool,
    connect_latency: Duration,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            rooms: HashMap::new(),
            reachable: true,
            connect_latency: Duration::ZERO,
        }
    }
}

impl NetworkState {
    /// Remove `peer` from `room`, tearing the room down if it was the host.
    ///
    /// `lost` marks a link failure, which the removed peer is told about.
    fn remove_member(&mut self, room_name: &str, peer: PeerId, lost: bool) {
        let Some(room) = self.rooms.get_mut(room_name) else {
            return;
        };

        if lost {
            room.notify(
                peer,
                TransportEvent::Disconnected(DisconnectReason::ConnectionLost),
            );
        }

        if peer == room.host {
            if let Some(room) = self.rooms.remove(room_name) {
                info!(room = room_name, host = peer, "session closed by host");
                room.notify_others(
                    peer,
                    &TransportEvent::Disconnected(DisconnectReason::HostShutdown),
                );
            }
        } else if room.members.remove(&peer).is_some() {
            debug!(room = room_name, peer, "peer left session");
            room.notify_others(peer, &TransportEvent::PeerLeft(peer));
        }
    }
}

/// In-process network of named sessions.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable, every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Delay applied to every connection attempt before it is resolved.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.lock().connect_latency = latency;
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.lock().rooms.contains_key(name)
    }

    /// Connected peers of a session, in id order.
    pub fn session_peers(&self, name: &str) -> Vec<PeerId> {
        self.lock()
            .rooms
            .get(name)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a peer's connection as if the link failed.
    pub fn drop_peer(&self, name: &str, peer: PeerId) {
        self.lock().remove_member(name, peer, true);
    }

    /// Host or join the session `name` according to `mode`.
    pub async fn connect(
        &self,
        mode: GameMode,
        name: &str,
        capacity: usize,
    ) -> Result<LoopbackTransport, ConnectError> {
        let latency = self.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if !state.reachable {
            return Err(ConnectError::Unreachable);
        }

        let exists = state.rooms.contains_key(name);
        let (sender, inbox) = mpsc::unbounded_channel();

        let (local, host) = match (mode, exists) {
            (GameMode::Host | GameMode::Server, true) => {
                return Err(ConnectError::NameCollision(name.to_string()));
            }
            (GameMode::Client, false) => {
                return Err(ConnectError::SessionNotFound(name.to_string()));
            }
            (GameMode::Host | GameMode::Server | GameMode::AutoHostOrClient, false) => {
                let host = FIRST_PEER_ID;
                let mut room = Room {
                    host,
                    host_is_player: mode != GameMode::Server,
                    capacity,
                    next_peer_id: host + 1,
                    members: BTreeMap::new(),
                };
                room.members.insert(host, sender);
                if room.host_is_player {
                    room.notify(host, TransportEvent::PeerJoined(host));
                }
                state.rooms.insert(name.to_string(), room);
                info!(room = name, peer = host, ?mode, "session hosted");
                (host, host)
            }
            (GameMode::Client | GameMode::AutoHostOrClient, true) => {
                let Some(room) = state.rooms.get_mut(name) else {
                    return Err(ConnectError::SessionNotFound(name.to_string()));
                };
                if room.members.len() >= room.capacity {
                    return Err(ConnectError::RoomFull {
                        name: name.to_string(),
                        capacity: room.capacity,
                    });
                }

                let local = room.next_peer_id;
                room.next_peer_id += 1;

                room.notify_others(local, &TransportEvent::PeerJoined(local));
                for peer in room.players() {
                    let _ = sender.send(TransportEvent::PeerJoined(peer));
                }
                let _ = sender.send(TransportEvent::PeerJoined(local));
                room.members.insert(local, sender);

                info!(room = name, peer = local, host = room.host, "session joined");
                (local, room.host)
            }
        };

        Ok(LoopbackTransport {
            network: self.clone(),
            room: name.to_string(),
            local,
            host,
            inbox,
            open: true,
        })
    }
}

/// One peer's end of a [`LoopbackNetwork`] session.
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    room: String,
    local: PeerId,
    host: PeerId,
    inbox: UnboundedReceiver<TransportEvent>,
    open: bool,
}

impl LoopbackTransport {
    pub fn session_name(&self) -> &str {
        &self.room
    }

    fn with_room<R>(&self, f: impl FnOnce(&Room) -> R) -> Result<R, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let state = self.network.lock();
        let room = state.rooms.get(&self.room).ok_or(TransportError::Closed)?;
        if !room.members.contains_key(&self.local) {
            return Err(TransportError::Closed);
        }
        Ok(f(room))
    }
}

impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn host_peer(&self) -> PeerId {
        self.host
    }

    fn send(&self, to: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        let from = self.local;
        self.with_room(|room| {
            let sender = room
                .members
                .get(&to)
                .ok_or(TransportError::UnknownPeer(to))?;
            let _ = sender.send(TransportEvent::Message { from, payload });
            Ok(())
        })?
    }

    fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let from = self.local;
        self.with_room(|room| {
            room.notify_others(from, &TransportEvent::Message { from, payload });
        })
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            if matches!(event, TransportEvent::Disconnected(_)) {
                self.open = false;
            }
            events.push(event);
        }
        events
    }

    fn disconnect(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.network
            .lock()
            .remove_member(&self.room, self.local, false);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn host(network: &LoopbackNetwork, name: &str) -> LoopbackTransport {
        network.connect(GameMode::Host, name, 8).await.unwrap()
    }

    async fn join(network: &LoopbackNetwork, name: &str) -> LoopbackTransport {
        network.connect(GameMode::Client, name, 8).await.unwrap()
    }

    #[tokio::test]
    async fn test_host_sees_itself_join() {
        let network = LoopbackNetwork::new();
        let mut host = host(&network, "TestRoom").await;

        assert_eq!(host.local_peer(), 1);
        assert_eq!(host.host_peer(), 1);
        assert_eq!(host.poll(), vec![TransportEvent::PeerJoined(1)]);
    }

    #[tokio::test]
    async fn test_dedicated_host_is_not_announced() {
        let network = LoopbackNetwork::new();
        let mut server = network.connect(GameMode::Server, "Dedicated", 8).await.unwrap();
        assert!(server.poll().is_empty());

        let mut client = join(&network, "Dedicated").await;
        assert_eq!(client.poll(), vec![TransportEvent::PeerJoined(2)]);
        assert_eq!(server.poll(), vec![TransportEvent::PeerJoined(2)]);
    }

    #[tokio::test]
    async fn test_joiner_learns_existing_peers_then_itself() {
        let network = LoopbackNetwork::new();
        let mut a = host(&network, "TestRoom").await;
        let mut b = join(&network, "TestRoom").await;
        let mut c = join(&network, "TestRoom").await;

        assert_eq!(
            c.poll(),
            vec![
                TransportEvent::PeerJoined(1),
                TransportEvent::PeerJoined(2),
                TransportEvent::PeerJoined(3),
            ]
        );
        assert_eq!(
            a.poll(),
            vec![
                TransportEvent::PeerJoined(1),
                TransportEvent::PeerJoined(2),
                TransportEvent::PeerJoined(3),
            ]
        );
        assert_eq!(
            b.poll(),
            vec![
                TransportEvent::PeerJoined(1),
                TransportEvent::PeerJoined(2),
                TransportEvent::PeerJoined(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_mode_hosts_then_joins() {
        let network = LoopbackNetwork::new();
        let first = network
            .connect(GameMode::AutoHostOrClient, "TestRoom", 8)
            .await
            .unwrap();
        let second = network
            .connect(GameMode::AutoHostOrClient, "TestRoom", 8)
            .await
            .unwrap();

        assert_eq!(first.local_peer(), first.host_peer());
        assert_eq!(second.host_peer(), first.local_peer());
        assert_ne!(second.local_peer(), second.host_peer());
    }

    #[tokio::test]
    async fn test_connect_failures_are_distinct() {
        let network = LoopbackNetwork::new();

        let missing = network.connect(GameMode::Client, "Nowhere", 8).await;
        assert_eq!(
            missing.unwrap_err(),
            ConnectError::SessionNotFound("Nowhere".to_string())
        );

        let _host = host(&network, "TestRoom").await;
        let collision = network.connect(GameMode::Host, "TestRoom", 8).await;
        assert_eq!(
            collision.unwrap_err(),
            ConnectError::NameCollision("TestRoom".to_string())
        );

        network.set_reachable(false);
        let unreachable = network.connect(GameMode::Client, "TestRoom", 8).await;
        assert_eq!(unreachable.unwrap_err(), ConnectError::Unreachable);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let network = LoopbackNetwork::new();
        let _host = network.connect(GameMode::Host, "Small", 2).await.unwrap();
        let _b = join(&network, "Small").await;

        let full = network.connect(GameMode::Client, "Small", 2).await;
        assert!(matches!(full, Err(ConnectError::RoomFull { capacity: 2, .. })));
    }

    #[tokio::test]
    async fn test_messages_carry_transport_bound_sender() {
        let network = LoopbackNetwork::new();
        let mut a = host(&network, "TestRoom").await;
        let mut b = join(&network, "TestRoom").await;
        a.poll();
        b.poll();

        b.send(1, b"hello".to_vec()).unwrap();
        assert_eq!(
            a.poll(),
            vec![TransportEvent::Message {
                from: 2,
                payload: b"hello".to_vec()
            }]
        );

        a.broadcast(b"all".to_vec()).unwrap();
        assert!(a.poll().is_empty(), "broadcast skips the sender");
        assert_eq!(b.poll().len(), 1);

        assert_eq!(b.send(9, vec![]), Err(TransportError::UnknownPeer(9)));
    }

    #[tokio::test]
    async fn test_peer_leave_notifies_others() {
        let network = LoopbackNetwork::new();
        let mut a = host(&network, "TestRoom").await;
        let mut b = join(&network, "TestRoom").await;
        a.poll();

        b.disconnect();
        assert_eq!(a.poll(), vec![TransportEvent::PeerLeft(2)]);
        assert_eq!(b.send(1, vec![]), Err(TransportError::Closed));
        assert_eq!(network.session_peers("TestRoom"), vec![1]);
    }

    #[tokio::test]
    async fn test_host_shutdown_tears_down_room() {
        let network = LoopbackNetwork::new();
        let mut a = host(&network, "TestRoom").await;
        let mut b = join(&network, "TestRoom").await;
        b.poll();

        a.disconnect();
        assert_eq!(
            b.poll(),
            vec![TransportEvent::Disconnected(DisconnectReason::HostShutdown)]
        );
        assert!(!network.has_session("TestRoom"));
    }

    #[tokio::test]
    async fn test_dropped_peer_is_told_why() {
        let network = LoopbackNetwork::new();
        let mut a = host(&network, "TestRoom").await;
        let mut b = join(&network, "TestRoom").await;
        a.poll();
        b.poll();

        network.drop_peer("TestRoom", 2);
        assert_eq!(
            b.poll(),
            vec![TransportEvent::Disconnected(DisconnectReason::ConnectionLost)]
        );
        assert_eq!(a.poll(), vec![TransportEvent::PeerLeft(2)]);
    }

    #[tokio::test]
    async fn test_peer_ids_not_reused() {
        let network = LoopbackNetwork::new();
        let _a = host(&network, "TestRoom").await;
        let b = join(&network, "TestRoom").await;
        drop(b);
        let c = join(&network, "TestRoom").await;
        assert_eq!(c.local_peer(), 3);
    }
}
