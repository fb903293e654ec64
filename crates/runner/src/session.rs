//! Transport session.
//!
//! Owns the connection lifecycle of one peer: joining or hosting a named
//! session, the set of connected peers, and the peer-joined / peer-left event
//! stream.

use std::collections::BTreeSet;
use std::time::Duration;

use pilot_sim::PeerId;
use tracing::{debug, info, warn};

use crate::config::GameMode;
use crate::error::{ConnectError, TransportError};
use crate::transport::{LoopbackNetwork, Transport, TransportEvent};

/// One peer's membership in a session.
pub struct Session {
    name: String,
    mode: GameMode,
    transport: Box<dyn Transport>,
    /// Connected players, the local one included once announced.
    peers: BTreeSet<PeerId>,
    open: bool,
}

impl Session {
    /// Host or join `name` on `network`.
    ///
    /// Suspends until the session is established or the attempt fails. A
    /// failure is returned as-is and never retried here.
    pub async fn start(
        network: &LoopbackNetwork,
        mode: GameMode,
        name: &str,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let connect = network.connect(mode, name, capacity);
        let transport = match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(session = name, millis, "session start timed out");
                return Err(ConnectError::Timeout(millis));
            }
        };

        Ok(Self::from_transport(mode, name, Box::new(transport)))
    }

    /// Wrap an already connected transport.
    pub fn from_transport(mode: GameMode, name: &str, transport: Box<dyn Transport>) -> Self {
        let session = Self {
            name: name.to_string(),
            mode,
            transport,
            peers: BTreeSet::new(),
            open: true,
        };
        info!(
            session = name,
            local = session.local_peer(),
            host = session.host_peer(),
            server = session.is_server(),
            "session established"
        );
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn host_peer(&self) -> PeerId {
        self.transport.host_peer()
    }

    /// True on the peer that hosts the session (and holds state authority).
    pub fn is_server(&self) -> bool {
        self.local_peer() == self.host_peer()
    }

    /// True on a host that does not play itself.
    pub fn is_dedicated(&self) -> bool {
        self.is_server() && self.mode == GameMode::Server
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    pub fn send(&self, to: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.transport.send(to, payload)
    }

    pub fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.transport.broadcast(payload)
    }

    /// Drain transport events, keeping the peer set current.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        let events = self.transport.poll();
        for event in &events {
            match event {
                TransportEvent::PeerJoined(peer) => {
                    self.peers.insert(*peer);
                    debug!(session = %self.name, peer, "peer joined");
                }
                TransportEvent::PeerLeft(peer) => {
                    self.peers.remove(peer);
                    debug!(session = %self.name, peer, "peer left");
                }
                TransportEvent::Disconnected(reason) => {
                    self.open = false;
                    self.peers.clear();
                    info!(session = %self.name, ?reason, "disconnected from session");
                }
                TransportEvent::Message { .. } => {}
            }
        }
        events
    }

    /// Leave the session. The only cancellation point; idempotent.
    pub fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.peers.clear();
        self.transport.disconnect();
        info!(session = %self.name, "session shut down");
    }
}
