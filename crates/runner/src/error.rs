//! Error types for the runner.

use pilot_sim::{EntityId, PeerId};
use thiserror::Error;

/// Why a session could not be established.
///
/// None of these are retried by the runner; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("a session named {0:?} is already hosted")]
    NameCollision(String),

    #[error("no session named {0:?} to join")]
    SessionNotFound(String),

    #[error("network unreachable")]
    Unreachable,

    #[error("session {name:?} is full ({capacity} peers)")]
    RoomFull { name: String, capacity: usize },

    #[error("timed out after {0} ms establishing the session")]
    Timeout(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("entity {0} is not known to this peer")]
    UnknownEntity(EntityId),

    #[error("capability was minted for entity {token} but used on entity {target}")]
    TokenMismatch { token: EntityId, target: EntityId },

    #[error("local peer no longer holds the {role} role on entity {entity}")]
    RoleNotHeld { role: &'static str, entity: EntityId },
}

/// Why a remote mutation request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("entity {0} is not known to this peer")]
    UnknownEntity(EntityId),

    #[error("peer {sender} does not hold input authority over entity {entity}")]
    NotInputAuthority { sender: PeerId, entity: EntityId },

    #[error("field {0:?} is not remotely settable")]
    FieldNotSettable(String),

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// Fatal configuration fault of the scene: a required object is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("no spawn point tagged {0:?} in the scene")]
    MissingSpawnPoint(String),

    #[error("peer {0} does not hold state authority and cannot spawn")]
    NotStateAuthority(PeerId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Umbrella error for the [`Runner`](crate::Runner) API.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}
