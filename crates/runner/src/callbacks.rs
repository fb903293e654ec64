//! Lifecycle callbacks.
//!
//! Every method has a no-op default, so an implementation only overrides the
//! events it cares about. Engine hooks this core never produces (interest
//! management, reliable-data progress, host migration) are not part of the
//! trait.

use pilot_sim::{EntityId, PeerId, Tick};

use crate::error::RpcError;
use crate::field::FieldKey;
use crate::transport::DisconnectReason;

pub trait RunnerCallbacks {
    /// The session was established.
    fn on_connected(&mut self, _local: PeerId, _host: PeerId) {}

    fn on_peer_joined(&mut self, _peer: PeerId) {}

    fn on_peer_left(&mut self, _peer: PeerId) {}

    /// A replicated entity became known to this peer.
    fn on_entity_spawned(&mut self, _entity: EntityId, _input_authority: Option<PeerId>) {}

    fn on_entity_despawned(&mut self, _entity: EntityId) {}

    /// State authority only: no input arrived from `peer` for `tick`.
    fn on_input_missing(&mut self, _peer: PeerId, _tick: Tick) {}

    /// A field differs from the value last observed by this peer. The
    /// observer re-reads the current value.
    fn on_field_changed(&mut self, _entity: EntityId, _field: FieldKey) {}

    /// State authority only: a remote mutation request was refused.
    fn on_rpc_rejected(&mut self, _sender: PeerId, _error: &RpcError) {}

    /// The session went away without a local shutdown.
    fn on_disconnected(&mut self, _reason: DisconnectReason) {}

    fn on_shutdown(&mut self) {}
}

/// Callbacks that ignore every event.
#[derive(Debug, Default)]
pub struct NoCallbacks;

impl RunnerCallbacks for NoCallbacks {}
