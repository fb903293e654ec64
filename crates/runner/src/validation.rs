//! Input validation on the state authority.
//!
//! Checked in order:
//! - NaN/Inf in move_axis: DROP
//! - Tick late (before current tick): DROP
//! - Tick beyond the future window: DROP
//! - Sender controls no entity: DROP
//! - Duplicate (peer, tick): DROP
//! - Axis outside [-1, 1]: CLAMP
//!
//! The target tick floor only steers client tagging. An input for the
//! current tick that arrives before the step is on time.

use pilot_sim::{PeerId, Tick};
use pilot_wire::InputCmdProto;

use crate::input::InputSnapshot;
use crate::input_buffer::{BufferResult, InputBuffer};

/// Window the authority enforces.
#[derive(Debug, Clone, Copy)]
pub struct ValidationConfig {
    pub max_future_ticks: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_future_ticks: crate::MAX_FUTURE_TICKS,
        }
    }
}

/// Result of input validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// Input accepted and buffered.
    Accepted,
    /// Input accepted with axes clamped.
    AcceptedWithClamp,
    /// Dropped: NaN/Inf or wrong arity in move_axis.
    DroppedNanInf,
    /// Dropped: Tick is late (below current tick).
    DroppedLate { tick: Tick, current: Tick },
    /// Dropped: Tick is too far in future.
    DroppedTooFuture { tick: Tick, max: Tick },
    /// Dropped: Sender holds input authority over no entity.
    DroppedUnauthorized,
    /// Dropped: An input for this (peer, tick) was already delivered.
    DroppedDuplicate,
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted | Self::AcceptedWithClamp)
    }

    /// Short reason used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AcceptedWithClamp => "clamped",
            Self::DroppedNanInf => "non-finite axes",
            Self::DroppedLate { .. } => "late",
            Self::DroppedTooFuture { .. } => "too far in future",
            Self::DroppedUnauthorized => "no input authority",
            Self::DroppedDuplicate => "duplicate",
        }
    }
}

/// Validate an input command and buffer it if acceptable.
///
/// # Arguments
/// * `input` - The input command as received
/// * `peer` - Sender, bound by the transport (never read from the payload)
/// * `current_tick` - Authority's current (pre-step) tick
/// * `authorized` - Whether `peer` holds input authority over any entity
pub fn validate_input(
    input: &InputCmdProto,
    peer: PeerId,
    current_tick: Tick,
    authorized: bool,
    config: &ValidationConfig,
    buffer: &mut InputBuffer,
) -> ValidationResult {
    let Ok(move_axis) = <[f64; 2]>::try_from(input.move_axis.as_slice()) else {
        return ValidationResult::DroppedNanInf;
    };
    if move_axis.iter().any(|axis| !axis.is_finite()) {
        return ValidationResult::DroppedNanInf;
    }

    if input.tick < current_tick {
        return ValidationResult::DroppedLate {
            tick: input.tick,
            current: current_tick,
        };
    }

    let max_tick = current_tick.saturating_add(config.max_future_ticks);
    if input.tick > max_tick {
        return ValidationResult::DroppedTooFuture {
            tick: input.tick,
            max: max_tick,
        };
    }

    if !authorized {
        return ValidationResult::DroppedUnauthorized;
    }

    let snapshot = InputSnapshot {
        tick: input.tick,
        move_axis,
        action: input.action,
    };
    match buffer.try_buffer(peer, snapshot) {
        BufferResult::Accepted { clamped: false } => ValidationResult::Accepted,
        BufferResult::Accepted { clamped: true } => ValidationResult::AcceptedWithClamp,
        BufferResult::Duplicate => ValidationResult::DroppedDuplicate,
    }
}
