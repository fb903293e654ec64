//! Local input sampling and tick targeting.

use std::sync::{Arc, Mutex, PoisonError};

use pilot_sim::Tick;

/// Input of one peer for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSnapshot {
    pub tick: Tick,
    /// Movement axes [x, y], each within [-1, 1].
    pub move_axis: [f64; 2],
    pub action: bool,
}

/// State of the local input device at sampling time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceState {
    pub move_axis: [f64; 2],
    pub action: bool,
}

/// The engine's input device, sampled once per fixed tick.
pub trait InputSource {
    fn sample(&mut self) -> DeviceState;
}

/// A device that never moves.
#[derive(Debug, Default)]
pub struct NoInput;

impl InputSource for NoInput {
    fn sample(&mut self) -> DeviceState {
        DeviceState::default()
    }
}

/// Device state shared with whoever drives it (UI thread, test).
#[derive(Debug, Clone, Default)]
pub struct SharedInput {
    state: Arc<Mutex<DeviceState>>,
}

impl SharedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, move_axis: [f64; 2], action: bool) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
            DeviceState { move_axis, action };
    }

    pub fn clear(&self) {
        self.set([0.0, 0.0], false);
    }
}

impl InputSource for SharedInput {
    fn sample(&mut self) -> DeviceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Chooses the tick a locally sampled input is tagged with.
///
/// The state authority publishes a target tick floor with every snapshot:
/// the earliest tick an input sent now can still reach before its step.
/// Each sample gets `max(next_input_tick, floor)` so ticks never repeat or
/// go backwards.
#[derive(Debug, Clone, Default)]
pub struct TickTargeting {
    floor: Tick,
    next_input_tick: Tick,
}

impl TickTargeting {
    pub fn new(floor: Tick) -> Self {
        Self {
            floor,
            next_input_tick: floor,
        }
    }

    /// Latest floor seen from the authority. Floors never decrease.
    pub fn observe_floor(&mut self, floor: Tick) {
        self.floor = self.floor.max(floor);
    }

    pub fn floor(&self) -> Tick {
        self.floor
    }

    /// Tick the next sample would get.
    pub fn peek_tick(&self) -> Tick {
        self.next_input_tick.max(self.floor)
    }

    /// Claim the tick for the next sample.
    pub fn next_tick(&mut self) -> Tick {
        let tick = self.peek_tick();
        self.next_input_tick = tick.saturating_add(1);
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_follow_floor() {
        let mut targeting = TickTargeting::new(1);
        assert_eq!(targeting.next_tick(), 1);
        assert_eq!(targeting.next_tick(), 2);

        // Floor jumps ahead (e.g. snapshots were delayed).
        targeting.observe_floor(10);
        assert_eq!(targeting.peek_tick(), 10);
        assert_eq!(targeting.next_tick(), 10);
        assert_eq!(targeting.next_tick(), 11);
    }

    #[test]
    fn test_floor_never_regresses() {
        let mut targeting = TickTargeting::new(5);
        targeting.observe_floor(3);
        assert_eq!(targeting.floor(), 5);
        assert_eq!(targeting.next_tick(), 5);
    }

    #[test]
    fn test_floor_at_max_tick() {
        let mut targeting = TickTargeting::new(0);
        targeting.observe_floor(Tick::MAX);
        assert_eq!(targeting.next_tick(), Tick::MAX);
        assert_eq!(targeting.next_tick(), Tick::MAX);
    }

    #[test]
    fn test_shared_input_visible_to_sampler() {
        let handle = SharedInput::new();
        let mut source = handle.clone();
        assert_eq!(source.sample(), DeviceState::default());

        handle.set([1.0, 0.0], true);
        assert_eq!(
            source.sample(),
            DeviceState {
                move_axis: [1.0, 0.0],
                action: true
            }
        );

        handle.clear();
        assert_eq!(NoInput.sample(), source.sample());
    }
}
