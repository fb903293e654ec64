//! Input buffering on the state authority.
//!
//! - Buffer keyed by (peer, tick)
//! - First delivery wins; later deliveries for the same key are duplicates
//! - Reading a snapshot removes it, so each is consumed at most once
//! - Axes outside [-1, 1] are clamped on insert

use std::collections::BTreeMap;

use pilot_sim::{PeerId, Tick};

use crate::input::InputSnapshot;

/// Result of attempting to buffer an input.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferResult {
    Accepted { clamped: bool },
    Duplicate,
}

/// Tick-indexed input buffer.
#[derive(Debug, Default)]
pub struct InputBuffer {
    buffer: BTreeMap<(PeerId, Tick), InputSnapshot>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to buffer an input for `peer`.
    pub fn try_buffer(&mut self, peer: PeerId, input: InputSnapshot) -> BufferResult {
        let key = (peer, input.tick);
        if self.buffer.contains_key(&key) {
            return BufferResult::Duplicate;
        }

        let mut input = input;
        let clamped = clamp_axes(&mut input.move_axis);
        self.buffer.insert(key, input);

        BufferResult::Accepted { clamped }
    }

    /// Take the input of `peer` for `tick`, removing it from the buffer.
    pub fn take_input(&mut self, peer: PeerId, tick: Tick) -> Option<InputSnapshot> {
        self.buffer.remove(&(peer, tick))
    }

    /// Look at the input of `peer` for `tick` without consuming it.
    pub fn get(&self, peer: PeerId, tick: Tick) -> Option<&InputSnapshot> {
        self.buffer.get(&(peer, tick))
    }

    /// Whether an input for `(peer, tick)` is waiting.
    pub fn has_input(&self, peer: PeerId, tick: Tick) -> bool {
        self.buffer.contains_key(&(peer, tick))
    }

    /// Evict all buffered entries for ticks before the given tick.
    pub fn evict_before(&mut self, tick: Tick) {
        self.buffer.retain(|&(_, t), _| t >= tick);
    }

    /// Forget everything buffered for a peer that left.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.buffer.retain(|&(p, _), _| p != peer);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Clamp each axis to [-1, 1]. Returns true if anything changed.
fn clamp_axes(axes: &mut [f64; 2]) -> bool {
    let mut clamped = false;
    for axis in axes.iter_mut() {
        let bounded = axis.clamp(-1.0, 1.0);
        if bounded != *axis {
            *axis = bounded;
            clamped = true;
        }
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_input(tick: Tick, x: f64, y: f64) -> InputSnapshot {
        InputSnapshot {
            tick,
            move_axis: [x, y],
            action: false,
        }
    }

    #[test]
    fn test_first_input_accepted() {
        let mut buffer = InputBuffer::new();

        let result = buffer.try_buffer(2, make_input(5, 1.0, 0.0));
        assert_eq!(result, BufferResult::Accepted { clamped: false });
        assert!(buffer.has_input(2, 5));
    }

    #[test]
    fn test_first_delivery_wins() {
        let mut buffer = InputBuffer::new();

        buffer.try_buffer(2, make_input(5, 1.0, 0.0));
        let result = buffer.try_buffer(2, make_input(5, 0.0, 1.0));
        assert_eq!(result, BufferResult::Duplicate);

        let taken = buffer.take_input(2, 5).unwrap();
        assert_eq!(taken.move_axis, [1.0, 0.0]);
    }

    #[test]
    fn test_take_consumes_once() {
        let mut buffer = InputBuffer::new();
        buffer.try_buffer(2, make_input(5, 1.0, 0.0));

        assert!(buffer.take_input(2, 5).is_some());
        assert!(buffer.take_input(2, 5).is_none());
    }

    #[test]
    fn test_peers_are_independent() {
        let mut buffer = InputBuffer::new();
        buffer.try_buffer(2, make_input(5, 1.0, 0.0));
        buffer.try_buffer(3, make_input(5, -1.0, 0.0));

        assert_eq!(buffer.take_input(3, 5).unwrap().move_axis, [-1.0, 0.0]);
        assert_eq!(buffer.take_input(2, 5).unwrap().move_axis, [1.0, 0.0]);
    }

    #[test]
    fn test_axes_clamped() {
        let mut buffer = InputBuffer::new();
        let result = buffer.try_buffer(2, make_input(5, 3.0, -2.5));
        assert_eq!(result, BufferResult::Accepted { clamped: true });

        let taken = buffer.take_input(2, 5).unwrap();
        assert_eq!(taken.move_axis, [1.0, -1.0]);
    }

    #[test]
    fn test_evict_before() {
        let mut buffer = InputBuffer::new();
        buffer.try_buffer(2, make_input(3, 1.0, 0.0));
        buffer.try_buffer(2, make_input(5, 1.0, 0.0));
        buffer.try_buffer(2, make_input(7, 1.0, 0.0));

        buffer.evict_before(5);

        assert!(!buffer.has_input(2, 3));
        assert!(buffer.has_input(2, 5));
        assert!(buffer.has_input(2, 7));
    }

    #[test]
    fn test_remove_peer() {
        let mut buffer = InputBuffer::new();
        buffer.try_buffer(2, make_input(5, 1.0, 0.0));
        buffer.try_buffer(3, make_input(5, 1.0, 0.0));

        buffer.remove_peer(2);

        assert_eq!(buffer.len(), 1);
        assert!(buffer.has_input(3, 5));
    }
}
