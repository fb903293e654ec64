//! Presentation collaborators: name labels and the follow camera.
//!
//! Both are sinks owned by the rendering engine. The runner only pushes
//! values into them from `render()`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use pilot_sim::{EntityId, Transform};

use crate::config::CameraConfig;

/// Text label floating above each entity.
pub trait NameLabels {
    fn set_text(&mut self, entity: EntityId, text: &str);
    fn set_visible(&mut self, entity: EntityId, visible: bool);
}

/// Camera attachment point.
pub trait CameraRig {
    /// Place the camera. `euler_degrees` is pitch, yaw, roll.
    fn place(&mut self, position: [f64; 3], euler_degrees: [f64; 3]);
}

/// Labels kept in memory, for headless peers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelBoard {
    labels: BTreeMap<EntityId, Label>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub visible: bool,
}

impl Default for Label {
    fn default() -> Self {
        Self {
            text: String::new(),
            visible: true,
        }
    }
}

impl LabelBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: EntityId) -> Option<&Label> {
        self.labels.get(&entity)
    }

    pub fn text(&self, entity: EntityId) -> Option<&str> {
        self.get(entity).map(|label| label.text.as_str())
    }
}

impl NameLabels for LabelBoard {
    fn set_text(&mut self, entity: EntityId, text: &str) {
        self.labels.entry(entity).or_default().text = text.to_string();
    }

    fn set_visible(&mut self, entity: EntityId, visible: bool) {
        self.labels.entry(entity).or_default().visible = visible;
    }
}

/// Last placement, for headless peers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixedCamera {
    pub position: [f64; 3],
    pub euler_degrees: [f64; 3],
}

impl CameraRig for FixedCamera {
    fn place(&mut self, position: [f64; 3], euler_degrees: [f64; 3]) {
        self.position = position;
        self.euler_degrees = euler_degrees;
    }
}

// Shared handles, so the engine side can read what the runner pushed.

impl<T: NameLabels> NameLabels for Arc<Mutex<T>> {
    fn set_text(&mut self, entity: EntityId, text: &str) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_text(entity, text);
    }

    fn set_visible(&mut self, entity: EntityId, visible: bool) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_visible(entity, visible);
    }
}

impl<T: CameraRig> CameraRig for Arc<Mutex<T>> {
    fn place(&mut self, position: [f64; 3], euler_degrees: [f64; 3]) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .place(position, euler_degrees);
    }
}

/// Put the camera behind `target` at the configured offset.
pub fn follow(camera: &mut dyn CameraRig, target: Transform, config: &CameraConfig) {
    let [x, y, z] = target.position;
    let [ox, oy, oz] = config.offset_position;
    camera.place([x + ox, y + oy, z + oz], config.offset_rotation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_board_records_text_and_visibility() {
        let mut board = LabelBoard::new();
        board.set_text(3, "Player_2");
        assert_eq!(board.text(3), Some("Player_2"));
        assert!(board.get(3).unwrap().visible);

        board.set_visible(3, false);
        assert!(!board.get(3).unwrap().visible);
        assert_eq!(board.text(4), None);
    }

    #[test]
    fn test_follow_applies_offset() {
        let mut camera = FixedCamera::default();
        follow(
            &mut camera,
            Transform::at([1.0, 0.0, 2.0]),
            &CameraConfig::default(),
        );
        assert_eq!(camera.position, [1.0, 6.0, -5.0]);
        assert_eq!(camera.euler_degrees, [30.0, 0.0, 0.0]);
    }

    #[test]
    fn test_shared_board_sees_writes() {
        let board = Arc::new(Mutex::new(LabelBoard::new()));
        let mut sink: Box<dyn NameLabels> = Box::new(Arc::clone(&board));

        sink.set_text(1, "Player_1");

        assert_eq!(board.lock().unwrap().text(1), Some("Player_1"));
    }
}
