//! Activity monitor: classifies whether the user is present while a message is on screen.

use crate::model::Activity;
use std::sync::Arc;
use std::time::Duration;

/// Screen coordinates of the pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerPosition {
    pub x: i32,
    pub y: i32,
}

/// Platform capability that reports the current pointer position.
pub trait PointerSource: Send + Sync {
    fn position(&self) -> PointerPosition;
}

#[derive(Clone)]
pub struct ActivityMonitor {
    pointer: Arc<dyn PointerSource>,
    sample_every: Duration,
}

impl ActivityMonitor {
    pub fn new(pointer: Arc<dyn PointerSource>) -> Self {
        Self {
            pointer,
            sample_every: Duration::from_secs(1),
        }
    }

    /// Sample once per second for up to `duration_seconds` samples. Returns
    /// [`Activity::Active`] as soon as the pointer leaves its starting position.
    pub async fn observe(&self, duration_seconds: u32) -> Activity {
        let origin = self.pointer.position();
        for _ in 0..duration_seconds {
            tokio::time::sleep(self.sample_every).await;
            if self.pointer.position() != origin {
                return Activity::Active;
            }
        }
        Activity::Inactive
    }
}
