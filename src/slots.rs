use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::SharedFrame;

/// Single-slot mailbox per camera. Producers overwrite, readers clone the
/// `Arc` out under the same lock, so nobody sees a half-written frame and
/// nothing queues up behind a slow reader.
#[derive(Debug, Default, Clone)]
pub struct FrameSlots {
    slots: Arc<Mutex<HashMap<u32, SharedFrame>>>,
}

impl FrameSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, index: u32, frame: SharedFrame) {
        self.slots.lock().insert(index, frame);
    }

    pub fn latest(&self, index: u32) -> Option<SharedFrame> {
        self.slots.lock().get(&index).cloned()
    }

    pub fn clear(&self, index: u32) {
        self.slots.lock().remove(&index);
    }
}

/// Cameras whose preview must keep its hands off the device because the
/// recorder is about to open it (or owns it).
#[derive(Debug, Default, Clone)]
pub struct PauseFlags {
    paused: Arc<Mutex<HashSet<u32>>>,
}

impl PauseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self, index: u32) {
        self.paused.lock().insert(index);
    }

    pub fn resume(&self, index: u32) {
        self.paused.lock().remove(&index);
    }

    pub fn is_paused(&self, index: u32) -> bool {
        self.paused.lock().contains(&index)
    }
}
