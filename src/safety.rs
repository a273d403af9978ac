use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::recorder::Recorder;

/// Stops every recording camera when the scale reads below a threshold.
pub struct SafetyMonitor {
    recorder: Arc<Recorder>,
    threshold: f64,
}

impl SafetyMonitor {
    pub fn new(recorder: Arc<Recorder>, threshold: f64) -> Self {
        Self {
            recorder,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Feeds one weight reading. Returns the cameras stopped by it, in index
    /// order, with their saved outputs; empty when nothing was recording.
    pub fn check(&self, weight: f64) -> Vec<(u32, PathBuf)> {
        if weight.is_nan() || weight >= self.threshold {
            return Vec::new();
        }

        let mut stopped = Vec::new();
        for index in self.recorder.recording_cameras() {
            if let Some(path) = self.recorder.stop(index) {
                warn!(
                    camera = index,
                    weight,
                    threshold = self.threshold,
                    output = %path.display(),
                    "weight below threshold, recording stopped"
                );
                stopped.push((index, path));
            }
            self.recorder.resume_preview(index);
        }
        stopped
    }
}
