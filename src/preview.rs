use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::camera::{CameraHandle, OpenRequest};
use crate::config::PreviewConfig;
use crate::error::PanelResult;
use crate::frame::{fit_within, render_scaled, SharedFrame};
use crate::recorder::Recorder;
use crate::worker::Worker;

/// Why a preview shows a placeholder instead of a live picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreviewStatus {
    Disabled,
    Recording,
    Paused,
    NoSignal,
}

impl PreviewStatus {
    /// Stable numeric code, as exposed over the C ABI.
    pub fn code(self) -> i32 {
        match self {
            PreviewStatus::Disabled => 1,
            PreviewStatus::Recording => 2,
            PreviewStatus::Paused => 3,
            PreviewStatus::NoSignal => 4,
        }
    }
}

impl fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreviewStatus::Disabled => "Preview Disabled",
            PreviewStatus::Recording => "Recording...",
            PreviewStatus::Paused => "Preview Paused",
            PreviewStatus::NoSignal => "No Signal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
struct PreviewCell {
    frame: Option<SharedFrame>,
    status: Option<PreviewStatus>,
}

/// What every preview loop has published, read by the renderer on its own
/// timer. Also carries the global preview on/off switch.
#[derive(Debug, Clone)]
pub struct PreviewBoard {
    cells: Arc<Mutex<HashMap<u32, PreviewCell>>>,
    enabled: Arc<AtomicBool>,
}

impl Default for PreviewBoard {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PreviewBoard {
    pub fn new(enabled: bool) -> Self {
        Self {
            cells: Arc::new(Mutex::new(HashMap::new())),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// A live frame replaces any status.
    pub fn publish(&self, index: u32, frame: SharedFrame) {
        let mut cells = self.cells.lock();
        let cell = cells.entry(index).or_default();
        cell.frame = Some(frame);
        cell.status = None;
    }

    /// A status replaces the picture.
    pub fn report(&self, index: u32, status: PreviewStatus) {
        let mut cells = self.cells.lock();
        let cell = cells.entry(index).or_default();
        cell.frame = None;
        cell.status = Some(status);
    }

    pub fn frame(&self, index: u32) -> Option<SharedFrame> {
        self.cells.lock().get(&index).and_then(|cell| cell.frame.clone())
    }

    /// `None` while a live frame is shown (or nothing was published yet).
    pub fn status(&self, index: u32) -> Option<PreviewStatus> {
        self.cells.lock().get(&index).and_then(|cell| cell.status)
    }

    /// The published frame rescaled by the user's display ratio.
    pub fn render(&self, index: u32, ratio: f64) -> Option<SharedFrame> {
        self.frame(index).map(|frame| render_scaled(&frame, ratio))
    }
}

/// Background loop keeping one camera's preview alive. It never holds the
/// device while the recorder owns it or is about to open it.
pub struct PreviewWorker {
    index: u32,
    worker: Worker,
    stop_timeout: Duration,
}

impl PreviewWorker {
    pub fn spawn(
        index: u32,
        recorder: Arc<Recorder>,
        board: PreviewBoard,
        config: PreviewConfig,
    ) -> PanelResult<Self> {
        let stop_timeout = recorder.config().stop_timeout();
        let preview = PreviewLoop {
            index,
            recorder,
            board,
            config,
            camera: None,
            read_failures: 0,
            last_status: None,
        };
        let worker = Worker::spawn(format!("preview-{index}"), move |stop| preview.run(&stop))?;
        debug!(camera = index, "preview started");

        Ok(Self {
            index,
            worker,
            stop_timeout,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bounded stop; `false` means the loop was left detached.
    pub fn stop(mut self) -> bool {
        self.worker.stop(self.stop_timeout)
    }
}

struct PreviewLoop {
    index: u32,
    recorder: Arc<Recorder>,
    board: PreviewBoard,
    config: PreviewConfig,
    camera: Option<CameraHandle>,
    read_failures: u32,
    last_status: Option<PreviewStatus>,
}

impl PreviewLoop {
    fn run(mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let pause = self.step();
            self.wait(stop, pause);
        }
        self.release();
        debug!(camera = self.index, "preview stopped");
    }

    /// One iteration. Returns how long to rest before the next one.
    fn step(&mut self) -> Duration {
        let interval = Duration::from_millis(self.config.interval_ms);
        let backoff = Duration::from_millis(self.config.reopen_backoff_ms);
        let index = self.index;

        if !self.board.is_enabled() {
            self.release();
            self.set_status(PreviewStatus::Disabled);
            return interval;
        }

        if self.recorder.is_recording(index) {
            self.release();
            match self.recorder.latest_frame(index) {
                Some(frame) => {
                    let frame = fit_within(&frame, self.config.width, self.config.height);
                    self.show(frame);
                }
                None => self.set_status(PreviewStatus::Recording),
            }
            return interval;
        }

        if self.recorder.is_preview_paused(index) {
            self.release();
            self.set_status(PreviewStatus::Paused);
            return interval;
        }

        if self.camera.is_none() {
            let request = OpenRequest {
                resolution: Some((self.config.width, self.config.height)),
                fps: None,
            };
            match CameraHandle::open(self.recorder.backend().as_ref(), index, &request) {
                Ok(camera) => {
                    self.camera = Some(camera);
                    self.read_failures = 0;
                }
                Err(e) => {
                    debug!(camera = index, error = %e, "preview could not open camera");
                    self.set_status(PreviewStatus::NoSignal);
                    return backoff;
                }
            }
        }

        let read = match self.camera.as_mut() {
            Some(camera) => camera.read(),
            None => return interval,
        };
        match read {
            Ok(frame) => {
                self.read_failures = 0;
                let frame = fit_within(&Arc::new(frame), self.config.width, self.config.height);
                self.show(frame);
                interval
            }
            Err(e) => {
                self.read_failures += 1;
                if self.read_failures < self.config.max_read_failures.max(1) {
                    return interval;
                }
                debug!(camera = index, failures = self.read_failures, error = %e, "preview lost the camera");
                self.release();
                self.set_status(PreviewStatus::NoSignal);
                backoff
            }
        }
    }

    /// Rests for `total`, waking early on stop or when the recorder asks for
    /// a device this loop still holds.
    fn wait(&self, stop: &AtomicBool, total: Duration) {
        const STEP: Duration = Duration::from_millis(5);
        let mut left = total;
        while !left.is_zero() && !stop.load(Ordering::Acquire) {
            if self.camera.is_some() && self.recorder.is_preview_paused(self.index) {
                return;
            }
            let step = left.min(STEP);
            thread::sleep(step);
            left -= step;
        }
    }

    fn show(&mut self, frame: SharedFrame) {
        if self.last_status.take().is_some() {
            info!(camera = self.index, "preview live");
        }
        self.board.publish(self.index, frame);
    }

    fn set_status(&mut self, status: PreviewStatus) {
        if self.last_status != Some(status) {
            info!(camera = self.index, %status, "preview status");
            self.last_status = Some(status);
        }
        self.board.report(self.index, status);
    }

    fn release(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        self.read_failures = 0;
    }
}
