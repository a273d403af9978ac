//! In-memory camera and encoder doubles for the threaded tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use crate::camera::{CameraBackend, CameraDevice, OpenRequest};
use crate::config::RecorderConfig;
use crate::encoder::{EncoderFactory, VideoSink};
use crate::error::{PanelError, PanelResult};
use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct FakeSpec {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// `None` streams forever.
    pub frames: Option<u64>,
    pub fail_open: bool,
    pub fail_first_read: bool,
    /// Read number (per handle, counting from 1) that blocks for `stall_for`
    /// before answering.
    pub stall_on_read: Option<u64>,
    pub stall_for: Duration,
}

impl Default for FakeSpec {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            fps: 500.0,
            frames: None,
            fail_open: false,
            fail_first_read: false,
            stall_on_read: None,
            stall_for: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Ledger {
    held: HashMap<u32, usize>,
    max_held: HashMap<u32, usize>,
    opens: Vec<(u32, OpenRequest)>,
    delivered: HashMap<u32, u64>,
    exhausted_reads: HashMap<u32, u64>,
    stalls: HashMap<u32, u64>,
}

/// Scripted cameras that remember how many handles are open per index.
#[derive(Clone, Default)]
pub struct FakeBackend {
    specs: Arc<Mutex<HashMap<u32, FakeSpec>>>,
    ledger: Arc<Mutex<Ledger>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, index: u32, spec: FakeSpec) -> Self {
        self.set_camera(index, spec);
        self
    }

    pub fn set_camera(&self, index: u32, spec: FakeSpec) {
        self.specs.lock().insert(index, spec);
    }

    pub fn held(&self, index: u32) -> usize {
        self.ledger.lock().held.get(&index).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously open handles ever seen for `index`.
    pub fn max_held(&self, index: u32) -> usize {
        self.ledger.lock().max_held.get(&index).copied().unwrap_or(0)
    }

    pub fn opens(&self) -> Vec<(u32, OpenRequest)> {
        self.ledger.lock().opens.clone()
    }

    pub fn delivered(&self, index: u32) -> u64 {
        self.ledger.lock().delivered.get(&index).copied().unwrap_or(0)
    }

    pub fn exhausted_reads(&self, index: u32) -> u64 {
        self.ledger.lock().exhausted_reads.get(&index).copied().unwrap_or(0)
    }

    /// Reads on `index` that have entered their scripted stall.
    pub fn stalls(&self, index: u32) -> u64 {
        self.ledger.lock().stalls.get(&index).copied().unwrap_or(0)
    }
}

impl CameraBackend for FakeBackend {
    fn open(&self, index: u32, request: &OpenRequest) -> PanelResult<Box<dyn CameraDevice>> {
        let spec = self.specs.lock().get(&index).cloned();
        let Some(spec) = spec.filter(|s| !s.fail_open) else {
            return Err(PanelError::DeviceUnavailable { index });
        };

        let (width, height) = request.resolution.unwrap_or((spec.width, spec.height));

        let mut ledger = self.ledger.lock();
        ledger.opens.push((index, *request));
        let held = ledger.held.entry(index).or_insert(0);
        *held += 1;
        let now_held = *held;
        let max = ledger.max_held.entry(index).or_insert(0);
        *max = (*max).max(now_held);

        Ok(Box::new(FakeCamera {
            index,
            width,
            height,
            fps: spec.fps,
            remaining: spec.frames,
            fail_next_read: spec.fail_first_read,
            reads: 0,
            stall_on_read: spec.stall_on_read,
            stall_for: spec.stall_for,
            ledger: Arc::clone(&self.ledger),
            open: true,
        }))
    }
}

struct FakeCamera {
    index: u32,
    width: u32,
    height: u32,
    fps: f64,
    remaining: Option<u64>,
    fail_next_read: bool,
    reads: u64,
    stall_on_read: Option<u64>,
    stall_for: Duration,
    ledger: Arc<Mutex<Ledger>>,
    open: bool,
}

impl CameraDevice for FakeCamera {
    fn read(&mut self) -> PanelResult<Frame> {
        self.reads += 1;
        if self.stall_on_read == Some(self.reads) {
            *self.ledger.lock().stalls.entry(self.index).or_insert(0) += 1;
            thread::sleep(self.stall_for);
        }
        if self.fail_next_read {
            self.fail_next_read = false;
            return Err(PanelError::ReadFailure("scripted failure".to_string()));
        }
        if self.remaining == Some(0) {
            *self.ledger.lock().exhausted_reads.entry(self.index).or_insert(0) += 1;
            return Err(PanelError::ReadFailure("no more frames".to_string()));
        }
        if let Some(left) = self.remaining.as_mut() {
            *left -= 1;
        }

        let mut ledger = self.ledger.lock();
        let count = ledger.delivered.entry(self.index).or_insert(0);
        *count += 1;
        let shade = (*count % 256) as u8;
        Ok(RgbImage::from_pixel(self.width, self.height, Rgb([shade, 0, 0])))
    }

    fn reported_fps(&self) -> f64 {
        self.fps
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            if let Some(held) = self.ledger.lock().held.get_mut(&self.index) {
                *held = held.saturating_sub(1);
            }
        }
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct OpenedEncoder {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Default)]
struct EncoderLedger {
    opened: Vec<OpenedEncoder>,
    appended: HashMap<PathBuf, u64>,
    finished: HashMap<PathBuf, u64>,
}

/// Counts frames instead of encoding them.
#[derive(Clone, Default)]
pub struct MemoryEncoders {
    ledger: Arc<Mutex<EncoderLedger>>,
    refuse: Arc<AtomicBool>,
}

impl MemoryEncoders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        let encoders = Self::default();
        encoders.refuse.store(true, Ordering::SeqCst);
        encoders
    }

    pub fn opened(&self) -> Vec<OpenedEncoder> {
        self.ledger.lock().opened.clone()
    }

    pub fn appended(&self, path: &Path) -> u64 {
        self.ledger.lock().appended.get(path).copied().unwrap_or(0)
    }

    pub fn finished(&self, path: &Path) -> u64 {
        self.ledger.lock().finished.get(path).copied().unwrap_or(0)
    }
}

impl EncoderFactory for MemoryEncoders {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> PanelResult<Box<dyn VideoSink>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PanelError::EncoderOpenFailure("codec unavailable".to_string()));
        }
        self.ledger.lock().opened.push(OpenedEncoder {
            path: path.to_path_buf(),
            width,
            height,
            fps,
        });
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            size: (width, height),
            ledger: Arc::clone(&self.ledger),
            done: false,
        }))
    }
}

struct MemorySink {
    path: PathBuf,
    size: (u32, u32),
    ledger: Arc<Mutex<EncoderLedger>>,
    done: bool,
}

impl VideoSink for MemorySink {
    fn append(&mut self, frame: &Frame) -> PanelResult<()> {
        if frame.dimensions() != self.size {
            return Err(PanelError::Image("size mismatch".to_string()));
        }
        *self.ledger.lock().appended.entry(self.path.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn finish(&mut self) -> PanelResult<()> {
        if !self.done {
            self.done = true;
            *self.ledger.lock().finished.entry(self.path.clone()).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Recorder settings tuned for fast tests.
pub fn quick_config(save_dir: &Path) -> RecorderConfig {
    RecorderConfig {
        save_dir: save_dir.to_path_buf(),
        handoff_grace_ms: 40,
        stop_timeout_ms: 2000,
        read_retry_ms: 1,
        ..RecorderConfig::default()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
