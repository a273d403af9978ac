use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use image::ImageFormat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::{effective_fps, CameraBackend, CameraHandle, OpenRequest};
use crate::config::RecorderConfig;
use crate::encoder::{EncoderFactory, VideoSink};
use crate::error::{PanelError, PanelResult};
use crate::frame::{apply_roi, Frame, Roi};
use crate::slots::{FrameSlots, PauseFlags};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordMode {
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "frames")]
    FrameExtraction,
}

impl FromStr for RecordMode {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(RecordMode::Video),
            "frames" => Ok(RecordMode::FrameExtraction),
            other => Err(PanelError::Config(format!("unknown record mode {other:?}"))),
        }
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordMode::Video => f.write_str("video"),
            RecordMode::FrameExtraction => f.write_str("frames"),
        }
    }
}

/// Lifecycle of one camera's capture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Opening,
    Capturing,
    Stopping,
}

/// 1-based label matching the "camera 1 / camera 2" naming on the panel.
pub fn camera_label(index: u32) -> String {
    (index + 1).to_string()
}

/// Where a session for `stem` on camera `index` writes its output: a video
/// file, or a directory of stills.
pub fn output_target(
    save_dir: &Path,
    stem: &str,
    index: u32,
    mode: RecordMode,
    video_extension: &str,
) -> PathBuf {
    let base = format!("{stem}_{}", camera_label(index));
    match mode {
        RecordMode::Video => save_dir.join(format!("{base}.{video_extension}")),
        RecordMode::FrameExtraction => save_dir.join(base),
    }
}

/// State of one active recording, owned by the capture loop.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub index: u32,
    pub mode: RecordMode,
    pub output: PathBuf,
    pub frames: u64,
    pub extracted: u64,
    pub started_at: DateTime<Local>,
}

/// Writes every `interval`-th frame as `frame_NNNN.<ext>` into a directory.
/// Numbering always starts at `frame_0000` for a new extractor.
#[derive(Debug)]
pub struct FrameExtractor {
    dir: PathBuf,
    interval: u64,
    extension: String,
    seen: u64,
    written: u64,
}

impl FrameExtractor {
    pub fn new(dir: impl Into<PathBuf>, interval: u64, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            interval: interval.max(1),
            extension: extension.into(),
            seen: 0,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Counts a frame and saves it when it completes an interval.
    pub fn push(&mut self, frame: &Frame) -> PanelResult<Option<PathBuf>> {
        self.seen += 1;
        if self.seen % self.interval != 0 {
            return Ok(None);
        }

        let path = self
            .dir
            .join(format!("frame_{:04}.{}", self.written, self.extension));
        let format = ImageFormat::from_extension(&self.extension).unwrap_or(ImageFormat::Jpeg);
        frame.save_with_format(&path, format)?;
        self.written += 1;
        Ok(Some(path))
    }
}

/// Everything a capture session needs from its owner.
#[derive(Clone)]
pub struct CaptureEnv {
    pub config: RecorderConfig,
    pub backend: Arc<dyn CameraBackend>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub latest: FrameSlots,
    pub pause: PauseFlags,
}

type SharedSink = Arc<Mutex<Option<Box<dyn VideoSink>>>>;

/// Which sides of a session are gone. The preview gets the camera back only
/// once both the stopper and the loop have left, so a loop still stuck in a
/// read keeps the preview paused until it lets go of the device.
#[derive(Debug, Default)]
struct Departure {
    stopper: bool,
    capture_loop: bool,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Stopper,
    CaptureLoop,
}

#[derive(Debug, Clone, Default)]
struct Handback {
    departure: Arc<Mutex<Departure>>,
    pause: PauseFlags,
}

impl Handback {
    fn leave(&self, index: u32, side: Side) {
        let last = {
            let mut departure = self.departure.lock();
            match side {
                Side::Stopper => departure.stopper = true,
                Side::CaptureLoop => departure.capture_loop = true,
            }
            departure.stopper && departure.capture_loop
        };
        if last {
            self.pause.resume(index);
        }
    }
}

/// One camera's background recording loop and the resources it holds.
pub struct CaptureWorker {
    index: u32,
    output: PathBuf,
    camera: Arc<Mutex<CameraHandle>>,
    sink: SharedSink,
    worker: Worker,
    latest: FrameSlots,
    handback: Handback,
    stop_timeout: Duration,
}

impl CaptureWorker {
    /// Pauses preview, opens the device, probes one frame, prepares the
    /// output and starts the loop. Any failure leaves nothing behind.
    pub fn start(
        env: &CaptureEnv,
        index: u32,
        mode: RecordMode,
        stem: &str,
        request: &OpenRequest,
        roi: Option<Roi>,
    ) -> PanelResult<Self> {
        // give the preview loop a chance to see the flag and let go of the
        // device; this is a grace period, not an acknowledgement
        env.pause.pause(index);
        thread::sleep(env.config.handoff_grace());

        match Self::open_session(env, index, mode, stem, request, roi) {
            Ok(worker) => Ok(worker),
            Err(e) => {
                env.pause.resume(index);
                Err(e)
            }
        }
    }

    fn open_session(
        env: &CaptureEnv,
        index: u32,
        mode: RecordMode,
        stem: &str,
        request: &OpenRequest,
        roi: Option<Roi>,
    ) -> PanelResult<Self> {
        let config = &env.config;
        let mut camera = CameraHandle::open(env.backend.as_ref(), index, request)?;

        let probe = match camera.read() {
            Ok(frame) => apply_roi(frame, roi.as_ref()),
            Err(e) => {
                warn!(camera = index, error = %e, "no frame from freshly opened camera");
                camera.close();
                return Err(PanelError::NoFrame { index });
            }
        };
        let (width, height) = probe.dimensions();
        let fps = effective_fps(camera.reported_fps(), config.default_fps);

        fs::create_dir_all(&config.save_dir)?;
        let output = output_target(&config.save_dir, stem, index, mode, &config.video_extension);

        let (sink, extractor) = match mode {
            RecordMode::Video => match env.encoders.open(&output, width, height, fps) {
                Ok(sink) => (Some(sink), None),
                Err(e) => {
                    camera.close();
                    return Err(match e {
                        e @ PanelError::EncoderOpenFailure(_) => e,
                        other => PanelError::EncoderOpenFailure(other.to_string()),
                    });
                }
            },
            RecordMode::FrameExtraction => {
                if let Err(e) = fs::create_dir_all(&output) {
                    camera.close();
                    return Err(e.into());
                }
                let extractor = FrameExtractor::new(
                    &output,
                    config.extract_interval,
                    config.image_extension.clone(),
                );
                (None, Some(extractor))
            }
        };

        let session = RecordingSession {
            index,
            mode,
            output: output.clone(),
            frames: 0,
            extracted: 0,
            started_at: Local::now(),
        };

        let camera = Arc::new(Mutex::new(camera));
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let handback = Handback {
            departure: Arc::default(),
            pause: env.pause.clone(),
        };

        let capture_loop = CaptureLoop {
            session,
            camera: Arc::clone(&camera),
            sink: Arc::clone(&sink),
            extractor,
            roi,
            latest: env.latest.clone(),
            handback: handback.clone(),
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1.0)),
            read_retry: config.read_retry(),
        };

        let worker = match Worker::spawn(format!("capture-{index}"), move |stop| {
            capture_loop.run(&stop)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                release(index, &sink, &camera, Instant::now() + config.stop_timeout());
                return Err(e);
            }
        };

        info!(
            camera = index,
            %mode,
            output = %output.display(),
            width,
            height,
            fps,
            "recording started"
        );

        Ok(Self {
            index,
            output,
            camera,
            sink,
            worker,
            latest: env.latest.clone(),
            handback,
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Stops the loop and releases encoder and device whether or not the
    /// loop exited, all within one `stop_timeout`. Clears the latest frame.
    /// Preview resumes once the loop is gone too.
    pub fn stop(mut self) -> PathBuf {
        let deadline = Instant::now() + self.stop_timeout;
        if !self.worker.stop(self.stop_timeout) {
            warn!(camera = self.index, "capture loop still running, releasing resources anyway");
        }

        release(self.index, &self.sink, &self.camera, deadline);
        self.latest.clear(self.index);
        self.handback.leave(self.index, Side::Stopper);

        info!(camera = self.index, output = %self.output.display(), "recording stopped");
        self.output
    }
}

/// Finishes the encoder and closes the device, giving up at `deadline`.
/// Safe to race with the loop's own teardown: whoever takes a resource first
/// releases it.
fn release(
    index: u32,
    sink: &SharedSink,
    camera: &Arc<Mutex<CameraHandle>>,
    deadline: Instant,
) {
    match sink.try_lock_until(deadline) {
        Some(mut slot) => {
            if let Some(mut sink) = slot.take() {
                if let Err(e) = sink.finish() {
                    warn!(camera = index, error = %e, "encoder did not finish cleanly");
                }
            }
        }
        None => warn!(camera = index, "encoder busy, left to the capture loop"),
    }

    match camera.try_lock_until(deadline) {
        Some(mut handle) => handle.close(),
        None => warn!(camera = index, "camera busy, left to the capture loop"),
    }
}

struct CaptureLoop {
    session: RecordingSession,
    camera: Arc<Mutex<CameraHandle>>,
    sink: SharedSink,
    extractor: Option<FrameExtractor>,
    roi: Option<Roi>,
    latest: FrameSlots,
    handback: Handback,
    frame_interval: Duration,
    read_retry: Duration,
}

impl CaptureLoop {
    fn run(mut self, stop: &AtomicBool) {
        let index = self.session.index;
        let started = Instant::now();
        let mut next_deadline = Instant::now();
        let mut read_failures: u64 = 0;
        let mut write_failures: u64 = 0;

        while !stop.load(Ordering::Acquire) {
            let read = {
                let mut camera = self.camera.lock();
                if !camera.is_open() {
                    break;
                }
                camera.read()
            };

            // a read can outlast the stopper's wait; nothing read after the
            // stop request is published or recorded
            if stop.load(Ordering::Acquire) {
                break;
            }

            let frame = match read {
                Ok(frame) => frame,
                Err(e) => {
                    read_failures += 1;
                    if read_failures == 1 || read_failures % 500 == 0 {
                        debug!(camera = index, failures = read_failures, error = %e, "frame read failed, retrying");
                    }
                    thread::sleep(self.read_retry);
                    continue;
                }
            };

            let frame = Arc::new(apply_roi(frame, self.roi.as_ref()));
            self.latest.publish(index, Arc::clone(&frame));
            self.session.frames += 1;

            if let Err(e) = self.record(&frame) {
                write_failures += 1;
                if write_failures == 1 || write_failures % 100 == 0 {
                    warn!(camera = index, failures = write_failures, error = %e, "frame not recorded");
                }
            }

            next_deadline += self.frame_interval;
            let now = Instant::now();
            if next_deadline > now {
                thread::sleep(next_deadline - now);
            } else {
                next_deadline = now;
            }
        }

        if let Some(mut sink) = self.sink.lock().take() {
            if let Err(e) = sink.finish() {
                warn!(camera = index, error = %e, "encoder did not finish cleanly");
            }
        }
        self.camera.lock().close();
        self.latest.clear(index);
        self.handback.leave(index, Side::CaptureLoop);

        info!(
            camera = index,
            frames = self.session.frames,
            extracted = self.session.extracted,
            read_failures,
            elapsed_s = started.elapsed().as_secs_f64(),
            since = %self.session.started_at.format("%H:%M:%S"),
            "capture loop finished"
        );
    }

    fn record(&mut self, frame: &Frame) -> PanelResult<()> {
        match self.session.mode {
            RecordMode::Video => {
                if let Some(sink) = self.sink.lock().as_mut() {
                    sink.append(frame)?;
                }
            }
            RecordMode::FrameExtraction => {
                if let Some(extractor) = self.extractor.as_mut() {
                    if let Some(path) = extractor.push(frame)? {
                        self.session.extracted = extractor.written();
                        debug!(camera = self.session.index, path = %path.display(), "still extracted");
                    }
                }
            }
        }
        Ok(())
    }
}
