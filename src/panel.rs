//! The control panel as a whole: both cameras with their previews, the MCU,
//! the scale and the safety cut-off, wired the way the operator UI uses them.
//!
//! The UI thread only calls into [`ControlPanel`] and reads published state.
//! Camera starts and stops are queued as commands and run on their own
//! thread; every device, encoder and serial access happens off the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::capture::{output_target, RecordMode};
use crate::commands::{CameraCommand, CommandDispatcher, CommandOutcome, Ticket};
use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use crate::frame::SharedFrame;
use crate::logging::LogSink;
use crate::mcu::MotorController;
use crate::preview::{PreviewBoard, PreviewStatus, PreviewWorker};
use crate::recorder::{Recorder, Toggle};
use crate::records;
use crate::safety::SafetyMonitor;
use crate::scale::WeightReader;
use crate::worker::{sleep_unless_stopped, Worker};

const WATCH_JOIN: Duration = Duration::from_secs(5);
const COMMAND_JOIN: Duration = Duration::from_secs(10);

/// What the weight label shows.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WeightDisplay {
    #[default]
    Pending,
    Value(f64),
    /// The scale answered with text containing no number.
    Text(String),
    Error(String),
}

impl fmt::Display for WeightDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightDisplay::Pending => f.write_str("--"),
            WeightDisplay::Value(weight) => write!(f, "{weight:.2} (g)"),
            WeightDisplay::Text(text) => f.write_str(text),
            WeightDisplay::Error(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Anything that can be polled for a weight. The scale in production.
pub trait WeightSource: Send {
    /// Raw text of one reading and the number found in it.
    fn read_weight(&mut self) -> PanelResult<(String, Option<f64>)>;
}

impl WeightSource for WeightReader {
    fn read_weight(&mut self) -> PanelResult<(String, Option<f64>)> {
        WeightReader::read_weight(self)
    }
}

#[derive(Debug, Default)]
struct WeightState {
    display: WeightDisplay,
    last: Option<f64>,
}

/// Recording state of all configured cameras taken together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BothState {
    AllIdle,
    AllRecording,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BothToggle {
    started: bool,
    saved: Vec<(u32, PathBuf)>,
}

/// The operator's answer when a recording would reuse an existing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionChoice {
    Overwrite,
    Suffix,
    Abort,
}

/// Files and directories a start on `cameras` would create.
pub fn output_candidates(
    save_dir: &Path,
    stem: &str,
    mode: RecordMode,
    cameras: &[u32],
    video_extension: &str,
) -> Vec<PathBuf> {
    cameras
        .iter()
        .map(|&index| output_target(save_dir, stem, index, mode, video_extension))
        .collect()
}

/// Applies the operator's collision choice. A stem whose candidates are all
/// free is returned unchanged; `None` means the start is abandoned.
pub fn resolve_stem(stem: &str, candidates: &[PathBuf], choice: CollisionChoice) -> Option<String> {
    if !candidates.iter().any(|path| path.exists()) {
        return Some(stem.to_string());
    }
    match choice {
        CollisionChoice::Overwrite => Some(stem.to_string()),
        CollisionChoice::Suffix => Some(format!("{stem}_{}", Local::now().format("%Y%m%d_%H%M%S"))),
        CollisionChoice::Abort => None,
    }
}

/// Camera starts and stops as the command thread carries them out.
struct CameraDesk {
    recorder: Arc<Recorder>,
    log: LogSink,
}

impl CameraDesk {
    fn run(&self, command: &CameraCommand) -> CommandOutcome {
        let result = match command {
            CameraCommand::Toggle { index, stem, mode } => {
                self.toggle_camera(*index, stem, *mode).map(|toggle| match toggle.saved {
                    Some(path) => CommandOutcome::Stopped(vec![(*index, path)]),
                    None => CommandOutcome::Started,
                })
            }
            CameraCommand::ToggleBoth { stem, mode } => {
                self.toggle_both(stem, *mode).map(|both| {
                    if both.started {
                        CommandOutcome::Started
                    } else {
                        CommandOutcome::Stopped(both.saved)
                    }
                })
            }
        };
        result.unwrap_or_else(|e| CommandOutcome::Failed(Arc::new(e)))
    }

    fn toggle_camera(&self, index: u32, stem: &str, mode: RecordMode) -> PanelResult<Toggle> {
        let toggle = match self.recorder.toggle(index, stem, mode) {
            Ok(toggle) => toggle,
            Err(e) => {
                (self.log)(&format!("camera {} failed to start: {e}", index + 1));
                return Err(e);
            }
        };
        match &toggle.saved {
            Some(path) => (self.log)(&format!("camera {} saved to {}", index + 1, path.display())),
            None => (self.log)(&format!("camera {} recording ({mode})", index + 1)),
        }
        Ok(toggle)
    }

    fn both_state(&self) -> BothState {
        let recording = self.recorder.recording_cameras();
        let cameras = self.recorder.cameras();
        let active = cameras.iter().filter(|i| recording.contains(*i)).count();
        if active == 0 {
            BothState::AllIdle
        } else if active == cameras.len() {
            BothState::AllRecording
        } else {
            BothState::Mixed
        }
    }

    /// Starts every camera when all are idle, stops every camera when all are
    /// recording. A failed start rolls back the cameras already started.
    fn toggle_both(&self, stem: &str, mode: RecordMode) -> PanelResult<BothToggle> {
        let mut cameras = self.recorder.cameras().to_vec();
        cameras.sort_unstable();

        match self.both_state() {
            BothState::Mixed => Err(PanelError::StateMismatch(format!(
                "recording {:?} of {:?}",
                self.recorder.recording_cameras(),
                cameras
            ))),
            BothState::AllRecording => {
                let saved: Vec<(u32, PathBuf)> = cameras
                    .iter()
                    .filter_map(|&index| self.recorder.stop(index).map(|path| (index, path)))
                    .collect();
                for (index, path) in &saved {
                    (self.log)(&format!("camera {} saved to {}", index + 1, path.display()));
                }
                Ok(BothToggle {
                    started: false,
                    saved,
                })
            }
            BothState::AllIdle => {
                let mut started = Vec::new();
                for &index in &cameras {
                    if let Err(e) = self.recorder.start(index, stem, mode) {
                        for &done in started.iter().rev() {
                            if let Some(path) = self.recorder.stop(done) {
                                warn!(camera = done, output = %path.display(), "start rolled back");
                            }
                        }
                        (self.log)(&format!("camera {} failed to start: {e}", index + 1));
                        return Err(e);
                    }
                    started.push(index);
                }
                (self.log)(&format!("all cameras recording ({mode})"));
                Ok(BothToggle {
                    started: true,
                    saved: Vec::new(),
                })
            }
        }
    }
}

pub struct ControlPanel {
    config: PanelConfig,
    recorder: Arc<Recorder>,
    desk: Arc<CameraDesk>,
    commands: CommandDispatcher,
    board: PreviewBoard,
    previews: Mutex<Vec<PreviewWorker>>,
    mcu: MotorController,
    safety: Arc<SafetyMonitor>,
    weight: Arc<Mutex<WeightState>>,
    weight_watch: Mutex<Option<Worker>>,
    log: LogSink,
}

impl ControlPanel {
    /// Real hardware: nokhwa cameras, ffmpeg, the configured serial ports.
    pub fn start(config: PanelConfig, log: LogSink) -> PanelResult<Self> {
        let recorder = Arc::new(Recorder::with_system_devices(config.recorder.clone()));
        let mcu = MotorController::open(&config.mcu, log.clone());
        let scale = WeightReader::new(config.scale.clone());
        Self::with_parts(config, recorder, mcu, Some(Box::new(scale)), log)
    }

    /// Assembles a panel from ready parts and starts its background loops.
    pub fn with_parts(
        config: PanelConfig,
        recorder: Arc<Recorder>,
        mcu: MotorController,
        scale: Option<Box<dyn WeightSource>>,
        log: LogSink,
    ) -> PanelResult<Self> {
        let board = PreviewBoard::new(config.preview.enabled);
        let safety = Arc::new(SafetyMonitor::new(
            Arc::clone(&recorder),
            config.safety.threshold,
        ));
        let weight = Arc::new(Mutex::new(WeightState::default()));

        let desk = Arc::new(CameraDesk {
            recorder: Arc::clone(&recorder),
            log: log.clone(),
        });
        let runner = Arc::clone(&desk);
        let commands = CommandDispatcher::spawn(move |command| runner.run(command))?;

        let mut previews = Vec::new();
        for &index in recorder.cameras() {
            previews.push(PreviewWorker::spawn(
                index,
                Arc::clone(&recorder),
                board.clone(),
                config.preview.clone(),
            )?);
        }

        let weight_watch = match scale {
            Some(source) => {
                let watch = WeightWatch {
                    source,
                    state: Arc::clone(&weight),
                    safety: Arc::clone(&safety),
                    log: log.clone(),
                };
                let interval = Duration::from_millis(config.scale.poll_interval_ms);
                Some(Worker::spawn("weight-watch", move |stop| {
                    let mut watch = watch;
                    while !stop.load(Ordering::Acquire) {
                        watch.tick();
                        sleep_unless_stopped(&stop, interval);
                    }
                })?)
            }
            None => None,
        };

        info!(cameras = ?recorder.cameras(), "control panel ready");
        Ok(Self {
            config,
            recorder,
            desk,
            commands,
            board,
            previews: Mutex::new(previews),
            mcu,
            safety,
            weight,
            weight_watch: Mutex::new(weight_watch),
            log,
        })
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn mcu(&self) -> &MotorController {
        &self.mcu
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    /// Queues a start or stop of one camera.
    pub fn request_toggle_camera(
        &self,
        index: u32,
        stem: &str,
        mode: RecordMode,
    ) -> PanelResult<Ticket> {
        self.commands.submit(CameraCommand::Toggle {
            index,
            stem: stem.to_string(),
            mode,
        })
    }

    /// Queues a start of all cameras or a stop of all cameras. A mixed state
    /// settles as [`PanelError::StateMismatch`].
    pub fn request_toggle_both(&self, stem: &str, mode: RecordMode) -> PanelResult<Ticket> {
        self.commands.submit(CameraCommand::ToggleBoth {
            stem: stem.to_string(),
            mode,
        })
    }

    pub fn command_outcome(&self, ticket: Ticket) -> Option<CommandOutcome> {
        self.commands.outcome(ticket)
    }

    /// Blocks until `ticket` settles; for scripts and tests, not the UI.
    pub fn wait_for_command(&self, ticket: Ticket, timeout: Duration) -> Option<CommandOutcome> {
        self.commands.wait(ticket, timeout)
    }

    pub fn both_state(&self) -> BothState {
        self.desk.both_state()
    }

    pub fn set_preview_enabled(&self, enabled: bool) {
        self.board.set_enabled(enabled);
    }

    pub fn preview_status(&self, index: u32) -> Option<PreviewStatus> {
        self.board.status(index)
    }

    pub fn preview_frame(&self, index: u32) -> Option<SharedFrame> {
        self.board.frame(index)
    }

    pub fn render_preview(&self, index: u32, ratio: f64) -> Option<SharedFrame> {
        self.board.render(index, ratio)
    }

    pub fn weight_display(&self) -> WeightDisplay {
        self.weight.lock().display.clone()
    }

    pub fn last_weight(&self) -> Option<f64> {
        self.weight.lock().last
    }

    /// Stores the last numeric weight beside the recordings of `stem`.
    pub fn save_weight(&self, stem: &str) -> PanelResult<PathBuf> {
        let weight = self
            .last_weight()
            .ok_or_else(|| PanelError::ReadFailure("no weight reading yet".to_string()))?;
        let path = records::save_weight(&self.config.recorder.save_dir, stem, weight)?;
        (self.log)(&format!("weight {weight:.2} saved to {}", path.display()));
        Ok(path)
    }

    /// Adjustments live in `adjustments/` next to the recordings folder.
    pub fn save_adjustment(&self, stem: &str, value: f64) -> PanelResult<PathBuf> {
        let save_dir = &self.config.recorder.save_dir;
        let base = save_dir.parent().unwrap_or_else(|| Path::new("."));
        let path = records::save_adjustment(base, stem, value)?;
        (self.log)(&format!("adjustment {value:.2} saved to {}", path.display()));
        Ok(path)
    }

    /// Stops every loop, every recording and the MCU link. Idempotent.
    pub fn shutdown(&self) {
        self.commands.stop(COMMAND_JOIN);
        if let Some(mut watch) = self.weight_watch.lock().take() {
            watch.stop(WATCH_JOIN);
        }
        for preview in self.previews.lock().drain(..) {
            let index = preview.index();
            if !preview.stop() {
                warn!(camera = index, "preview loop left detached");
            }
        }
        for (index, path) in self.recorder.shutdown() {
            (self.log)(&format!("camera {} saved to {}", index + 1, path.display()));
        }
        self.mcu.close();
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WeightWatch {
    source: Box<dyn WeightSource>,
    state: Arc<Mutex<WeightState>>,
    safety: Arc<SafetyMonitor>,
    log: LogSink,
}

impl WeightWatch {
    fn tick(&mut self) {
        let reading = self.source.read_weight();

        let weight = {
            let mut state = self.state.lock();
            match reading {
                Ok((_, Some(weight))) => {
                    state.display = WeightDisplay::Value(weight);
                    state.last = Some(weight);
                    Some(weight)
                }
                Ok((text, None)) => {
                    state.display = WeightDisplay::Text(text);
                    None
                }
                Err(e) => {
                    state.display = WeightDisplay::Error(e.to_string());
                    None
                }
            }
        };

        let Some(weight) = weight else {
            return;
        };
        for (index, path) in self.safety.check(weight) {
            (self.log)(&format!(
                "weight {weight:.2} below {:.2}: camera {} stopped, saved to {}",
                self.safety.threshold(),
                index + 1,
                path.display()
            ));
        }
    }
}
