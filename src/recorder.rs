use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::camera::{CameraBackend, NokhwaBackend, OpenRequest};
use crate::capture::{CaptureEnv, CaptureState, CaptureWorker, RecordMode};
use crate::config::{CameraProfile, CameraProfiles, RecorderConfig};
use crate::encoder::{EncoderFactory, FfmpegEncoderFactory};
use crate::error::{PanelError, PanelResult};
use crate::frame::SharedFrame;
use crate::slots::{FrameSlots, PauseFlags};

/// Outcome of [`Recorder::toggle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggle {
    pub started: bool,
    pub saved: Option<PathBuf>,
}

#[derive(Default)]
struct CameraLane {
    // held for the whole of a start or stop, so toggles on one camera are
    // strictly serialized
    session: Mutex<Option<CaptureWorker>>,
    state: Mutex<CaptureState>,
}

/// Dual-camera coordinator. Owns at most one [`CaptureWorker`] per camera.
///
/// Name collisions are the caller's business: the recorder writes to
/// `<stem>_<label>` whether or not something is already there.
pub struct Recorder {
    env: CaptureEnv,
    profiles: RwLock<CameraProfiles>,
    lanes: Mutex<HashMap<u32, Arc<CameraLane>>>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        backend: Arc<dyn CameraBackend>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Self {
        let profiles = match config.profile_path.as_deref() {
            Some(path) => CameraProfiles::load(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "camera profiles not loaded");
                CameraProfiles::default()
            }),
            None => CameraProfiles::default(),
        };

        Self {
            env: CaptureEnv {
                config,
                backend,
                encoders,
                latest: FrameSlots::new(),
                pause: PauseFlags::new(),
            },
            profiles: RwLock::new(profiles),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Real cameras through nokhwa, video through ffmpeg.
    pub fn with_system_devices(config: RecorderConfig) -> Self {
        let encoders = FfmpegEncoderFactory::new(&config.ffmpeg_program, &config.video_codec);
        Self::new(config, Arc::new(NokhwaBackend), Arc::new(encoders))
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.env.config
    }

    pub fn cameras(&self) -> &[u32] {
        &self.env.config.cameras
    }

    pub(crate) fn backend(&self) -> Arc<dyn CameraBackend> {
        Arc::clone(&self.env.backend)
    }

    pub fn set_profile(&self, index: u32, profile: CameraProfile) {
        self.profiles.write().insert(index, profile);
    }

    /// Lane for a start; created on first use.
    fn lane(&self, index: u32) -> Arc<CameraLane> {
        Arc::clone(self.lanes.lock().entry(index).or_default())
    }

    /// Lane for reads and stops; a camera never started has none.
    fn existing_lane(&self, index: u32) -> Option<Arc<CameraLane>> {
        self.lanes.lock().get(&index).cloned()
    }

    pub fn state(&self, index: u32) -> CaptureState {
        self.existing_lane(index)
            .map_or(CaptureState::Idle, |lane| *lane.state.lock())
    }

    pub fn is_recording(&self, index: u32) -> bool {
        self.state(index) == CaptureState::Capturing
    }

    /// Cameras currently recording, in index order.
    pub fn recording_cameras(&self) -> Vec<u32> {
        let lanes: Vec<(u32, Arc<CameraLane>)> = self
            .lanes
            .lock()
            .iter()
            .map(|(index, lane)| (*index, Arc::clone(lane)))
            .collect();

        let mut recording: Vec<u32> = lanes
            .into_iter()
            .filter(|(_, lane)| *lane.state.lock() == CaptureState::Capturing)
            .map(|(index, _)| index)
            .collect();
        recording.sort_unstable();
        recording
    }

    pub fn start(&self, index: u32, stem: &str, mode: RecordMode) -> PanelResult<()> {
        let lane = self.lane(index);
        let mut session = lane.session.lock();
        if session.is_some() {
            return Err(PanelError::AlreadyRecording { index });
        }
        *session = Some(self.start_locked(&lane, index, stem, mode)?);
        Ok(())
    }

    /// Stops `index` and returns where its output went. Idle cameras are a
    /// no-op.
    pub fn stop(&self, index: u32) -> Option<PathBuf> {
        let lane = self.existing_lane(index)?;
        let mut session = lane.session.lock();
        session.take().map(|worker| Self::stop_locked(&lane, worker))
    }

    /// Starts an idle camera or stops a recording one.
    pub fn toggle(&self, index: u32, stem: &str, mode: RecordMode) -> PanelResult<Toggle> {
        let lane = self.lane(index);
        let mut session = lane.session.lock();

        if let Some(worker) = session.take() {
            let saved = Self::stop_locked(&lane, worker);
            return Ok(Toggle {
                started: false,
                saved: Some(saved),
            });
        }

        *session = Some(self.start_locked(&lane, index, stem, mode)?);
        Ok(Toggle {
            started: true,
            saved: None,
        })
    }

    fn start_locked(
        &self,
        lane: &CameraLane,
        index: u32,
        stem: &str,
        mode: RecordMode,
    ) -> PanelResult<CaptureWorker> {
        *lane.state.lock() = CaptureState::Opening;

        let profile = self.profiles.read().get(index).cloned();
        let config = &self.env.config;
        let request =
            OpenRequest::for_recording(config.target_resolution, config.default_fps, profile.as_ref());
        let roi = profile.and_then(|p| p.roi);

        match CaptureWorker::start(&self.env, index, mode, stem, &request, roi) {
            Ok(worker) => {
                *lane.state.lock() = CaptureState::Capturing;
                Ok(worker)
            }
            Err(e) => {
                *lane.state.lock() = CaptureState::Idle;
                warn!(camera = index, error = %e, "recording did not start");
                Err(e)
            }
        }
    }

    fn stop_locked(lane: &CameraLane, worker: CaptureWorker) -> PathBuf {
        *lane.state.lock() = CaptureState::Stopping;
        let saved = worker.stop();
        *lane.state.lock() = CaptureState::Idle;
        saved
    }

    /// Most recent frame of an active recording.
    pub fn latest_frame(&self, index: u32) -> Option<SharedFrame> {
        self.env.latest.latest(index)
    }

    pub fn is_preview_paused(&self, index: u32) -> bool {
        self.env.pause.is_paused(index)
    }

    /// Keeps the preview loop off the device until [`Self::resume_preview`].
    pub fn pause_preview(&self, index: u32) {
        self.env.pause.pause(index);
    }

    pub fn resume_preview(&self, index: u32) {
        self.env.pause.resume(index);
    }

    /// Stops every active session. Used on shutdown and on drop.
    pub fn shutdown(&self) -> Vec<(u32, PathBuf)> {
        let indices: Vec<u32> = {
            let mut indices: Vec<u32> = self.lanes.lock().keys().copied().collect();
            indices.sort_unstable();
            indices
        };

        let stopped: Vec<(u32, PathBuf)> = indices
            .into_iter()
            .filter_map(|index| self.stop(index).map(|path| (index, path)))
            .collect();

        if !stopped.is_empty() {
            info!(count = stopped.len(), "recordings stopped on shutdown");
        }
        stopped
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Roi;
    use crate::testing::{quick_config, wait_until, FakeBackend, FakeSpec, MemoryEncoders};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn recorder(dir: &Path, backend: &FakeBackend, encoders: &MemoryEncoders) -> Recorder {
        Recorder::new(
            quick_config(dir),
            Arc::new(backend.clone()),
            Arc::new(encoders.clone()),
        )
    }

    fn two_cameras() -> FakeBackend {
        FakeBackend::new()
            .with_camera(0, FakeSpec::default())
            .with_camera(1, FakeSpec::default())
    }

    #[test]
    fn toggle_alternates_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        assert!(!recorder.is_recording(0));
        let first = recorder.toggle(0, "run", RecordMode::Video).unwrap();
        assert_eq!(first, Toggle { started: true, saved: None });
        assert!(recorder.is_recording(0));
        assert!(!recorder.is_recording(1));
        assert_eq!(backend.held(0), 1);

        let expected = dir.path().join("run_1.mp4");
        assert!(wait_until(Duration::from_secs(2), || encoders.appended(&expected) > 3));
        assert!(recorder.latest_frame(0).is_some());

        let second = recorder.toggle(0, "ignored", RecordMode::Video).unwrap();
        assert_eq!(second, Toggle { started: false, saved: Some(expected.clone()) });
        assert!(!recorder.is_recording(0));
        assert_eq!(backend.held(0), 0);
        assert_eq!(encoders.finished(&expected), 1);
        assert!(recorder.latest_frame(0).is_none());
        assert!(!recorder.is_preview_paused(0));
    }

    #[test]
    fn one_session_per_camera() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        recorder.start(1, "a", RecordMode::Video).unwrap();
        let err = recorder.start(1, "b", RecordMode::Video).unwrap_err();
        assert!(matches!(err, PanelError::AlreadyRecording { index: 1 }));
        assert_eq!(backend.max_held(1), 1);
        assert_eq!(encoders.opened().len(), 1);

        assert_eq!(recorder.stop(1), Some(dir.path().join("a_2.mp4")));
        assert_eq!(recorder.stop(1), None);
    }

    #[test]
    fn stopping_idle_camera_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        assert_eq!(recorder.stop(0), None);
        assert_eq!(recorder.state(0), CaptureState::Idle);
        assert!(recorder.recording_cameras().is_empty());
    }

    #[test]
    fn queries_leave_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        for index in 0..64 {
            assert!(!recorder.is_recording(index));
            assert_eq!(recorder.stop(index), None);
        }
        assert!(recorder.lanes.lock().is_empty());

        recorder.start(1, "one", RecordMode::Video).unwrap();
        assert!(recorder.is_recording(1));
        assert_eq!(recorder.lanes.lock().len(), 1);
        assert_eq!(recorder.shutdown(), vec![(1, dir.path().join("one_2.mp4"))]);
    }

    #[test]
    fn stuck_read_does_not_outlast_the_stop_bound() {
        let dir = tempfile::tempdir().unwrap();
        // sizing read, two streamed frames, then a read that hangs
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                stall_on_read: Some(4),
                stall_for: Duration::from_millis(1500),
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let mut config = quick_config(dir.path());
        config.stop_timeout_ms = 200;
        let recorder = Recorder::new(config, Arc::new(backend.clone()), Arc::new(encoders.clone()));

        recorder.start(0, "stuck", RecordMode::Video).unwrap();
        assert!(wait_until(Duration::from_secs(2), || backend.stalls(0) == 1));
        let path = dir.path().join("stuck_1.mp4");
        let appended = encoders.appended(&path);

        let started = Instant::now();
        assert_eq!(recorder.stop(0), Some(path.clone()));
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(encoders.finished(&path), 1);
        assert!(!recorder.is_recording(0));
        assert!(recorder.latest_frame(0).is_none());
        // the loop still holds the device, so preview stays away from it
        assert_eq!(backend.held(0), 1);
        assert!(recorder.is_preview_paused(0));

        assert!(wait_until(Duration::from_secs(3), || backend.held(0) == 0));
        assert!(wait_until(Duration::from_secs(1), || !recorder.is_preview_paused(0)));
        assert!(recorder.latest_frame(0).is_none());
        assert_eq!(encoders.appended(&path), appended);
        assert_eq!(backend.max_held(0), 1);
    }

    #[test]
    fn unavailable_device_fails_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                fail_open: true,
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        let err = recorder.toggle(0, "run", RecordMode::Video).unwrap_err();
        assert!(matches!(err, PanelError::DeviceUnavailable { index: 0 }));
        assert!(!recorder.is_recording(0));
        assert!(!recorder.is_preview_paused(0));
        assert!(encoders.opened().is_empty());
    }

    #[test]
    fn silent_device_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                fail_first_read: true,
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        let err = recorder.start(0, "run", RecordMode::Video).unwrap_err();
        assert!(matches!(err, PanelError::NoFrame { index: 0 }));
        assert_eq!(backend.max_held(0), 1);
        assert_eq!(backend.held(0), 0);
        assert!(!recorder.is_recording(0));
    }

    #[test]
    fn encoder_failure_releases_device() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::refusing();
        let recorder = recorder(dir.path(), &backend, &encoders);

        let err = recorder.start(0, "run", RecordMode::Video).unwrap_err();
        assert!(matches!(err, PanelError::EncoderOpenFailure(_)));
        assert_eq!(backend.held(0), 0);
        assert!(!recorder.is_recording(0));
        assert!(!recorder.is_preview_paused(0));
    }

    #[test]
    fn extraction_saves_every_150th_frame() {
        let dir = tempfile::tempdir().unwrap();
        // probe frame plus 450 streamed frames
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                frames: Some(451),
                fps: 2000.0,
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        recorder.start(0, "cut", RecordMode::FrameExtraction).unwrap();
        assert!(wait_until(Duration::from_secs(10), || backend.exhausted_reads(0) > 0));
        let saved = recorder.stop(0).unwrap();

        assert_eq!(saved, dir.path().join("cut_1"));
        let mut names: Vec<String> = std::fs::read_dir(&saved)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["frame_0000.jpg", "frame_0001.jpg", "frame_0002.jpg"]);
        assert!(encoders.opened().is_empty());
    }

    #[test]
    fn restarted_extraction_numbers_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                frames: Some(151),
                fps: 2000.0,
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        for stem in ["first", "second"] {
            recorder.start(0, stem, RecordMode::FrameExtraction).unwrap();
            let before = backend.exhausted_reads(0);
            assert!(wait_until(Duration::from_secs(10), || backend.exhausted_reads(0) > before));
            let saved = recorder.stop(0).unwrap();
            assert!(saved.join("frame_0000.jpg").exists());
            assert!(!saved.join("frame_0001.jpg").exists());
        }
    }

    #[test]
    fn encoder_is_sized_to_the_cropped_frame() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_camera(
            0,
            FakeSpec {
                width: 640,
                height: 480,
                fps: 0.0,
                ..FakeSpec::default()
            },
        );
        let encoders = MemoryEncoders::new();
        let mut config = quick_config(dir.path());
        config.default_fps = 25.0;
        let recorder = Recorder::new(config, Arc::new(backend.clone()), Arc::new(encoders.clone()));
        recorder.set_profile(
            0,
            CameraProfile {
                roi: Some(Roi::new(-5, 0, 10_000, 100)),
                ..CameraProfile::default()
            },
        );

        recorder.start(0, "roi", RecordMode::Video).unwrap();
        let opened = encoders.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!((opened[0].width, opened[0].height), (640, 100));
        assert_eq!(opened[0].fps, 25.0);

        assert!(wait_until(Duration::from_secs(2), || recorder.latest_frame(0).is_some()));
        assert_eq!(recorder.latest_frame(0).unwrap().dimensions(), (640, 100));
        let path = recorder.stop(0).unwrap();
        assert!(encoders.appended(&path) > 0);
    }

    #[test]
    fn profile_resolution_reaches_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let profile_path = dir.path().join("cams.json");
        std::fs::write(&profile_path, r#"{"1": {"width": 800, "height": 600, "fps": 15}}"#).unwrap();

        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let mut config = quick_config(dir.path());
        config.profile_path = Some(profile_path);
        let recorder = Recorder::new(config, Arc::new(backend.clone()), Arc::new(encoders.clone()));

        recorder.start(1, "p", RecordMode::Video).unwrap();
        let (index, request) = backend.opens()[0];
        assert_eq!(index, 1);
        assert_eq!(request.resolution, Some((800, 600)));
        assert_eq!(request.fps, Some(15.0));
        recorder.stop(1);
    }

    #[test]
    fn shutdown_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let backend = two_cameras();
        let encoders = MemoryEncoders::new();
        let recorder = recorder(dir.path(), &backend, &encoders);

        recorder.start(0, "s", RecordMode::Video).unwrap();
        recorder.start(1, "s", RecordMode::FrameExtraction).unwrap();
        assert_eq!(recorder.recording_cameras(), vec![0, 1]);

        let stopped = recorder.shutdown();
        assert_eq!(
            stopped,
            vec![(0, dir.path().join("s_1.mp4")), (1, dir.path().join("s_2"))]
        );
        assert_eq!(backend.held(0) + backend.held(1), 0);
        assert!(recorder.recording_cameras().is_empty());
    }
}
