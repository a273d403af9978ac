use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PanelError, PanelResult};
use crate::frame::Roi;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub recorder: RecorderConfig,
    pub preview: PreviewConfig,
    pub mcu: McuConfig,
    pub scale: ScaleConfig,
    pub safety: SafetyConfig,
}

impl PanelConfig {
    pub fn load(path: impl AsRef<Path>) -> PanelResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub save_dir: PathBuf,
    pub cameras: Vec<u32>,
    /// Used when a device reports 0 or NaN as its frame rate.
    pub default_fps: f64,
    pub target_resolution: Option<(u32, u32)>,
    pub video_extension: String,
    pub video_codec: String,
    pub ffmpeg_program: String,
    pub image_extension: String,
    pub extract_interval: u64,
    pub handoff_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub read_retry_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("videos"),
            cameras: vec![0, 1],
            default_fps: 30.0,
            target_resolution: None,
            video_extension: "mp4".to_string(),
            // MPEG-4 part 2, the "mp4v" fourcc
            video_codec: "mpeg4".to_string(),
            ffmpeg_program: "ffmpeg".to_string(),
            image_extension: "jpg".to_string(),
            extract_interval: 150,
            handoff_grace_ms: 300,
            stop_timeout_ms: 3000,
            read_retry_ms: 5,
            profile_path: None,
        }
    }
}

impl RecorderConfig {
    pub fn handoff_grace(&self) -> Duration {
        Duration::from_millis(self.handoff_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub interval_ms: u64,
    pub reopen_backoff_ms: u64,
    pub max_read_failures: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 320,
            height: 240,
            interval_ms: 100,
            reopen_backoff_ms: 1000,
            max_read_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McuConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub line_ending: String,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 2000,
            line_ending: "\r\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub line_ending: String,
    pub request_command: Option<String>,
    /// Answer every poll with a canned reading instead of touching the port.
    pub simulate: bool,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout_ms: 2000,
            poll_timeout_ms: 3000,
            poll_interval_ms: 1000,
            line_ending: "\r\n".to_string(),
            request_command: None,
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub threshold: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { threshold: -150.0 }
    }
}

/// Per-camera overrides applied once when a device is opened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_index: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub roi: Option<Roi>,
}

impl CameraProfile {
    pub fn resolution(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileFile {
    Keyed(HashMap<String, CameraProfile>),
    List(Vec<CameraProfile>),
    Single(CameraProfile),
}

#[derive(Debug, Clone, Default)]
pub struct CameraProfiles {
    by_index: HashMap<u32, CameraProfile>,
}

impl CameraProfiles {
    pub fn load(path: impl AsRef<Path>) -> PanelResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> PanelResult<Self> {
        let file: ProfileFile = serde_json::from_str(text)?;
        let mut by_index = HashMap::new();

        match file {
            ProfileFile::Single(profile) => {
                let index = profile.camera_index.ok_or_else(|| {
                    PanelError::Config("camera profile has no camera_index".to_string())
                })?;
                by_index.insert(index, profile);
            }
            ProfileFile::List(profiles) => {
                for profile in profiles {
                    by_index.insert(profile.camera_index.unwrap_or(0), profile);
                }
            }
            ProfileFile::Keyed(map) => {
                for (key, profile) in map {
                    let index = key.trim().parse::<u32>().map_err(|_| {
                        PanelError::Config(format!("camera profile key {key:?} is not an index"))
                    })?;
                    by_index.insert(index, profile);
                }
            }
        }

        Ok(Self { by_index })
    }

    pub fn insert(&mut self, index: u32, profile: CameraProfile) {
        self.by_index.insert(index, profile);
    }

    pub fn get(&self, index: u32) -> Option<&CameraProfile> {
        self.by_index.get(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: PanelConfig =
            serde_json::from_str(r#"{"recorder": {"save_dir": "/tmp/out"}, "safety": {}}"#)
                .unwrap();
        assert_eq!(config.recorder.save_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.recorder.extract_interval, 150);
        assert_eq!(config.recorder.cameras, vec![0, 1]);
        assert_eq!(config.safety.threshold, -150.0);
        assert_eq!(config.scale.baud_rate, 9600);
    }

    #[test]
    fn profiles_keyed_by_index() {
        let profiles = CameraProfiles::parse(
            r#"{"0": {"width": 1280, "height": 720, "fps": 60, "roi": [10, 20, 300, 200]},
                "1": {"fps": 30}}"#,
        )
        .unwrap();
        let first = profiles.get(0).unwrap();
        assert_eq!(first.resolution(), Some((1280, 720)));
        assert_eq!(first.fps, Some(60.0));
        assert_eq!(first.roi, Some(Roi::new(10, 20, 300, 200)));
        assert_eq!(profiles.get(1).unwrap().resolution(), None);
        assert!(profiles.get(2).is_none());
    }

    #[test]
    fn profiles_from_tuning_tool_output() {
        // tuning tool writes one object per camera with extra knobs
        let single = CameraProfiles::parse(
            r#"{"camera_index": 1, "width": 640, "height": 480, "fps": 30,
                "roi": [0, 0, 0, 0], "gain": 12, "auto_wb": 1}"#,
        )
        .unwrap();
        assert_eq!(single.get(1).unwrap().resolution(), Some((640, 480)));

        let list = CameraProfiles::parse(
            r#"[{"camera_index": 0, "fps": 25}, {"camera_index": 1, "fps": 50}]"#,
        )
        .unwrap();
        assert_eq!(list.get(0).unwrap().fps, Some(25.0));
        assert_eq!(list.get(1).unwrap().fps, Some(50.0));
    }

    #[test]
    fn bad_profile_key_is_rejected() {
        let err = CameraProfiles::parse(r#"{"left": {"fps": 30}}"#).unwrap_err();
        assert!(matches!(err, PanelError::Config(_)));
    }
}
