use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, warn};

use crate::error::{PanelError, PanelResult};
use crate::frame::Frame;

/// Receives frames of a fixed size for one recording.
pub trait VideoSink: Send {
    fn append(&mut self, frame: &Frame) -> PanelResult<()>;

    /// Flushes and closes the output. Called at most once.
    fn finish(&mut self) -> PanelResult<()>;
}

pub trait EncoderFactory: Send + Sync {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> PanelResult<Box<dyn VideoSink>>;
}

/// Encodes through an `ffmpeg` child fed raw RGB24 on stdin.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    pub program: String,
    pub codec: String,
}

impl FfmpegEncoderFactory {
    pub fn new(program: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            codec: codec.into(),
        }
    }

    fn args(&self, path: &Path, width: u32, height: u32, fps: f64) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            format!("{width}x{height}"),
            "-r".to_string(),
            format!("{fps:.3}"),
            "-i".to_string(),
            "-".to_string(),
            "-an".to_string(),
            "-c:v".to_string(),
            self.codec.clone(),
            "-q:v".to_string(),
            "5".to_string(),
            path.to_string_lossy().into_owned(),
        ]
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f64) -> PanelResult<Box<dyn VideoSink>> {
        if width == 0 || height == 0 {
            return Err(PanelError::EncoderOpenFailure(format!(
                "invalid frame size {width}x{height}"
            )));
        }

        let mut child = Command::new(&self.program)
            .args(self.args(path, width, height, fps))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PanelError::EncoderOpenFailure(format!("{}: {e}", self.program)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PanelError::EncoderOpenFailure("encoder stdin unavailable".to_string())
        })?;

        debug!(path = %path.display(), width, height, fps, codec = %self.codec, "encoder started");

        Ok(Box::new(FfmpegSink {
            path: path.to_path_buf(),
            width,
            height,
            stdin: Some(stdin),
            child: Some(child),
        }))
    }
}

struct FfmpegSink {
    path: PathBuf,
    width: u32,
    height: u32,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
}

impl VideoSink for FfmpegSink {
    fn append(&mut self, frame: &Frame) -> PanelResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PanelError::Image(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(PanelError::EncoderOpenFailure("encoder already finished".to_string()));
        };
        stdin.write_all(frame.as_raw())?;
        Ok(())
    }

    fn finish(&mut self) -> PanelResult<()> {
        // closing stdin is ffmpeg's end-of-stream
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                warn!(path = %self.path.display(), %status, "encoder exited with failure");
            }
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "encoder teardown failed");
        }
    }
}
