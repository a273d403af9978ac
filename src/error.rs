use std::io;

/// Everything that can go wrong in the panel.
///
/// Only errors raised at session-start boundaries (and by the serial
/// collaborators) ever reach a caller; per-iteration failures inside a
/// running capture or preview loop are absorbed and retried.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("camera {index} could not be opened on any backend")]
    DeviceUnavailable { index: u32 },

    #[error("camera {index} opened but produced no frame")]
    NoFrame { index: u32 },

    #[error("frame read failed: {0}")]
    ReadFailure(String),

    #[error("camera {index} is already recording")]
    AlreadyRecording { index: u32 },

    #[error("encoder could not be opened: {0}")]
    EncoderOpenFailure(String),

    #[error("timed out waiting for serial data")]
    Timeout,

    #[error("serial error: {0}")]
    Serial(String),

    #[error("cameras are not in the same state: {0}")]
    StateMismatch(String),

    #[error("panel is shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type PanelResult<T> = Result<T, PanelError>;

impl From<serialport::Error> for PanelError {
    fn from(e: serialport::Error) -> Self {
        PanelError::Serial(e.to_string())
    }
}

impl From<image::ImageError> for PanelError {
    fn from(e: image::ImageError) -> Self {
        PanelError::Image(e.to_string())
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(e: serde_json::Error) -> Self {
        PanelError::Config(e.to_string())
    }
}
