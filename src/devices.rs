use std::collections::HashSet;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::{native_api_backend, query, Camera};
use tracing::debug;

use crate::error::{PanelError, PanelResult};

#[derive(Debug, PartialEq, Eq, Clone, Hash, Ord, PartialOrd)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub frame_rate: u32,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VideoDevice {
    pub index: CameraIndex,
    pub unique_id: String,
    pub model_id: String,
    pub name: String,
    pub formats: Vec<VideoFormat>,
}

/// Lists attached cameras with the formats each one supports. Devices that
/// refuse to open for probing are skipped.
pub fn list_cameras() -> PanelResult<Vec<VideoDevice>> {
    let backend = native_api_backend()
        .ok_or_else(|| PanelError::Config("no native camera backend".to_string()))?;

    let devices = query(backend).map_err(|e| PanelError::Config(e.to_string()))?;

    let mut result = Vec::with_capacity(devices.len());
    for device in devices {
        let index = device.index().clone();
        let requested_format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);

        let mut camera = match Camera::with_backend(index.clone(), requested_format, backend) {
            Ok(cam) => cam,
            Err(e) => {
                debug!(device = %index, error = %e, "skipping camera that did not open");
                continue;
            }
        };

        let camera_formats = match camera.compatible_camera_formats() {
            Ok(f) => f,
            Err(e) => {
                debug!(device = %index, error = %e, "skipping camera without formats");
                continue;
            }
        };

        let unique: HashSet<VideoFormat> = camera_formats
            .into_iter()
            .map(|format| VideoFormat {
                width: format.resolution().width(),
                height: format.resolution().height(),
                format: format.format(),
                frame_rate: format.frame_rate(),
            })
            .collect();

        let mut formats: Vec<VideoFormat> = unique.into_iter().collect();
        formats.sort();

        let model_id = device.description().to_string();
        let unique_id = if device.misc().is_empty() {
            device.description().to_string()
        } else {
            device.misc().to_string()
        };

        result.push(VideoDevice {
            index,
            model_id,
            unique_id,
            name: device.human_name(),
            formats,
        });
    }

    Ok(result)
}
