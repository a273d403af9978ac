use dcv_color_primitives::{convert_image, ColorSpace, ImageFormat, PixelFormat};
use nokhwa::error::NokhwaError;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::{native_api_backend, Buffer, Camera};
use tracing::{debug, info, warn};

use crate::config::CameraProfile;
use crate::error::{PanelError, PanelResult};
use crate::frame::Frame;

/// What to ask of a device when opening it. Every field is best effort.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpenRequest {
    pub resolution: Option<(u32, u32)>,
    pub fps: Option<f64>,
}

impl OpenRequest {
    /// Recording request: global target settings, overridden per camera.
    pub fn for_recording(
        target_resolution: Option<(u32, u32)>,
        target_fps: f64,
        profile: Option<&CameraProfile>,
    ) -> Self {
        let mut request = OpenRequest {
            resolution: target_resolution,
            fps: (target_fps > 0.0).then_some(target_fps),
        };
        if let Some(profile) = profile {
            if let Some(resolution) = profile.resolution() {
                request.resolution = Some(resolution);
            }
            if let Some(fps) = profile.fps.filter(|fps| *fps > 0.0) {
                request.fps = Some(fps);
            }
        }
        request
    }
}

/// An opened capture device.
pub trait CameraDevice: Send {
    fn read(&mut self) -> PanelResult<Frame>;

    /// The frame rate the driver claims; may be 0 or NaN.
    fn reported_fps(&self) -> f64;

    fn close(&mut self);
}

/// Opens devices by index. Implementations try their preferred backend
/// first and fall back to a generic one.
pub trait CameraBackend: Send + Sync {
    fn open(&self, index: u32, request: &OpenRequest) -> PanelResult<Box<dyn CameraDevice>>;
}

/// Frame rate used for pacing and encoding when the device reports nonsense.
pub fn effective_fps(reported: f64, fallback: f64) -> f64 {
    if reported.is_finite() && reported > 0.0 {
        reported
    } else if fallback.is_finite() && fallback > 0.0 {
        fallback
    } else {
        30.0
    }
}

/// Exclusive handle on one physical camera. Closing is idempotent and also
/// happens on drop.
pub struct CameraHandle {
    index: u32,
    device: Option<Box<dyn CameraDevice>>,
}

impl CameraHandle {
    pub fn open(backend: &dyn CameraBackend, index: u32, request: &OpenRequest) -> PanelResult<Self> {
        let device = backend.open(index, request)?;
        debug!(camera = index, ?request, "camera opened");
        Ok(Self {
            index,
            device: Some(device),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn read(&mut self) -> PanelResult<Frame> {
        match self.device.as_mut() {
            Some(device) => device.read(),
            None => Err(PanelError::ReadFailure(format!(
                "camera {} is closed",
                self.index
            ))),
        }
    }

    pub fn reported_fps(&self) -> f64 {
        self.device
            .as_ref()
            .map(|device| device.reported_fps())
            .unwrap_or(0.0)
    }

    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            debug!(camera = self.index, "camera closed");
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Real devices through nokhwa: native API first, then `ApiBackend::Auto`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    fn try_open(index: u32, backend: ApiBackend) -> Result<Camera, NokhwaError> {
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        Camera::with_backend(CameraIndex::Index(index), format, backend)
    }
}

impl CameraBackend for NokhwaBackend {
    fn open(&self, index: u32, request: &OpenRequest) -> PanelResult<Box<dyn CameraDevice>> {
        let preferred = native_api_backend();

        let opened = match preferred {
            Some(backend) => Self::try_open(index, backend).or_else(|e| {
                warn!(camera = index, ?backend, error = %e, "preferred backend failed, falling back");
                Self::try_open(index, ApiBackend::Auto)
            }),
            None => Self::try_open(index, ApiBackend::Auto),
        };

        let mut camera = opened.map_err(|e| {
            warn!(camera = index, error = %e, "camera open failed");
            PanelError::DeviceUnavailable { index }
        })?;

        // drivers silently clamp or ignore these, so failures are only logged
        if let Some((width, height)) = request.resolution {
            if let Err(e) = camera.set_resolution(Resolution::new(width, height)) {
                debug!(camera = index, width, height, error = %e, "resolution not applied");
            }
        }
        if let Some(fps) = request.fps {
            if let Err(e) = camera.set_frame_rate(fps.round() as u32) {
                debug!(camera = index, fps, error = %e, "frame rate not applied");
            }
        }

        if let Err(e) = camera.open_stream() {
            warn!(camera = index, error = %e, "camera stream did not start");
            return Err(PanelError::DeviceUnavailable { index });
        }

        info!(
            camera = index,
            format = ?camera.camera_format(),
            "camera stream started"
        );

        Ok(Box::new(NokhwaCamera {
            index,
            camera: Some(camera),
        }))
    }
}

struct NokhwaCamera {
    index: u32,
    camera: Option<Camera>,
}

impl CameraDevice for NokhwaCamera {
    fn read(&mut self) -> PanelResult<Frame> {
        let Some(camera) = self.camera.as_mut() else {
            return Err(PanelError::ReadFailure(format!("camera {} is closed", self.index)));
        };
        let buffer = camera
            .frame()
            .map_err(|e| PanelError::ReadFailure(e.to_string()))?;
        decode_frame(buffer)
    }

    fn reported_fps(&self) -> f64 {
        self.camera
            .as_ref()
            .map(|camera| f64::from(camera.frame_rate()))
            .unwrap_or(0.0)
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                debug!(camera = self.index, error = %e, "stop_stream failed");
            }
        }
    }
}

impl Drop for NokhwaCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_frame(buffer: Buffer) -> PanelResult<Frame> {
    let resolution = buffer.resolution();
    let (width, height) = (resolution.width(), resolution.height());
    let mut rgb = vec![0u8; width as usize * height as usize * 3];

    convert_to_rgb(buffer, &mut rgb).map_err(|e| PanelError::ReadFailure(e.to_string()))?;

    Frame::from_raw(width, height, rgb)
        .ok_or_else(|| PanelError::ReadFailure("decoded frame has the wrong size".to_string()))
}

fn convert_to_rgb(frame: Buffer, output: &mut [u8]) -> Result<(), NokhwaError> {
    match frame.source_frame_format() {
        FrameFormat::NV12 => convert_to_rgb_with_dcv(
            frame.buffer(),
            frame.source_frame_format(),
            frame.resolution(),
            output,
        ),
        _ => frame.decode_image_to_buffer::<RgbFormat>(output),
    }
}

// DCV has faster implementations but only works for NV12 to RGB
fn convert_to_rgb_with_dcv(
    buffer: &[u8],
    frame_format: FrameFormat,
    resolution: Resolution,
    output: &mut [u8],
) -> Result<(), NokhwaError> {
    let width = resolution.width();
    let height = resolution.height();
    let dst_size = width as usize * height as usize * 3;

    if output.len() != dst_size {
        return Err(NokhwaError::ProcessFrameError {
            src: frame_format,
            destination: "RGB".to_string(),
            error: format!(
                "Output buffer size mismatch: expected {}, got {}",
                dst_size,
                output.len()
            ),
        });
    }

    let src_format = ImageFormat {
        pixel_format: PixelFormat::Nv12,
        color_space: ColorSpace::Bt601,
        num_planes: 1,
    };
    let dst_format = ImageFormat {
        pixel_format: PixelFormat::Rgb,
        color_space: ColorSpace::Rgb,
        num_planes: 1,
    };

    convert_image(
        width,
        height,
        &src_format,
        None,
        &[buffer],
        &dst_format,
        None,
        &mut [output],
    )
    .map_err(|e| NokhwaError::ProcessFrameError {
        src: frame_format,
        destination: "RGB".to_string(),
        error: format!("Conversion error: {:?}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Roi;

    #[test]
    fn bogus_device_rates_fall_back() {
        assert_eq!(effective_fps(0.0, 25.0), 25.0);
        assert_eq!(effective_fps(f64::NAN, 25.0), 25.0);
        assert_eq!(effective_fps(-1.0, 0.0), 30.0);
        assert_eq!(effective_fps(60.0, 25.0), 60.0);
    }

    #[test]
    fn profile_overrides_target_settings() {
        let profile = CameraProfile {
            width: Some(1920),
            height: Some(1080),
            fps: Some(0.0),
            roi: Some(Roi::new(0, 0, 10, 10)),
            ..Default::default()
        };
        let request = OpenRequest::for_recording(Some((640, 480)), 30.0, Some(&profile));
        assert_eq!(request.resolution, Some((1920, 1080)));
        assert_eq!(request.fps, Some(30.0));

        let plain = OpenRequest::for_recording(None, 0.0, None);
        assert_eq!(plain, OpenRequest::default());
    }
}
