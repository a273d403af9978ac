use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// One decoded RGB24 camera frame.
pub type Frame = RgbImage;

/// Frames are handed between threads behind an `Arc`, so publishing and
/// reading the latest frame never copies pixels under the lock.
pub type SharedFrame = Arc<Frame>;

/// Region of interest as configured: `[x, y, w, h]`, possibly out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 4]", into = "[i64; 4]")]
pub struct Roi {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

/// A crop rectangle that is guaranteed to lie inside its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: i64, y: i64, w: i64, h: i64) -> Self {
        Self { x, y, w, h }
    }

    /// Clamps the region into a `width`×`height` frame. Returns `None` when
    /// nothing is left to crop (an all-zero ROI means "no crop").
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<CropRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let (fw, fh) = (i64::from(width), i64::from(height));

        let x = self.x.clamp(0, fw - 1);
        let y = self.y.clamp(0, fh - 1);
        let w = self.w.clamp(0, fw - x);
        let h = self.h.clamp(0, fh - y);

        if w == 0 || h == 0 {
            return None;
        }

        Some(CropRect {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
        })
    }
}

impl From<[i64; 4]> for Roi {
    fn from([x, y, w, h]: [i64; 4]) -> Self {
        Roi { x, y, w, h }
    }
}

impl From<Roi> for [i64; 4] {
    fn from(roi: Roi) -> Self {
        [roi.x, roi.y, roi.w, roi.h]
    }
}

/// Applies an optional ROI. Frames without a usable ROI pass through untouched.
pub fn apply_roi(frame: Frame, roi: Option<&Roi>) -> Frame {
    let Some(rect) = roi.and_then(|r| r.clamp_to(frame.width(), frame.height())) else {
        return frame;
    };
    if rect.width == frame.width() && rect.height == frame.height() {
        return frame;
    }
    imageops::crop_imm(&frame, rect.x, rect.y, rect.width, rect.height).to_image()
}

/// Downscales `frame` to fit inside `max_width`×`max_height`, keeping aspect
/// ratio. Frames that already fit are returned as-is.
pub fn fit_within(frame: &SharedFrame, max_width: u32, max_height: u32) -> SharedFrame {
    let (w, h) = frame.dimensions();
    if max_width == 0 || max_height == 0 || (w <= max_width && h <= max_height) {
        return Arc::clone(frame);
    }

    let ratio = f64::min(
        f64::from(max_width) / f64::from(w),
        f64::from(max_height) / f64::from(h),
    );
    let (nw, nh) = scaled_dimensions(w, h, ratio);
    Arc::new(imageops::resize(&**frame, nw, nh, FilterType::Triangle))
}

/// Rescales a published frame for display by a user-selected ratio.
pub fn render_scaled(frame: &SharedFrame, ratio: f64) -> SharedFrame {
    let ratio = if ratio.is_finite() { ratio.clamp(0.05, 4.0) } else { 1.0 };
    if (ratio - 1.0).abs() < f64::EPSILON {
        return Arc::clone(frame);
    }
    let (w, h) = scaled_dimensions(frame.width(), frame.height(), ratio);
    Arc::new(imageops::resize(&**frame, w, h, FilterType::Triangle))
}

fn scaled_dimensions(width: u32, height: u32, ratio: f64) -> (u32, u32) {
    let w = (f64::from(width) * ratio).round().max(1.0) as u32;
    let h = (f64::from(height) * ratio).round().max(1.0) as u32;
    (w, h)
}
