pub mod camera;
pub mod capture;
pub mod commands;
pub mod config;
pub mod devices;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod logging;
pub mod mcu;
pub mod panel;
pub mod preview;
pub mod recorder;
pub mod records;
pub mod safety;
pub mod scale;
pub mod slots;
pub mod worker;

#[cfg(test)]
mod testing;

use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{error, info, warn};

pub use crate::capture::RecordMode;
pub use crate::commands::{CommandOutcome, Ticket};
pub use crate::config::PanelConfig;
pub use crate::error::{PanelError, PanelResult};
pub use crate::panel::ControlPanel;
pub use crate::recorder::Recorder;

use crate::devices::{list_cameras, VideoDevice};
use crate::mcu::{Direction, Motor};

// The panel exposed as a small C library for a non-Rust UI shell.

static RESULT_OK: i32 = 0;
static RESULT_STARTED: i32 = 1;
static RESULT_PENDING: i32 = 2;
static RESULT_YES: i32 = RESULT_OK;
static RESULT_NO: i32 = -256;

static STATUS_LIVE: i32 = 0;

static ERROR_DEVICE_UNAVAILABLE: i32 = -1;
static ERROR_NO_FRAME: i32 = -2;
static ERROR_ALREADY_RECORDING: i32 = -3;
static ERROR_ENCODER_OPEN: i32 = -4;
static ERROR_STATE_MISMATCH: i32 = -5;
static ERROR_STATE_NOT_INITIALIZED: i32 = -6;
static ERROR_INVALID_ARGUMENT: i32 = -7;
static ERROR_NO_PREVIEW_FRAME: i32 = -8;
static ERROR_SERIAL: i32 = -9;
static ERROR_TIMEOUT: i32 = -10;
static ERROR_BUFFER_NULL: i32 = -11;
static ERROR_BUFFER_NOT_ENOUGH_CAPACITY: i32 = -12;
static ERROR_IO: i32 = -13;
static ERROR_CONFIG: i32 = -14;
static ERROR_NO_WEIGHT: i32 = -15;
static ERROR_SHUTTING_DOWN: i32 = -16;
static ERROR_UNKNOWN_TICKET: i32 = -17;
static ERROR_UNKNOWN: i32 = -512;

fn error_code(e: &PanelError) -> i32 {
    match e {
        PanelError::DeviceUnavailable { .. } => ERROR_DEVICE_UNAVAILABLE,
        PanelError::NoFrame { .. } | PanelError::ReadFailure(_) => ERROR_NO_FRAME,
        PanelError::AlreadyRecording { .. } => ERROR_ALREADY_RECORDING,
        PanelError::EncoderOpenFailure(_) => ERROR_ENCODER_OPEN,
        PanelError::StateMismatch(_) => ERROR_STATE_MISMATCH,
        PanelError::Serial(_) => ERROR_SERIAL,
        PanelError::Timeout => ERROR_TIMEOUT,
        PanelError::ShuttingDown => ERROR_SHUTTING_DOWN,
        PanelError::Config(_) => ERROR_CONFIG,
        PanelError::Io(_) => ERROR_IO,
        PanelError::Image(_) => ERROR_UNKNOWN,
    }
}

#[derive(Clone)]
struct State {
    pub panel: Arc<ControlPanel>,
    pub devices: Vec<VideoDevice>,
}

impl State {
    pub fn current() -> Option<State> {
        STATE.lock().clone()
    }

    pub fn make_current(self) {
        *STATE.lock() = Some(self);
    }

    pub fn take() -> Option<State> {
        STATE.lock().take()
    }
}

static STATE: LazyLock<Mutex<Option<State>>> = LazyLock::new(Default::default);

/// Starts the panel from a JSON config file, or from built-in defaults when
/// `config_path` is null. A running panel is shut down first.
#[no_mangle]
pub extern "C" fn panel_initialize(config_path: *const c_char) -> i32 {
    logging::init();

    let config = if config_path.is_null() {
        PanelConfig::default()
    } else {
        let Some(path) = (unsafe { read_str(config_path) }) else { return ERROR_INVALID_ARGUMENT };
        match PanelConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path, error = %e, "config not loaded");
                return error_code(&e);
            }
        }
    };

    if let Some(previous) = State::take() {
        previous.panel.shutdown();
    }

    let devices = list_cameras().unwrap_or_else(|e| {
        warn!(error = %e, "camera enumeration failed");
        Vec::new()
    });

    match ControlPanel::start(config, logging::tracing_sink()) {
        Ok(panel) => {
            info!(devices = devices.len(), "panel initialized");
            State {
                panel: Arc::new(panel),
                devices,
            }
            .make_current();
            RESULT_OK
        }
        Err(e) => {
            error!(error = %e, "panel did not start");
            error_code(&e)
        }
    }
}

/// Stops every recording, preview and serial link.
#[no_mangle]
pub extern "C" fn panel_shutdown() -> i32 {
    let Some(state) = State::take() else { return ERROR_STATE_NOT_INITIALIZED };
    state.panel.shutdown();
    RESULT_OK
}

#[no_mangle]
pub extern "C" fn panel_devices_count() -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    state.devices.len() as i32
}

#[no_mangle]
pub extern "C" fn panel_device_name(device_index: i32, buf: *mut c_char, buf_len: usize) -> usize {
    let Some(state) = State::current() else { return 0 };

    if device_index < 0 || (device_index as usize) >= state.devices.len() {
        return 0;
    }
    if buf.is_null() {
        return 0;
    }

    unsafe { copy_str(&state.devices[device_index as usize].name, buf, buf_len) }
}

#[no_mangle]
pub extern "C" fn panel_is_recording(camera: u32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    if state.panel.recorder().is_recording(camera) { RESULT_YES } else { RESULT_NO }
}

/// Queues a start or stop of one camera and returns `RESULT_PENDING` at
/// once, writing the ticket to poll with [`panel_command_result`] into
/// `ticket_out` when given.
#[no_mangle]
pub extern "C" fn panel_toggle_camera(
    camera: u32,
    stem: *const c_char,
    mode: *const c_char,
    ticket_out: *mut u64,
) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(stem) = (unsafe { read_str(stem) }) else { return ERROR_INVALID_ARGUMENT };
    let Some(mode) = (unsafe { read_mode(mode) }) else { return ERROR_INVALID_ARGUMENT };

    match state.panel.request_toggle_camera(camera, stem, mode) {
        Ok(ticket) => unsafe { pending(ticket, ticket_out) },
        Err(e) => error_code(&e),
    }
}

/// Same as [`panel_toggle_camera`] for all cameras at once.
#[no_mangle]
pub extern "C" fn panel_toggle_both(
    stem: *const c_char,
    mode: *const c_char,
    ticket_out: *mut u64,
) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(stem) = (unsafe { read_str(stem) }) else { return ERROR_INVALID_ARGUMENT };
    let Some(mode) = (unsafe { read_mode(mode) }) else { return ERROR_INVALID_ARGUMENT };

    match state.panel.request_toggle_both(stem, mode) {
        Ok(ticket) => unsafe { pending(ticket, ticket_out) },
        Err(e) => error_code(&e),
    }
}

/// Outcome of a queued toggle: `RESULT_PENDING` while it runs,
/// `RESULT_STARTED` after a start, `RESULT_OK` after a stop (saved paths are
/// copied into `buf` one per line), or the error code of a failure.
#[no_mangle]
pub extern "C" fn panel_command_result(ticket: u64, buf: *mut c_char, buf_len: usize) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(outcome) = state.panel.command_outcome(ticket) else { return ERROR_UNKNOWN_TICKET };

    unsafe { outcome_code(&outcome, buf, buf_len) }
}

/// # Safety
///
/// `buf` must be null or valid for writes of `buf_len` bytes.
unsafe fn outcome_code(outcome: &CommandOutcome, buf: *mut c_char, buf_len: usize) -> i32 {
    match outcome {
        CommandOutcome::Pending => RESULT_PENDING,
        CommandOutcome::Started => RESULT_STARTED,
        CommandOutcome::Stopped(saved) => {
            if !buf.is_null() {
                let paths: Vec<String> = saved
                    .iter()
                    .map(|(_, path)| path.to_string_lossy().into_owned())
                    .collect();
                copy_str(&paths.join("\n"), buf, buf_len);
            }
            RESULT_OK
        }
        CommandOutcome::Failed(e) => error_code(e),
    }
}

unsafe fn pending(ticket: Ticket, ticket_out: *mut u64) -> i32 {
    if !ticket_out.is_null() {
        *ticket_out = ticket;
    }
    RESULT_PENDING
}

#[no_mangle]
pub extern "C" fn panel_set_preview_enabled(enabled: i32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    state.panel.set_preview_enabled(enabled != 0);
    RESULT_OK
}

/// `STATUS_LIVE` while a frame is shown, otherwise the placeholder's code.
#[no_mangle]
pub extern "C" fn panel_preview_status(camera: u32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    match state.panel.preview_status(camera) {
        Some(status) => status.code(),
        None if state.panel.preview_frame(camera).is_some() => STATUS_LIVE,
        None => preview::PreviewStatus::NoSignal.code(),
    }
}

#[no_mangle]
pub extern "C" fn panel_preview_frame_width(camera: u32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    match state.panel.preview_frame(camera) {
        Some(frame) => frame.width() as i32,
        None => ERROR_NO_PREVIEW_FRAME,
    }
}

#[no_mangle]
pub extern "C" fn panel_preview_frame_height(camera: u32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    match state.panel.preview_frame(camera) {
        Some(frame) => frame.height() as i32,
        None => ERROR_NO_PREVIEW_FRAME,
    }
}

/// Copies the current preview frame as packed RGB24.
#[no_mangle]
pub extern "C" fn panel_grab_preview_frame(camera: u32, buffer: *mut u8, available_bytes: usize) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(frame) = state.panel.preview_frame(camera) else { return ERROR_NO_PREVIEW_FRAME };

    let bytes = frame.as_raw();
    if available_bytes < bytes.len() {
        return ERROR_BUFFER_NOT_ENOUGH_CAPACITY;
    }
    if buffer.is_null() {
        return ERROR_BUFFER_NULL;
    }

    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len());
    }
    RESULT_OK
}

/// Copies the current preview frame rescaled by the display `ratio` and
/// writes its size to `width_out`/`height_out`.
#[no_mangle]
pub extern "C" fn panel_grab_rendered_frame(
    camera: u32,
    ratio: f64,
    buffer: *mut u8,
    available_bytes: usize,
    width_out: *mut u32,
    height_out: *mut u32,
) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(frame) = state.panel.render_preview(camera, ratio) else { return ERROR_NO_PREVIEW_FRAME };

    let bytes = frame.as_raw();
    if available_bytes < bytes.len() {
        return ERROR_BUFFER_NOT_ENOUGH_CAPACITY;
    }
    if buffer.is_null() || width_out.is_null() || height_out.is_null() {
        return ERROR_BUFFER_NULL;
    }

    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len());
        *width_out = frame.width();
        *height_out = frame.height();
    }
    RESULT_OK
}

fn motor_from(code: u32) -> Option<Motor> {
    match code {
        0 => Some(Motor::A),
        1 => Some(Motor::B),
        _ => None,
    }
}

/// `motor` is 0 for A, 1 for B; `percent` is clamped to 0-100.
#[no_mangle]
pub extern "C" fn panel_set_motor_speed(motor: u32, percent: i32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(motor) = motor_from(motor) else { return ERROR_INVALID_ARGUMENT };

    state.panel.mcu().set_motor_speed(motor, percent);
    RESULT_OK
}

/// `direction` is 0 stop, 1 forward, 2 reverse.
#[no_mangle]
pub extern "C" fn panel_set_motor_direction(motor: u32, direction: i32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(motor) = motor_from(motor) else { return ERROR_INVALID_ARGUMENT };
    let Some(direction) = Direction::from_code(direction) else { return ERROR_INVALID_ARGUMENT };

    state.panel.mcu().set_motor_direction(motor, direction);
    RESULT_OK
}

#[no_mangle]
pub extern "C" fn panel_set_fan_speed(percent: i32) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };

    state.panel.mcu().set_fan_speed(percent);
    RESULT_OK
}

/// Writes the last numeric scale reading into `out`.
#[no_mangle]
pub extern "C" fn panel_weight(out: *mut f64) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(weight) = state.panel.last_weight() else { return ERROR_NO_WEIGHT };
    if out.is_null() {
        return ERROR_BUFFER_NULL;
    }

    unsafe {
        *out = weight;
    }
    RESULT_OK
}

#[no_mangle]
pub extern "C" fn panel_save_weight(stem: *const c_char) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(stem) = (unsafe { read_str(stem) }) else { return ERROR_INVALID_ARGUMENT };

    if state.panel.last_weight().is_none() {
        return ERROR_NO_WEIGHT;
    }
    match state.panel.save_weight(stem) {
        Ok(_) => RESULT_OK,
        Err(e) => error_code(&e),
    }
}

#[no_mangle]
pub extern "C" fn panel_save_adjustment(stem: *const c_char, value: f64) -> i32 {
    let Some(state) = State::current() else { return ERROR_STATE_NOT_INITIALIZED };
    let Some(stem) = (unsafe { read_str(stem) }) else { return ERROR_INVALID_ARGUMENT };

    match state.panel.save_adjustment(stem, value) {
        Ok(_) => RESULT_OK,
        Err(e) => error_code(&e),
    }
}

/// Borrows a NUL-terminated UTF-8 string. `None` for null or invalid UTF-8.
///
/// # Safety
///
/// `s` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

/// Null means video.
unsafe fn read_mode(mode: *const c_char) -> Option<RecordMode> {
    if mode.is_null() {
        return Some(RecordMode::Video);
    }
    read_str(mode)?.parse().ok()
}

/// Copies a Rust string into a C buffer, similar to `strncpy` in C.
///
/// # Arguments
///
/// * `s` - The Rust string slice to copy.
/// * `buf` - A mutable pointer to the destination buffer.
/// * `length` - The size of the destination buffer in bytes.
///
/// # Safety
///
/// `buf` must be valid for writes of `length` bytes.
unsafe fn copy_str(s: &str, buf: *mut c_char, length: usize) -> usize {
    if length == 0 {
        return 0;
    }

    let bytes = s.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), length - 1); // room for the terminator

    ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, len_to_copy);
    *buf.add(len_to_copy) = 0;

    len_to_copy
}
