use std::io::{ErrorKind, Read, Write};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::config::ScaleConfig;
use crate::error::{PanelError, PanelResult};

/// Canned answer in simulated mode.
pub const SIMULATED_READING: &str = "SIM:72.35";

// sign and digits may be separated by blanks, e.g. "-  191.58"
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([-+]?)\s*(\d+\.?\d*)").expect("number pattern is valid"));

/// First signed decimal number in `text`, if any.
pub fn extract_number(text: &str) -> Option<f64> {
    let caps = NUMBER.captures(text)?;
    let sign = caps.get(1).map_or("", |m| m.as_str());
    let digits = caps.get(2)?.as_str();
    format!("{sign}{digits}").parse().ok()
}

/// Reads from `source` until a non-empty line arrives or `deadline` passes.
/// Timeouts and empty reads from the source are waited out.
pub fn read_first_line<R: Read + ?Sized>(source: &mut R, deadline: Instant) -> PanelResult<String> {
    let mut line: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];

    while Instant::now() < deadline {
        match source.read(&mut byte) {
            Ok(0) => thread::sleep(Duration::from_millis(5)),
            Ok(_) => {
                if byte[0] == b'\n' || byte[0] == b'\r' {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if !text.is_empty() {
                        return Ok(text);
                    }
                } else {
                    line.push(byte[0]);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(PanelError::Serial(e.to_string())),
        }
    }
    Err(PanelError::Timeout)
}

/// Polls the scale over its own serial line. The port is opened on first use
/// and kept until an I/O error, after which the next poll reopens it.
pub struct WeightReader {
    config: ScaleConfig,
    port: Option<Box<dyn SerialPort>>,
}

impl WeightReader {
    pub fn new(config: ScaleConfig) -> Self {
        Self { config, port: None }
    }

    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    fn ensure_open(&mut self) -> PanelResult<&mut Box<dyn SerialPort>> {
        if self.port.is_none() {
            let port = serialport::new(&self.config.port, self.config.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .timeout(Duration::from_millis(self.config.timeout_ms))
                .open()?;
            info!(port = %self.config.port, baud = self.config.baud_rate, "scale connected");
            self.port = Some(port);
        }
        self.port
            .as_mut()
            .ok_or_else(|| PanelError::Serial("scale port not open".to_string()))
    }

    /// One poll: optional request, then the first non-empty line.
    pub fn read_value(&mut self) -> PanelResult<String> {
        if self.config.simulate {
            return Ok(SIMULATED_READING.to_string());
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.poll_timeout_ms);
        let request = self
            .config
            .request_command
            .as_ref()
            .map(|cmd| format!("{cmd}{}", self.config.line_ending));

        let port = self.ensure_open()?;
        let result = poll(&mut **port, request.as_deref(), deadline);

        match &result {
            Ok(line) => debug!(line = %line, "scale reading"),
            Err(PanelError::Timeout) => debug!("scale did not answer in time"),
            Err(e) => {
                warn!(error = %e, "scale link failed, reopening on next poll");
                self.port = None;
            }
        }
        result
    }

    /// A poll parsed down to a number; `Ok(None)` when the text had none.
    pub fn read_weight(&mut self) -> PanelResult<(String, Option<f64>)> {
        let text = self.read_value()?;
        let weight = extract_number(&text);
        Ok((text, weight))
    }
}

fn poll(port: &mut dyn SerialPort, request: Option<&str>, deadline: Instant) -> PanelResult<String> {
    port.clear(ClearBuffer::Input)?;
    if let Some(request) = request {
        port.write_all(request.as_bytes())?;
        port.flush()?;
    }
    read_first_line(port, deadline)
}
