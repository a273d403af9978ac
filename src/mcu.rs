//! Motor and fan control over the MCU's serial line.
//!
//! Commands are short ASCII words followed by the configured line ending:
//! `A<0-255>` / `B<0-255>` set motor speed, `AD<code>` / `BD<code>` set
//! direction and `F<0-100>` sets the fan. Without a port every command is
//! only logged.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{DataBits, Parity, StopBits};
use tracing::{debug, info, warn};

use crate::config::McuConfig;
use crate::error::PanelError;
use crate::logging::LogSink;
use crate::worker::Worker;

const READER_POLL: Duration = Duration::from_millis(50);
const READER_ERROR_BACKOFF: Duration = Duration::from_millis(200);
const READER_JOIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Motor {
    A,
    B,
}

impl Motor {
    fn prefix(self) -> &'static str {
        match self {
            Motor::A => "A",
            Motor::B => "B",
        }
    }
}

impl FromStr for Motor {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Motor::A),
            "B" => Ok(Motor::B),
            other => Err(PanelError::Config(format!("unknown motor {other:?}"))),
        }
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Stop,
    Forward,
    Reverse,
}

impl Direction {
    pub fn code(self) -> u8 {
        match self {
            Direction::Stop => 0,
            Direction::Forward => 1,
            Direction::Reverse => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Direction::Stop),
            1 => Some(Direction::Forward),
            2 => Some(Direction::Reverse),
            _ => None,
        }
    }
}

/// Hardware speed value for a 0-100 percentage (clamped). Halves round to
/// even, so 30% is 76 and 70% is 178.
pub fn speed_value(percent: i32) -> u8 {
    let percent = percent.clamp(0, 100);
    (f64::from(percent) * 255.0 / 100.0).round_ties_even() as u8
}

pub fn speed_command(motor: Motor, percent: i32) -> String {
    format!("{}{}", motor.prefix(), speed_value(percent))
}

pub fn direction_command(motor: Motor, direction: Direction) -> String {
    format!("{}D{}", motor.prefix(), direction.code())
}

pub fn fan_command(percent: i32) -> String {
    format!("F{}", percent.clamp(0, 100))
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of `bytes` with invalid UTF-8 sequences dropped.
fn decode_valid(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

/// Reassembles inbound bytes into trimmed, non-empty lines. Accepts `\r\n`,
/// `\n` and `\r` as terminators. Bytes are buffered until a terminator
/// arrives, so a character split across reads survives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\r' || b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = decode_valid(&raw[..end]).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub fn pending(&self) -> String {
        decode_valid(&self.pending)
    }
}

type Link = Box<dyn Write + Send>;
type Inbound = Box<dyn Read + Send>;

pub struct MotorController {
    writer: Mutex<Option<Link>>,
    simulated: bool,
    line_ending: String,
    on_line: LogSink,
    reader: Mutex<Option<Worker>>,
}

impl MotorController {
    /// Opens the configured port. A missing or busy port leaves the
    /// controller in simulated mode instead of failing.
    pub fn open(config: &McuConfig, on_line: LogSink) -> Self {
        let opened = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(config.timeout_ms))
            .open();

        let port = match opened {
            Ok(port) => port,
            Err(e) => {
                warn!(port = %config.port, error = %e, "MCU port unavailable, simulating");
                on_line(&format!("[serial init failed] {e}"));
                return Self::simulated(&config.line_ending, on_line);
            }
        };

        let inbound = match port.try_clone() {
            Ok(mut clone) => {
                if let Err(e) = clone.set_timeout(READER_POLL) {
                    debug!(error = %e, "reader timeout not applied");
                }
                Some(Box::new(clone) as Inbound)
            }
            Err(e) => {
                warn!(port = %config.port, error = %e, "MCU reader unavailable");
                None
            }
        };

        info!(port = %config.port, baud = config.baud_rate, "MCU connected");
        Self::with_link(Box::new(port), inbound, &config.line_ending, on_line)
    }

    pub fn simulated(line_ending: &str, on_line: LogSink) -> Self {
        Self {
            writer: Mutex::new(None),
            simulated: true,
            line_ending: line_ending.to_string(),
            on_line,
            reader: Mutex::new(None),
        }
    }

    /// Drives an already-open link; `inbound` feeds the background reader.
    pub fn with_link(
        writer: Link,
        inbound: Option<Inbound>,
        line_ending: &str,
        on_line: LogSink,
    ) -> Self {
        let reader = inbound.and_then(|inbound| {
            let sink = on_line.clone();
            match Worker::spawn("mcu-reader", move |stop| read_lines(inbound, &sink, &stop)) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!(error = %e, "MCU reader thread not started");
                    None
                }
            }
        });

        Self {
            writer: Mutex::new(Some(writer)),
            simulated: false,
            line_ending: line_ending.to_string(),
            on_line,
            reader: Mutex::new(reader),
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Sends one command. Write errors are reported to the log, not returned.
    pub fn send_text(&self, text: &str) {
        let mut writer = self.writer.lock();
        let Some(link) = writer.as_mut() else {
            (self.on_line)(&format!("[simulated] >>> {text}"));
            return;
        };

        let raw = format!("{text}{}", self.line_ending).into_bytes();
        (self.on_line)(&format!(">>> {text}   ({})", hex_bytes(&raw)));
        if let Err(e) = link.write_all(&raw).and_then(|_| link.flush()) {
            warn!(command = text, error = %e, "MCU write failed");
            (self.on_line)(&format!("[write error] {e}"));
        }
    }

    pub fn set_motor_speed(&self, motor: Motor, percent: i32) {
        self.send_text(&speed_command(motor, percent));
    }

    pub fn set_motor_direction(&self, motor: Motor, direction: Direction) {
        self.send_text(&direction_command(motor, direction));
    }

    pub fn set_fan_speed(&self, percent: i32) {
        self.send_text(&fan_command(percent));
    }

    /// Stops the reader and drops the port. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(mut reader) = self.reader.lock().take() {
            reader.stop(READER_JOIN);
        }
        if self.writer.lock().take().is_some() {
            debug!("MCU link closed");
        }
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_lines(mut inbound: Inbound, on_line: &LogSink, stop: &AtomicBool) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Acquire) {
        match inbound.read(&mut buf) {
            Ok(0) => thread::sleep(READER_POLL),
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    on_line(&line);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                on_line(&format!("[read error] {e}"));
                thread::sleep(READER_ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::sync::Arc;

    use crate::testing::wait_until;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_log() -> (LogSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let sink: LogSink = Arc::new(move |line: &str| sink_lines.lock().push(line.to_string()));
        (sink, lines)
    }

    #[test]
    fn speed_maps_percent_to_byte() {
        assert_eq!(speed_value(50), 128);
        assert_eq!(speed_value(0), 0);
        assert_eq!(speed_value(100), 255);
        assert_eq!(speed_value(140), 255);
        assert_eq!(speed_value(-3), 0);
        assert_eq!(speed_value(30), 76);
        assert_eq!(speed_value(70), 178);
        assert_eq!(speed_value(90), 230);
        assert_eq!(speed_command(Motor::A, 50), "A128");
        assert_eq!(speed_command(Motor::A, 30), "A76");
        assert_eq!(speed_command(Motor::B, 10), "B26");
    }

    #[test]
    fn direction_and_fan_commands() {
        assert_eq!(direction_command(Motor::A, Direction::Forward), "AD1");
        assert_eq!(direction_command(Motor::B, Direction::Reverse), "BD2");
        assert_eq!(direction_command(Motor::B, Direction::Stop), "BD0");
        assert_eq!(Direction::from_code(2), Some(Direction::Reverse));
        assert_eq!(Direction::from_code(7), None);
        assert_eq!(fan_command(75), "F75");
        assert_eq!(fan_command(300), "F100");
        assert_eq!("b".parse::<Motor>().unwrap(), Motor::B);
        assert!("C".parse::<Motor>().is_err());
    }

    #[test]
    fn splitter_accepts_every_line_ending() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"OK\r\nspeed="), vec!["OK"]);
        assert_eq!(splitter.push(b"128\n\r  fan 3 \rpart"), vec!["speed=128", "fan 3"]);
        assert_eq!(splitter.pending(), "part");
        assert_eq!(splitter.push(b"\r\n"), vec!["part"]);
        assert_eq!(splitter.pending(), "");
    }

    #[test]
    fn characters_split_across_reads_survive() {
        let mut splitter = LineSplitter::new();
        let text = "temp 21\u{b0}C\n".as_bytes();
        let cut = text.iter().position(|&b| b == 0xC2).unwrap() + 1;
        assert!(splitter.push(&text[..cut]).is_empty());
        assert_eq!(splitter.push(&text[cut..]), vec!["temp 21\u{b0}C"]);

        assert_eq!(splitter.push(b"A=\xff12\r\n"), vec!["A=12"]);
    }

    #[test]
    fn simulated_controller_only_logs() {
        let (sink, lines) = capture_log();
        let mcu = MotorController::simulated("\r\n", sink);
        assert!(mcu.is_simulated());
        mcu.set_motor_speed(Motor::A, 50);
        mcu.set_fan_speed(20);
        assert_eq!(
            *lines.lock(),
            vec!["[simulated] >>> A128".to_string(), "[simulated] >>> F20".to_string()]
        );
        mcu.close();
        mcu.close();
    }

    #[test]
    fn commands_are_framed_and_logged_with_hex() {
        let (sink, lines) = capture_log();
        let wire = SharedBuf::default();
        let mcu = MotorController::with_link(Box::new(wire.clone()), None, "\r\n", sink);

        mcu.set_motor_direction(Motor::A, Direction::Forward);
        assert_eq!(&*wire.0.lock(), b"AD1\r\n");
        assert_eq!(lines.lock()[0], ">>> AD1   (41 44 31 0d 0a)");

        mcu.close();
        mcu.set_fan_speed(10);
        assert_eq!(lines.lock().last().unwrap(), "[simulated] >>> F10");
        assert_eq!(&*wire.0.lock(), b"AD1\r\n");
    }

    #[test]
    fn inbound_lines_reach_the_log() {
        let (sink, lines) = capture_log();
        let inbound = Cursor::new(b"READY\r\n\r\nA=128\nBD=1\rtail".to_vec());
        let mcu = MotorController::with_link(
            Box::new(SharedBuf::default()),
            Some(Box::new(inbound)),
            "\n",
            sink,
        );

        assert!(wait_until(Duration::from_secs(2), || lines.lock().len() >= 3));
        mcu.close();
        assert_eq!(*lines.lock(), vec!["READY", "A=128", "BD=1"]);
    }
}
