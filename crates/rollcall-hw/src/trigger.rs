//! Serial motor trigger.
//!
//! An Arduino Uno on a USB serial port runs one motor cycle when it receives
//! `START\n`. The trigger is best-effort: callers log failures and move on.

use nix::sys::termios::{self, BaudRate, SetArg};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Arduino Uno R3 USB IDs.
pub const ARDUINO_UNO_VID: u16 = 0x2341;
pub const ARDUINO_UNO_PID: u16 = 0x0043;

pub const DEFAULT_BAUD: u32 = 9600;
const START_COMMAND: &[u8] = b"START\n";
/// Opening the port resets the Uno; its bootloader needs this long.
const DEFAULT_RESET_DELAY: Duration = Duration::from_secs(2);
const SYS_CLASS_TTY: &str = "/sys/class/tty";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no Arduino found on any USB serial port")]
    NotFound,
    #[error("failed to open {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaud(u32),
    #[error("termios: {0}")]
    Termios(#[from] nix::Error),
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Fires the motor by writing the start command to the serial port.
#[derive(Debug, Clone)]
pub struct MotorTrigger {
    port: Option<PathBuf>,
    baud: u32,
    reset_delay: Duration,
}

impl MotorTrigger {
    /// `port: None` auto-detects the Arduino at fire time.
    pub fn new(port: Option<PathBuf>, baud: u32) -> Self {
        Self {
            port,
            baud,
            reset_delay: DEFAULT_RESET_DELAY,
        }
    }

    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Resolve the port, configure it and send the start command.
    pub fn fire(&self) -> Result<PathBuf, TriggerError> {
        let port = match &self.port {
            Some(p) => p.clone(),
            None => find_port(Path::new(SYS_CLASS_TTY), ARDUINO_UNO_VID, ARDUINO_UNO_PID)
                .ok_or(TriggerError::NotFound)?,
        };
        let baud = baud_rate(self.baud)?;

        tracing::info!(port = %port.display(), baud = self.baud, "triggering motor");

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NOCTTY)
            .open(&port)
            .map_err(|e| TriggerError::Open(port.clone(), e))?;

        let mut tio = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, baud)?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio)?;

        std::thread::sleep(self.reset_delay);

        file.write_all(START_COMMAND)?;
        file.flush()?;
        termios::tcdrain(&file)?;

        tracing::info!(port = %port.display(), "motor cycle triggered");
        Ok(port)
    }

    /// Fire on a background thread; failures are only logged.
    pub fn fire_detached(&self) {
        let trigger = self.clone();
        let spawned = std::thread::Builder::new()
            .name("rollcall-trigger".into())
            .spawn(move || {
                if let Err(e) = trigger.fire() {
                    tracing::warn!(error = %e, "motor trigger failed");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn motor trigger thread");
        }
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, TriggerError> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(TriggerError::UnsupportedBaud(other)),
    })
}

/// Find the `/dev` node of the first tty whose USB device has `vid:pid`.
///
/// `sys_class_tty` is normally `/sys/class/tty`; each entry's `device` link
/// points at the USB interface, whose parent holds `idVendor`/`idProduct`.
pub fn find_port(sys_class_tty: &Path, vid: u16, pid: u16) -> Option<PathBuf> {
    let mut names: Vec<String> = std::fs::read_dir(sys_class_tty)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("ttyACM") || n.starts_with("ttyUSB"))
        .collect();
    names.sort();

    names.into_iter().find_map(|name| {
        let ids = usb_ids(&sys_class_tty.join(&name))?;
        if ids == (vid, pid) {
            tracing::debug!(tty = %name, "Arduino serial port detected");
            Some(PathBuf::from("/dev").join(name))
        } else {
            None
        }
    })
}

fn usb_ids(tty_dir: &Path) -> Option<(u16, u16)> {
    let interface_dir = std::fs::canonicalize(tty_dir.join("device")).ok()?;
    let usb_device_dir = interface_dir.parent()?;

    let vid_str = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid_str = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;

    let vid = u16::from_str_radix(vid_str.trim(), 16).ok()?;
    let pid = u16::from_str_radix(pid_str.trim(), 16).ok()?;
    Some((vid, pid))
}
