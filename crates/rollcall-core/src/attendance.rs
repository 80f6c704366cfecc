//! Cooldown-gated attendance marking.
//!
//! Turns a stream of recognitions into at most one record per identity per
//! cooldown window, written to whichever sheet the operator selected.

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const STATUS_PRESENT: &str = "Present";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance target not found: {0}")]
    TargetNotFound(String),
    #[error("no attendance target selected")]
    NoTarget,
    #[error("attendance sink unavailable: {0}")]
    Unavailable(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub identity: String,
    /// `%Y-%m-%d`
    pub date: String,
    /// `%H:%M:%S`
    pub time: String,
    pub status: String,
}

impl AttendanceRecord {
    pub fn present(identity: &str, at: NaiveDateTime) -> Self {
        Self {
            identity: identity.to_string(),
            date: at.format("%Y-%m-%d").to_string(),
            time: at.format("%H:%M:%S").to_string(),
            status: STATUS_PRESENT.to_string(),
        }
    }
}

/// External destination for attendance records (a spreadsheet, a file...).
pub trait AttendanceSink: Send {
    /// Make `name` the destination of subsequent appends.
    ///
    /// Selecting a target that does not exist must fail and leave the
    /// previous selection untouched.
    fn select_target(&mut self, name: &str) -> Result<(), SinkError>;

    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), SinkError>;
}

/// Time source, swappable in tests.
pub trait Clock: Send {
    /// Local wall-clock time. Only used to stamp records; it may jump.
    fn now(&self) -> NaiveDateTime;

    /// Monotonic reading for cooldown arithmetic. Never goes backwards.
    fn elapsed(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// When an identity was last marked.
#[derive(Debug, Clone, Copy)]
struct LastMark {
    /// Monotonic reading, compared against the cooldown.
    at: Duration,
    /// Wall-clock stamp written to the record.
    stamp: NaiveDateTime,
}

/// Applies the target and cooldown policies before writing to the sink.
///
/// The cooldown table lives and dies with the gate: a fresh gate lets every
/// identity through once.
pub struct AttendanceGate {
    sink: Box<dyn AttendanceSink>,
    clock: Box<dyn Clock>,
    cooldown: Duration,
    target: Option<String>,
    last_marked: HashMap<String, LastMark>,
}

impl AttendanceGate {
    pub fn new(sink: Box<dyn AttendanceSink>, cooldown: Duration) -> Self {
        Self::with_clock(sink, Box::<SystemClock>::default(), cooldown)
    }

    pub fn with_clock(sink: Box<dyn AttendanceSink>, clock: Box<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            sink,
            clock,
            cooldown,
            target: None,
            last_marked: HashMap::new(),
        }
    }

    /// Select the sheet that receives records. Returns false, keeping the
    /// previous selection, if the sink rejects `name`.
    pub fn select_target(&mut self, name: &str) -> bool {
        match self.sink.select_target(name) {
            Ok(()) => {
                tracing::info!(target_name = name, "attendance target selected");
                self.target = Some(name.to_string());
                true
            }
            Err(e) => {
                tracing::warn!(target_name = name, error = %e, "cannot select attendance target");
                false
            }
        }
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// True if `identity` was never marked or its cooldown has elapsed.
    ///
    /// Measured on the monotonic clock, so wall-clock steps (DST, NTP) do not
    /// stretch or shorten the window.
    pub fn can_mark(&self, identity: &str) -> bool {
        match self.last_marked.get(identity) {
            None => true,
            Some(last) => self.clock.elapsed().saturating_sub(last.at) >= self.cooldown,
        }
    }

    /// Write a `Present` record for `identity` if both policies allow it.
    ///
    /// Returns true only when the record was written and the cooldown
    /// restarted. A failed write is logged and not retried; the cooldown is
    /// left as it was.
    pub fn mark(&mut self, identity: &str) -> bool {
        if self.target.is_none() {
            tracing::debug!(identity, "no attendance target selected; not marking");
            return false;
        }

        if !self.can_mark(identity) {
            return false;
        }

        let at = self.clock.elapsed();
        let stamp = self.clock.now();
        let record = AttendanceRecord::present(identity, stamp);

        match self.sink.append_record(&record) {
            Ok(()) => {
                self.last_marked.insert(identity.to_string(), LastMark { at, stamp });
                tracing::info!(identity, date = %record.date, time = %record.time, "attendance marked");
                true
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "attendance write failed; skipping");
                false
            }
        }
    }

    /// Identities marked at least once since the gate was created.
    pub fn marked(&self) -> impl Iterator<Item = (&str, &NaiveDateTime)> {
        self.last_marked.iter().map(|(k, v)| (k.as_str(), &v.stamp))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
