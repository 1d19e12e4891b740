use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Event and bucket time. The unit is whatever the producer uses; the periodic
/// timer interprets the configured interval as milliseconds.
pub type Timestamp = i64;

pub const DEFAULT_TIME_KEY: &str = "time";

/// One value carried by a raw event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Datum {
    /// Numeric view of the datum. Booleans map to `1.0` / `0.0`.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by conditional accumulators (`buy`/`sell` flags).
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Number(v) => *v != 0.0 && !v.is_nan(),
            Self::Bool(b) => *b,
            Self::Text(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Raw structured event fed to `capture` / `preload`.
///
/// Hidden fields may write into the event (e.g. derive a `buy` flag from a
/// signed quantity); public fields observe those writes because hidden fields
/// always run first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: BTreeMap<String, Datum>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Datum>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Overwrites in place when the key exists, so the hot path does not
    /// allocate a key.
    pub(crate) fn set_number(&mut self, name: &str, value: f64) {
        match self.fields.get_mut(name) {
            Some(slot) => *slot = Datum::Number(value),
            None => {
                self.fields.insert(name.to_string(), Datum::Number(value));
            }
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.fields.get(name)
    }

    #[inline]
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Datum::as_f64)
    }

    #[inline]
    pub fn flag(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(Datum::is_truthy)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub(crate) fn time(&self, key: &str) -> Option<Timestamp> {
        self.number(key)
            .filter(|v| v.is_finite())
            .map(|v| v as Timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Position metadata handed to traversal consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorPosition {
    /// Physical slot in the bucket array.
    pub index: usize,
    /// Offset relative to the cursor (`0` is the current bucket).
    pub relative: i64,
    /// Zero based iteration number.
    pub ordinal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    Timer,
    Capture,
    Preload,
    GapFill,
    Manual,
}

impl AdvanceReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Capture => "capture",
            Self::Preload => "preload",
            Self::GapFill => "gap-fill",
            Self::Manual => "manual",
        }
    }
}

fn default_time_key() -> String {
    DEFAULT_TIME_KEY.to_string()
}

/// Data part of the sampler configuration. Field declarations are code and
/// travel separately (see [`crate::catalog::FieldDecls`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// Bucket width. `0` means one bucket per event.
    #[serde(default)]
    pub interval: i64,
    /// Number of buckets retained per track.
    pub buffer_length: usize,
    #[serde(default = "default_time_key")]
    pub time_key: String,
    /// Event fields whose values form the track key.
    #[serde(default)]
    pub track_keys: Vec<String>,
    /// Disables the periodic timer; live captures then gap-fill on their own.
    #[serde(default)]
    pub suppress_auto_sampling: bool,
}

impl SamplerOptions {
    pub fn new(interval: i64, buffer_length: usize) -> Self {
        Self {
            interval,
            buffer_length,
            time_key: default_time_key(),
            track_keys: Vec::new(),
            suppress_auto_sampling: false,
        }
    }

    pub fn with_time_key(mut self, time_key: impl Into<String>) -> Self {
        self.time_key = time_key.into();
        self
    }

    pub fn with_track_keys<I, S>(mut self, track_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.track_keys = track_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn suppress_auto_sampling(mut self) -> Self {
        self.suppress_auto_sampling = true;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_length == 0 {
            return Err(ConfigError::ZeroBufferLength);
        }
        if self.interval < 0 {
            return Err(ConfigError::NegativeInterval {
                interval: self.interval,
            });
        }
        Ok(())
    }
}

/// Time quantization and boundary rules shared by every track of a sampler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleClock {
    interval: i64,
    time_key: Arc<str>,
    suppress_auto_sampling: bool,
}

impl SampleClock {
    pub fn from_options(options: &SamplerOptions) -> Self {
        Self {
            interval: options.interval.max(0),
            time_key: Arc::from(options.time_key.as_str()),
            suppress_auto_sampling: options.suppress_auto_sampling,
        }
    }

    #[inline]
    pub fn interval(&self) -> i64 {
        self.interval
    }

    #[inline]
    pub fn time_key(&self) -> &str {
        &self.time_key
    }

    #[inline]
    pub fn is_suppressed(&self) -> bool {
        self.suppress_auto_sampling
    }

    /// Floors `raw` onto the bucket grid. Per-event mode leaves it unchanged.
    ///
    /// `None` when the bucket starting at the floored time, or the one after
    /// it, is not representable as a [`Timestamp`].
    #[inline]
    pub fn sample_time(&self, raw: Timestamp) -> Option<Timestamp> {
        if self.interval == 0 {
            return Some(raw);
        }
        let floored = raw.checked_sub(raw.rem_euclid(self.interval))?;
        floored.checked_add(self.interval)?;
        Some(floored)
    }

    /// `sample_time` must already be on the bucket grid.
    pub fn should_advance(&self, sample_time: Timestamp, last_boundary: Option<Timestamp>) -> bool {
        let Some(last_boundary) = last_boundary else {
            return true;
        };
        if self.interval == 0 {
            return true;
        }
        sample_time.saturating_sub(last_boundary) >= self.interval
    }

    /// Boundaries that elapse between two events without needing a gap-fill.
    /// A live timer accounts for one; a timerless buffer accounts for none.
    #[inline]
    pub fn natural_skip(&self) -> i64 {
        if self.suppress_auto_sampling {
            0
        } else {
            1
        }
    }
}
