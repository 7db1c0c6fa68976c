use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_fire_interval")]
    pub fire_interval: String, // e.g., "1s"
    #[serde(default = "default_grace_period")]
    pub grace_period: String, // e.g., "3s"
    /// Fire synchronously from the tick instead of routing through the fire buffer.
    #[serde(default)]
    pub start_now: bool,
    /// Used when the owning window does not report a gap of its own.
    #[serde(default)]
    pub max_allowed_gap_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_auto_flush_interval")]
    pub auto_flush_interval: String, // e.g., "100ms"
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_fired_retention")]
    pub fired_retention: String, // event time, e.g., "10m"
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_fire_interval() -> String {
    "1s".into()
}
fn default_grace_period() -> String {
    "3s".into()
}
fn default_auto_flush_interval() -> String {
    "100ms".into()
}
fn default_max_batch_size() -> usize {
    1000
}
fn default_fired_retention() -> String {
    "10m".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fire_interval: default_fire_interval(),
            grace_period: default_grace_period(),
            start_now: false,
            max_allowed_gap_seconds: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            auto_flush_interval: default_auto_flush_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { fired_retention: default_fired_retention() }
    }
}

/// Typed, validated form of [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fire_interval: std::time::Duration,
    pub grace_period: chrono::Duration,
    pub start_now: bool,
    pub max_allowed_gap_seconds: Option<u64>,
    pub auto_flush_interval: std::time::Duration,
    pub max_batch_size: usize,
    pub fired_retention: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fire_interval: std::time::Duration::from_secs(1),
            grace_period: chrono::Duration::milliseconds(3_000),
            start_now: false,
            max_allowed_gap_seconds: None,
            auto_flush_interval: std::time::Duration::from_millis(100),
            max_batch_size: 1000,
            fired_retention: chrono::Duration::minutes(10),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.resolve().map(|_| ())
    }

    pub fn resolve(&self) -> Result<EngineSettings> {
        let fire_interval_ms = parse_duration_ms(&self.scheduler.fire_interval)?;
        if fire_interval_ms <= 0 {
            return Err(Error::Config("scheduler.fire_interval must be positive".into()));
        }
        let grace_ms = parse_duration_ms(&self.scheduler.grace_period)?;
        if grace_ms < 0 {
            return Err(Error::Config("scheduler.grace_period must not be negative".into()));
        }
        let flush_ms = parse_duration_ms(&self.buffer.auto_flush_interval)?;
        if flush_ms <= 0 {
            return Err(Error::Config("buffer.auto_flush_interval must be positive".into()));
        }
        if self.buffer.max_batch_size == 0 {
            return Err(Error::Config("buffer.max_batch_size must be at least 1".into()));
        }
        let retention_ms = parse_duration_ms(&self.retention.fired_retention)?;
        if retention_ms < 0 {
            return Err(Error::Config("retention.fired_retention must not be negative".into()));
        }
        Ok(EngineSettings {
            fire_interval: std::time::Duration::from_millis(fire_interval_ms as u64),
            grace_period: chrono::Duration::milliseconds(grace_ms),
            start_now: self.scheduler.start_now,
            max_allowed_gap_seconds: self.scheduler.max_allowed_gap_seconds,
            auto_flush_interval: std::time::Duration::from_millis(flush_ms as u64),
            max_batch_size: self.buffer.max_batch_size,
            fired_retention: chrono::Duration::milliseconds(retention_ms),
        })
    }
}

pub fn parse_duration_ms(s: &str) -> Result<i64> {
    // small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    let parse = |num: &str| -> Result<i64> {
        num.trim()
            .parse::<i64>()
            .map_err(|e| Error::Config(format!("invalid duration {s:?}: {e}")))
    };
    if let Some(num) = s.strip_suffix("ms") {
        return parse(num);
    }
    if let Some(num) = s.strip_suffix('s') {
        return Ok(parse(num)? * 1_000);
    }
    if let Some(num) = s.strip_suffix('m') {
        return Ok(parse(num)? * 60_000);
    }
    if let Some(num) = s.strip_suffix('h') {
        return Ok(parse(num)? * 3_600_000);
    }
    // default assume seconds
    Ok(parse(s)? * 1_000)
}
