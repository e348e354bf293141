//! Frame time handed to the per-frame driving call
//!
//! The host game loop owns a [`GameTime`], feeds it the raw delta of every tick,
//! and passes it to the entity manager's update.

use serde::{Deserialize, Serialize};

/// Errors raised when a time configuration is rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimeError {
    #[error("time scale must be finite and non-negative, got {0}")]
    InvalidTimeScale(f32),

    #[error("max delta time must be finite and positive, got {0}")]
    InvalidMaxDelta(f32),
}

/// Configuration for game time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// How many in-game seconds pass per real second
    pub time_scale: f32,
    /// Maximum delta time to prevent spiral of death
    pub max_delta_time: f32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            max_delta_time: 0.25,
        }
    }
}

impl TimeConfig {
    /// Check that the configuration can drive a clock.
    pub fn validate(&self) -> Result<(), TimeError> {
        if !self.time_scale.is_finite() || self.time_scale < 0.0 {
            return Err(TimeError::InvalidTimeScale(self.time_scale));
        }
        if !self.max_delta_time.is_finite() || self.max_delta_time <= 0.0 {
            return Err(TimeError::InvalidMaxDelta(self.max_delta_time));
        }
        Ok(())
    }
}

/// Game time tracking
#[derive(Debug, Clone, Default)]
pub struct GameTime {
    /// Configuration
    pub config: TimeConfig,
    /// Time since game start in seconds
    pub total_time: f64,
    /// Delta time for this frame (clamped and scaled)
    pub delta_time: f32,
    /// Clamped but unscaled delta time
    pub unscaled_delta_time: f32,
    /// Frame counter
    pub frame_count: u64,
    /// Whether the game is paused
    pub paused: bool,
}

impl GameTime {
    /// Create a new game time with custom config
    pub fn new(config: TimeConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// A single frame snapshot with the given delta, mostly for tests.
    pub fn from_delta(delta_time: f32) -> Self {
        let mut time = Self::default();
        time.update(delta_time);
        time
    }

    /// Advance with the raw delta from the previous tick
    pub fn update(&mut self, raw_delta: f32) {
        self.unscaled_delta_time = raw_delta.max(0.0).min(self.config.max_delta_time);
        self.frame_count += 1;

        if self.paused {
            self.delta_time = 0.0;
            return;
        }

        self.delta_time = self.unscaled_delta_time * self.config.time_scale;
        self.total_time += self.delta_time as f64;
    }

    /// Pause the game
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume the game
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Set the time scale (0.0 = frozen, 1.0 = normal, 2.0 = double speed)
    pub fn set_time_scale(&mut self, scale: f32) {
        self.config.time_scale = scale.max(0.0);
    }
}
