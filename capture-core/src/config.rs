//! Engine configuration
//!
//! ```rust
//! use capture_core::CaptureConfig;
//!
//! let config = CaptureConfig::default()
//!     .with_capacity(16 * 1024)
//!     .with_window(10, 20)
//!     .with_global_watch(true);
//! assert_eq!(config.ceiling, 10);
//!
//! let loaded = CaptureConfig::from_json(r#"{ "max_controls": 8 }"#).unwrap();
//! assert_eq!(loaded.max_controls, 8);
//! assert_eq!(loaded.floor, 255);
//! ```

use serde::{Deserialize, Serialize};

use capture_protocol::Priority;

use crate::error::Result;

/// Configuration applied when the engine opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Buffer size in bytes used by `open_default`
    pub capacity: usize,
    /// Control entries reserved at open
    pub max_controls: usize,
    /// Most important priority that is recorded
    pub ceiling: Priority,
    /// Least important priority that is recorded
    pub floor: Priority,
    /// Record every task in the window, watched or not
    pub global_watch: bool,
    /// Record lifecycle events without consulting window and watch
    pub always_record_lifecycle: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            max_controls: 64,
            ceiling: 0,
            floor: 255,
            global_watch: false,
            always_record_lifecycle: true,
        }
    }
}

impl CaptureConfig {
    /// Small footprint for tests
    pub fn minimal() -> Self {
        Self {
            capacity: 4096,
            max_controls: 8,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_controls(mut self, max_controls: usize) -> Self {
        self.max_controls = max_controls;
        self
    }

    pub fn with_window(mut self, ceiling: Priority, floor: Priority) -> Self {
        self.ceiling = ceiling;
        self.floor = floor;
        self
    }

    pub fn with_global_watch(mut self, enable: bool) -> Self {
        self.global_watch = enable;
        self
    }

    pub fn with_lifecycle_always_recorded(mut self, enable: bool) -> Self {
        self.always_record_lifecycle = enable;
        self
    }
}
