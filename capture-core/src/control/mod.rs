//! Control Registry - watch and trigger configuration
//!
//! One [`ControlEntry`] exists per configured (name, id) key. Tasks link to
//! the entry that selects them when they are first seen, and again whenever
//! a new entry is created that selects a task with no link yet.
//!
//! ```text
//!   watch_add / set_trigger          task hooks
//!            │                            │
//!            ▼                            ▼
//!   ┌───────────────────┐  handle  ┌─────────────┐
//!   │  ControlRegistry  │◄─────────│ CaptureSlot │
//!   │  [entry][entry].. │          │ (per task)  │
//!   └───────────────────┘          └─────────────┘
//! ```

mod matcher;
mod registry;

pub use matcher::{match_name_id, ControlKey};
pub use registry::{
    ByRule, ControlEntry, ControlHandle, ControlRegistry, CONTROL_WATCH, MAX_BY_RULES,
};

use serde::{Deserialize, Serialize};

/// Printable view of a control entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlInfo {
    pub key: ControlKey,
    pub watch: bool,
    pub from_triggers: u32,
    pub to_triggers: u32,
    pub by_triggers: u32,
    pub by: Vec<ByRule>,
}

impl From<&ControlEntry> for ControlInfo {
    fn from(entry: &ControlEntry) -> Self {
        Self {
            key: entry.key,
            watch: entry.is_watched(),
            from_triggers: entry.from_triggers,
            to_triggers: entry.to_triggers,
            by_triggers: entry.by_triggers,
            by: entry.by_rules().map(|(_, rule)| *rule).collect(),
        }
    }
}
