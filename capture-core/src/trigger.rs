//! Trigger Engine - when does recording start, and what gets recorded
//!
//! Capture starts [`TriggerState::Armed`]. The first observed transition
//! that matches a configured rule latches it to
//! [`TriggerState::Triggered`], where it stays until a flush re-arms it:
//!
//! ```text
//!            rule fires                     flush(rearm)
//!   Armed ───────────────► Triggered ──────────────────► Armed
//!                            │    ▲
//!                            └────┘ every later event
//! ```
//!
//! Rules are checked in a fixed order. A "to any" rule on the source task
//! or a "from any" rule on the destination fires first; only when neither
//! does are the destination's "from to" by-rules consulted.
//!
//! Independently, [`Filter`] decides per record whether a triggered engine
//! writes it at all.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use capture_protocol::Priority;

use crate::control::{ControlEntry, ControlKey};

pub const SWITCH: u32 = 1 << 0;
pub const CREATE: u32 = 1 << 1;
pub const START: u32 = 1 << 2;
pub const RESTART: u32 = 1 << 3;
pub const DELETE: u32 = 1 << 4;
pub const BEGIN: u32 = 1 << 5;
pub const EXITTED: u32 = 1 << 6;
pub const TERMINATED: u32 = 1 << 7;

/// Events that have a distinct source task
pub const FROM_TRIGGERS: u32 = SWITCH | CREATE | START | RESTART | DELETE;

/// Events that have a destination task
pub const TO_TRIGGERS: u32 = FROM_TRIGGERS | BEGIN | EXITTED | TERMINATED;

/// The kind of transition a trigger watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Switch,
    Create,
    Start,
    Restart,
    Delete,
    Begin,
    Exitted,
    Terminated,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 8] = [
        TriggerKind::Switch,
        TriggerKind::Create,
        TriggerKind::Start,
        TriggerKind::Restart,
        TriggerKind::Delete,
        TriggerKind::Begin,
        TriggerKind::Exitted,
        TriggerKind::Terminated,
    ];

    pub fn mask(self) -> u32 {
        match self {
            TriggerKind::Switch => SWITCH,
            TriggerKind::Create => CREATE,
            TriggerKind::Start => START,
            TriggerKind::Restart => RESTART,
            TriggerKind::Delete => DELETE,
            TriggerKind::Begin => BEGIN,
            TriggerKind::Exitted => EXITTED,
            TriggerKind::Terminated => TERMINATED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Switch => "switch",
            TriggerKind::Create => "create",
            TriggerKind::Start => "start",
            TriggerKind::Restart => "restart",
            TriggerKind::Delete => "delete",
            TriggerKind::Begin => "begin",
            TriggerKind::Exitted => "exitted",
            TriggerKind::Terminated => "terminated",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown trigger kind '{}'", s))
    }
}

/// Which side of a transition a trigger is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Any transition out of the source task
    ToAny,
    /// Any transition into the destination task
    FromAny,
    /// Transitions from the source task into the destination task
    FromTo,
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "to_any" => Ok(TriggerMode::ToAny),
            "from_any" => Ok(TriggerMode::FromAny),
            "from_to" => Ok(TriggerMode::FromTo),
            other => Err(format!("unknown trigger mode '{}'", other)),
        }
    }
}

/// One end of an observed transition
#[derive(Debug, Clone, Copy)]
pub struct Party<'a> {
    /// The task's own name and id
    pub task: ControlKey,
    /// The control entry the task is linked to
    pub control: Option<&'a ControlEntry>,
}

/// Edge-latched trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    #[default]
    Armed,
    Triggered,
}

impl TriggerState {
    pub fn is_triggered(self) -> bool {
        self == TriggerState::Triggered
    }

    pub fn rearm(&mut self) {
        *self = TriggerState::Armed;
    }

    /// Observe a transition from `from` to `to` carrying `events`
    ///
    /// Returns whether the engine is triggered afterwards.
    pub fn evaluate(&mut self, from: Option<Party<'_>>, to: Option<Party<'_>>, events: u32) -> bool {
        if self.is_triggered() {
            return true;
        }

        let from_control = from.and_then(|p| p.control);
        let to_control = to.and_then(|p| p.control);

        let from_events = from_control.map_or(0, |c| c.from_triggers & events);
        let to_events = to_control.map_or(0, |c| c.to_triggers & events);
        if from_events | to_events != 0 {
            *self = TriggerState::Triggered;
            return true;
        }

        if let Some(tc) = to_control {
            if tc.by_valid != 0 && tc.by_triggers & events != 0 {
                let source = from.map_or(ControlKey::default(), |p| p.task);
                if tc
                    .by_rules()
                    .any(|(_, rule)| rule.fires(source.name, source.id, events))
                {
                    *self = TriggerState::Triggered;
                    return true;
                }
            }
        }

        false
    }
}

/// Inclusive priority range of tasks whose events may be recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWindow {
    pub ceiling: Priority,
    pub floor: Priority,
}

impl PriorityWindow {
    pub fn contains(&self, priority: Priority) -> bool {
        self.ceiling <= priority && priority <= self.floor
    }
}

impl Default for PriorityWindow {
    fn default() -> Self {
        Self {
            ceiling: 0,
            floor: 255,
        }
    }
}

/// Per-record recording decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub window: PriorityWindow,
    pub global_watch: bool,
    pub monitor_only: bool,
    /// Events recorded regardless of window and watch
    pub always_on: u32,
}

impl Filter {
    pub fn admits(&self, state: TriggerState, real_priority: Priority, watched: bool, events: u32) -> bool {
        if self.monitor_only || !state.is_triggered() {
            return false;
        }
        if events & self.always_on != 0 {
            return true;
        }
        self.window.contains(real_priority) && (self.global_watch || watched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_protocol::events::{LIFECYCLE_EVENTS, RESTARTED, SWITCHED_IN};

    const TA: u32 = 0x5441_2020;
    const TB: u32 = 0x5442_2020;

    fn party(task: ControlKey, control: Option<&ControlEntry>) -> Option<Party<'_>> {
        Some(Party { task, control })
    }

    #[test]
    fn test_armed_without_rules() {
        let mut state = TriggerState::default();
        let a = ControlKey::new(TA, 1);
        assert!(!state.evaluate(party(a, None), party(a, None), SWITCH));
        assert_eq!(state, TriggerState::Armed);
    }

    #[test]
    fn test_to_any_fires_on_source() {
        let mut from = ControlEntry::new(ControlKey::by_name(TA));
        from.from_triggers = SWITCH;
        let mut state = TriggerState::Armed;

        assert!(!state.evaluate(party(ControlKey::new(TA, 1), Some(&from)), None, CREATE));
        assert!(state.evaluate(party(ControlKey::new(TA, 1), Some(&from)), None, SWITCH));
        assert!(state.is_triggered());
    }

    #[test]
    fn test_from_any_fires_on_destination() {
        let mut to = ControlEntry::new(ControlKey::by_name(TB));
        to.to_triggers = BEGIN;
        let mut state = TriggerState::Armed;
        assert!(state.evaluate(None, party(ControlKey::new(TB, 2), Some(&to)), BEGIN));
    }

    #[test]
    fn test_from_to_needs_matching_source() {
        let mut to = ControlEntry::new(ControlKey::by_name(TB));
        to.add_by_rule(ControlKey::by_name(TA), RESTART).unwrap();
        let b = ControlKey::new(TB, 2);

        let mut state = TriggerState::Armed;
        assert!(!state.evaluate(party(ControlKey::new(TB, 3), None), party(b, Some(&to)), RESTART));
        assert!(!state.evaluate(party(ControlKey::new(TA, 1), None), party(b, Some(&to)), SWITCH));
        assert!(state.evaluate(party(ControlKey::new(TA, 1), None), party(b, Some(&to)), RESTART));
    }

    #[test]
    fn test_latch_is_sticky_until_rearm() {
        let mut from = ControlEntry::new(ControlKey::by_name(TA));
        from.from_triggers = SWITCH;
        let mut state = TriggerState::Armed;
        assert!(state.evaluate(party(ControlKey::new(TA, 1), Some(&from)), None, SWITCH));

        // nothing configured matches any more, still triggered
        assert!(state.evaluate(None, None, CREATE));
        assert!(state.evaluate(None, None, 0));

        state.rearm();
        assert!(!state.evaluate(None, None, SWITCH));
    }

    #[test]
    fn test_filter_window_and_watch() {
        let filter = Filter {
            window: PriorityWindow { ceiling: 10, floor: 20 },
            global_watch: false,
            monitor_only: false,
            always_on: LIFECYCLE_EVENTS,
        };
        let triggered = TriggerState::Triggered;
        assert!(!filter.admits(triggered, 15, false, SWITCHED_IN));
        assert!(filter.admits(triggered, 15, true, SWITCHED_IN));
        assert!(!filter.admits(triggered, 25, true, SWITCHED_IN));
        assert!(filter.admits(triggered, 25, false, RESTARTED));
        assert!(!filter.admits(TriggerState::Armed, 15, true, RESTARTED));

        let global = Filter { global_watch: true, ..filter };
        assert!(global.admits(triggered, 10, false, SWITCHED_IN));
        assert!(global.admits(triggered, 20, false, SWITCHED_IN));
        assert!(!global.admits(triggered, 9, false, SWITCHED_IN));
    }

    #[test]
    fn test_filter_monitor_only_suppresses_everything() {
        let filter = Filter {
            window: PriorityWindow::default(),
            global_watch: true,
            monitor_only: true,
            always_on: LIFECYCLE_EVENTS,
        };
        assert!(!filter.admits(TriggerState::Triggered, 1, true, RESTARTED));
        assert!(!filter.admits(TriggerState::Triggered, 1, true, SWITCHED_IN));
    }

    #[test]
    fn test_parse_kinds_and_modes() {
        assert_eq!("restart".parse::<TriggerKind>(), Ok(TriggerKind::Restart));
        assert_eq!("SWITCH".parse::<TriggerKind>(), Ok(TriggerKind::Switch));
        assert!("bogus".parse::<TriggerKind>().is_err());
        assert_eq!("from-to".parse::<TriggerMode>(), Ok(TriggerMode::FromTo));
        assert_eq!("to_any".parse::<TriggerMode>(), Ok(TriggerMode::ToAny));
        assert_eq!(TriggerKind::Terminated.mask() & FROM_TRIGGERS, 0);
        assert_eq!(TriggerKind::ALL.iter().fold(0, |m, k| m | k.mask()), TO_TRIGGERS);
    }
}
