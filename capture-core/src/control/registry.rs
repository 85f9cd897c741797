//! Control Registry implementation
//!
//! Entries live in a fixed set of slots reserved when the engine opens, so
//! adding a watch from a running system never touches the heap. Tasks refer
//! to entries through a [`ControlHandle`] carrying the slot's generation: a
//! handle to a removed entry simply stops resolving.

use serde::{Deserialize, Serialize};

use capture_protocol::{Name, TaskId};

use super::matcher::{match_name_id, ControlKey};
use crate::error::{CaptureError, Result};

/// Maximum "by" sub-rules per control
pub const MAX_BY_RULES: usize = 32;

/// Control flag: the task's non-lifecycle events are watched
pub const CONTROL_WATCH: u32 = 1 << 0;

/// Generational reference to a control entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlHandle {
    index: u32,
    generation: u32,
}

impl ControlHandle {
    /// Decode a packed handle, 0 means none
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }

    pub fn into_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// "Trigger when coming from this task"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ByRule {
    pub name: Name,
    pub id: TaskId,
    pub trigger: u32,
}

impl ByRule {
    /// Is this the rule for the source task `from`?
    fn same_source(&self, from: ControlKey) -> bool {
        (from.name != 0 && self.name == from.name) || (from.id != 0 && self.id == from.id)
    }

    /// Does the rule select the task `(name, id)` for one of `events`?
    pub fn fires(&self, name: Name, id: TaskId, events: u32) -> bool {
        self.trigger & events != 0 && match_name_id(self.name, self.id, name, id)
    }
}

/// Watch and trigger configuration for one (name, id) key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEntry {
    pub key: ControlKey,
    pub flags: u32,
    /// Created by an explicit watch add, kept when its triggers go
    pub watch_added: bool,
    /// Events that trigger when this task is the source
    pub from_triggers: u32,
    /// Events that trigger when this task is the destination
    pub to_triggers: u32,
    /// Union of every valid by-rule's trigger mask
    pub by_triggers: u32,
    /// Bit i set when `by[i]` is in use
    pub by_valid: u32,
    pub by: [ByRule; MAX_BY_RULES],
}

impl ControlEntry {
    pub fn new(key: ControlKey) -> Self {
        Self {
            key,
            flags: 0,
            watch_added: false,
            from_triggers: 0,
            to_triggers: 0,
            by_triggers: 0,
            by_valid: 0,
            by: [ByRule::default(); MAX_BY_RULES],
        }
    }

    pub fn is_watched(&self) -> bool {
        self.flags & CONTROL_WATCH != 0
    }

    pub fn set_watch(&mut self, enable: bool) {
        if enable {
            self.flags |= CONTROL_WATCH;
        } else {
            self.flags &= !CONTROL_WATCH;
        }
    }

    /// No watch was added and no trigger is configured
    pub fn is_unused(&self) -> bool {
        !self.watch_added && self.from_triggers == 0 && self.to_triggers == 0 && self.by_valid == 0
    }

    /// Valid by-rules with their slot numbers
    pub fn by_rules(&self) -> impl Iterator<Item = (usize, &ByRule)> {
        self.by
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.by_valid & (1 << i) != 0)
    }

    /// Add `trigger` to the rule for the source task `from`
    ///
    /// A rule with the same non-zero name or the same non-zero id is
    /// extended. Otherwise the first free slot is taken.
    pub fn add_by_rule(&mut self, from: ControlKey, trigger: u32) -> Result<()> {
        let existing = self
            .by_rules()
            .find(|(_, rule)| rule.same_source(from))
            .map(|(i, _)| i);

        let slot = match existing {
            Some(i) => i,
            None => {
                let free = (0..MAX_BY_RULES)
                    .find(|i| self.by_valid & (1 << i) == 0)
                    .ok_or(CaptureError::TooManyByRules { max: MAX_BY_RULES })?;
                self.by_valid |= 1 << free;
                self.by[free] = ByRule {
                    name: from.name,
                    id: from.id,
                    trigger: 0,
                };
                free
            }
        };

        self.by[slot].trigger |= trigger;
        self.by_triggers |= trigger;
        Ok(())
    }

    /// Remove `trigger` from the rule for `from`
    ///
    /// A rule left with no trigger bits gives up its slot. Returns whether
    /// a rule was found.
    pub fn clear_by_rule(&mut self, from: ControlKey, trigger: u32) -> bool {
        let found = self
            .by_rules()
            .find(|(_, rule)| rule.same_source(from))
            .map(|(i, _)| i);

        let Some(slot) = found else {
            return false;
        };

        self.by[slot].trigger &= !trigger;
        if self.by[slot].trigger == 0 {
            self.by_valid &= !(1 << slot);
            self.by[slot] = ByRule::default();
        }
        self.by_triggers = self.by_rules().fold(0, |acc, (_, rule)| acc | rule.trigger);
        true
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<ControlEntry>,
}

/// Fixed-capacity list of control entries
///
/// Iteration order is newest first, the order in which entries are linked.
#[derive(Debug)]
pub struct ControlRegistry {
    slots: Vec<Slot>,
    order: Vec<u32>,
    free: Vec<u32>,
    capacity: usize,
}

impl ControlRegistry {
    /// Reserve room for `capacity` entries up front
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let no_memory = |_| CaptureError::NoMemory { what: "control workspace" };
        let mut slots = Vec::new();
        let mut order = Vec::new();
        let mut free = Vec::new();
        slots.try_reserve_exact(capacity).map_err(no_memory)?;
        order.try_reserve_exact(capacity).map_err(no_memory)?;
        free.try_reserve_exact(capacity).map_err(no_memory)?;
        Ok(Self {
            slots,
            order,
            free,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, handle: ControlHandle) -> Option<&ControlEntry> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, handle: ControlHandle) -> Option<&mut ControlEntry> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Entries in list order
    pub fn iter(&self) -> impl Iterator<Item = (ControlHandle, &ControlEntry)> {
        self.order.iter().filter_map(move |&index| {
            let slot = &self.slots[index as usize];
            slot.entry.as_ref().map(|entry| {
                let handle = ControlHandle {
                    index,
                    generation: slot.generation,
                };
                (handle, entry)
            })
        })
    }

    /// First entry the query `key` selects
    pub fn find(&self, key: ControlKey) -> Option<ControlHandle> {
        self.iter()
            .find(|(_, entry)| key.matches(entry.key))
            .map(|(handle, _)| handle)
    }

    /// The entry a task named `task` links to
    ///
    /// When several entries select the task, the oldest one wins.
    pub fn find_for_task(&self, task: ControlKey) -> Option<ControlHandle> {
        self.order.iter().rev().find_map(|&index| {
            let slot = &self.slots[index as usize];
            let entry = slot.entry.as_ref()?;
            entry.key.matches(task).then_some(ControlHandle {
                index,
                generation: slot.generation,
            })
        })
    }

    /// Return the matching entry, creating it when there is none
    ///
    /// The flag in the result is true when a new entry was linked.
    pub fn create(&mut self, key: ControlKey) -> Result<(ControlHandle, bool)> {
        if key.is_wildcard() {
            return Err(CaptureError::WildcardKey);
        }
        if let Some(handle) = self.find(key) {
            return Ok((handle, false));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(CaptureError::NoMemory { what: "control entry" }),
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.entry = Some(ControlEntry::new(key));
        self.order.insert(0, index);

        Ok((
            ControlHandle {
                index,
                generation: slot.generation,
            },
            true,
        ))
    }

    /// Unlink one entry
    pub fn remove(&mut self, handle: ControlHandle) -> Option<ControlEntry> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        self.order.retain(|&index| index != handle.index);
        self.free.push(handle.index);
        Some(entry)
    }

    /// Unlink every entry that, used as a pattern, selects `key`
    ///
    /// `on_removed` sees each removed handle. Returns the number removed.
    pub fn remove_matching(
        &mut self,
        key: ControlKey,
        mut on_removed: impl FnMut(ControlHandle),
    ) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.order.len() {
            let index = self.order[i];
            let slot = &mut self.slots[index as usize];
            let selected = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.key.matches(key));
            if selected {
                slot.entry = None;
                let handle = ControlHandle {
                    index,
                    generation: slot.generation,
                };
                self.order.remove(i);
                self.free.push(index);
                on_removed(handle);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Apply `update` to every entry that, used as a pattern, selects `key`
    pub fn update_matching(&mut self, key: ControlKey, mut update: impl FnMut(&mut ControlEntry)) -> usize {
        let mut updated = 0;
        for &index in &self.order {
            if let Some(entry) = self.slots[index as usize].entry.as_mut() {
                if entry.key.matches(key) {
                    update(entry);
                    updated += 1;
                }
            }
        }
        updated
    }
}
