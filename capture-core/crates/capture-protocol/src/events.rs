//! Record event bits
//!
//! The low 16 bits of a record's event word carry the task's real priority
//! (bits 0-7) and current priority (bits 8-15). Event bits live above them.

pub const REAL_PRIORITY_MASK: u32 = 0x0000_00ff;
pub const CURRENT_PRIORITY_MASK: u32 = 0x0000_ff00;
pub const CURRENT_PRIORITY_SHIFT: u32 = 8;

pub const CREATED_BY: u32 = 1 << 16;
pub const CREATED: u32 = 1 << 17;
pub const STARTED_BY: u32 = 1 << 18;
pub const STARTED: u32 = 1 << 19;
pub const RESTARTED_BY: u32 = 1 << 20;
pub const RESTARTED: u32 = 1 << 21;
pub const DELETED_BY: u32 = 1 << 22;
pub const DELETED: u32 = 1 << 23;
pub const TERMINATED: u32 = 1 << 24;
pub const BEGIN: u32 = 1 << 25;
pub const EXITTED: u32 = 1 << 26;
pub const SWITCHED_OUT: u32 = 1 << 27;
pub const SWITCHED_IN: u32 = 1 << 28;
pub const TIMESTAMP: u32 = 1 << 29;

/// Bit index of the first event
pub const EVENT_START: u32 = 16;
/// Bit index of the last event
pub const EVENT_END: u32 = 29;

/// Every event bit
pub const EVENT_MASK: u32 = ((1 << (EVENT_END + 1)) - 1) & !((1 << EVENT_START) - 1);

/// Task lifecycle events
///
/// These are recorded for any task once capture has triggered, without
/// consulting the priority window or the watch flags.
pub const LIFECYCLE_EVENTS: u32 = CREATED_BY
    | CREATED
    | STARTED_BY
    | STARTED
    | RESTARTED_BY
    | RESTARTED
    | DELETED_BY
    | DELETED
    | TERMINATED
    | BEGIN
    | EXITTED;

const EVENT_TEXT: [&str; (EVENT_END - EVENT_START + 1) as usize] = [
    "CREATED_BY",
    "CREATED",
    "STARTED_BY",
    "STARTED",
    "RESTARTED_BY",
    "RESTARTED",
    "DELETED_BY",
    "DELETED",
    "TERMINATED",
    "BEGIN",
    "EXITTED",
    "SWITCHED_OUT",
    "SWITCHED_IN",
    "TIMESTAMP",
];

/// Name of the event at bit index `bit`
pub fn event_text(bit: u32) -> &'static str {
    if (EVENT_START..=EVENT_END).contains(&bit) {
        EVENT_TEXT[(bit - EVENT_START) as usize]
    } else {
        "invalid event id"
    }
}

/// Names of every event bit set in `events`, lowest bit first
pub fn event_names(events: u32) -> impl Iterator<Item = &'static str> {
    (EVENT_START..=EVENT_END)
        .filter(move |bit| events & (1 << bit) != 0)
        .map(event_text)
}
