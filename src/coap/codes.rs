//! URI first-segment codes (spec.md §6 "Wire format" table).

pub const HELLO: &str = "h";
pub const DESCRIBE: &str = "d";
pub const FUNCTION: &str = "f";
pub const VARIABLE: &str = "v";
pub const PUBLIC_EVENT: &str = "e";
pub const PRIVATE_EVENT: &str = "E";
pub const SIGNAL_START: &str = "s";
pub const GET_TIME: &str = "t";
pub const UPDATE: &str = "u";
pub const CHUNK: &str = "c";
pub const FILE_REQUEST: &str = "g";
pub const UPDATE_PROPERTY: &str = "p";

/// Reserved event-name prefixes that are never surfaced to the user event
/// bus even though they are sent/received on the wire (spec.md §3 invariant).
pub const RESERVED_EVENT_PREFIXES: &[&str] = &["iotready", "trackle"];

pub fn has_reserved_prefix(event_name: &str) -> bool {
    RESERVED_EVENT_PREFIXES
        .iter()
        .any(|p| event_name.starts_with(p))
}
