//! OTA / File Transfer Engine (spec.md §4.5): chunked, CRC-validated
//! transfer in both directions.

pub mod inbound;
pub mod outbound;

use std::time::Duration;

/// Default chunk size when the peer's UpdateBegin requests 0 (spec.md
/// §4.5 "Inbound" payload layout).
pub const DEFAULT_CHUNK_SIZE: u32 = 256;

/// Fixed teardown window for fast-OTA missed-chunk recovery (spec.md §9
/// open question 5: no upper bound on recovery rounds, window itself is
/// fixed regardless of file size).
pub const FAST_OTA_RECOVERY_WINDOW: Duration = Duration::from_secs(9);
