//! Process-wide map from OPC UA source timestamps to a shared
//! [`VersionNumber`].
//!
//! Two accessors that receive data carrying the same source timestamp must
//! report the same version, since the value originated from the same write
//! on the server. Grounded in `original_source/src/VersionMapper.cc`: the
//! C++ singleton (`VersionMapper::getInstance()`) becomes a `OnceLock` here.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

/// Number of 100ns intervals between the OPC UA epoch (1601-01-01) and the
/// Unix epoch (1970-01-01), matching `UA_DATETIME_UNIX_EPOCH`.
pub(crate) const UA_DATETIME_UNIX_EPOCH: i64 = 11_644_473_600 * 10_000_000;

/// Oldest-entry eviction threshold, matching `maxSizeEventIdMap`.
const MAX_SIZE_EVENT_ID_MAP: usize = 2000;

/// A process-wide, monotonically increasing identifier for a specific
/// source timestamp. Two `VersionNumber`s compare equal only if they were
/// produced for the same raw OPC UA timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionNumber {
    sequence: u64,
    /// Unix epoch nanoseconds the source timestamp converts to.
    pub timestamp_unix_nanos: i64,
}

/// Converts a raw OPC UA `UA_DateTime` (100ns ticks since 1601-01-01) into
/// Unix epoch nanoseconds.
fn convert_to_unix_nanos(raw_timestamp: i64) -> i64 {
    (raw_timestamp - UA_DATETIME_UNIX_EPOCH) * 100
}

/// The current wall-clock time expressed as a raw OPC UA `UA_DateTime`
/// (100ns ticks since 1601-01-01), used by a synchronous read to stamp
/// `DataValue::source_timestamp` the way `UA_DateTime_now()` does.
pub fn now_as_ua_datetime() -> i64 {
    let unix_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    unix_nanos / 100 + UA_DATETIME_UNIX_EPOCH
}

#[derive(Default)]
struct VersionMapState {
    map: BTreeMap<i64, VersionNumber>,
    next_sequence: u64,
}

static VERSION_MAP: OnceLock<Mutex<VersionMapState>> = OnceLock::new();

fn state() -> &'static Mutex<VersionMapState> {
    VERSION_MAP.get_or_init(|| Mutex::new(VersionMapState::default()))
}

/// Returns the shared [`VersionNumber`] for `raw_timestamp`, creating one if
/// this is the first time the timestamp has been seen. Evicts the oldest
/// (numerically smallest) entry once the map reaches
/// [`MAX_SIZE_EVENT_ID_MAP`], matching `_versionMap.erase(_versionMap.begin())`.
pub fn get_version(raw_timestamp: i64) -> VersionNumber {
    let mut guard = state().lock().expect("version map mutex poisoned");
    if let Some(existing) = guard.map.get(&raw_timestamp) {
        return *existing;
    }
    if guard.map.len() == MAX_SIZE_EVENT_ID_MAP {
        if let Some((&oldest_key, _)) = guard.map.iter().next() {
            guard.map.remove(&oldest_key);
        }
    }
    let sequence = guard.next_sequence;
    guard.next_sequence += 1;
    let version = VersionNumber {
        sequence,
        timestamp_unix_nanos: convert_to_unix_nanos(raw_timestamp),
    };
    guard.map.insert(raw_timestamp, version);
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_timestamp_yields_same_version() {
        let a = get_version(200_000_000_000_000_123);
        let b = get_version(200_000_000_000_000_123);
        assert_eq!(a, b);
    }

    #[test]
    fn different_timestamps_yield_different_versions() {
        let a = get_version(200_000_000_000_000_001);
        let b = get_version(200_000_000_000_000_002);
        assert_ne!(a, b);
    }

    #[test]
    fn converts_to_unix_epoch_nanos() {
        // UA_DATETIME_UNIX_EPOCH itself must convert to the Unix epoch (0).
        assert_eq!(convert_to_unix_nanos(UA_DATETIME_UNIX_EPOCH), 0);
    }
}
