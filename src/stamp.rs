//! Stamp Allocation and Datestamp Conversion
//!
//! A stamp is a 64-bit logical version: microseconds since the epoch by
//! convention, strictly increasing per store instance. The same value acts
//! as record version, sortable datestamp proxy and pagination cursor.
//!
//! Time is injected through `StampClock` so tests allocate from a
//! controlled clock:
//! - `SystemStampClock`: real system time
//! - `FixedStampClock`: settable/advanceable virtual time

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};

/// Logical version / datestamp proxy / pagination cursor.
pub type Stamp = u64;

/// Microseconds per second; divides a stamp back into a wall-clock datestamp.
pub const DATESTAMP_FACTOR: u64 = 1_000_000;

const ZULU_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Clock trait for stamp allocation
pub trait StampClock: Send + Sync {
    /// Current time in microseconds since the epoch
    fn now_micros(&self) -> u64;
}

/// Production clock using real system time
#[derive(Debug, Clone, Default)]
pub struct SystemStampClock;

impl StampClock for SystemStampClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX_EPOCH")
            .as_micros() as u64
    }
}

/// Virtual clock for tests; time only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct FixedStampClock {
    micros: Arc<AtomicU64>,
}

impl FixedStampClock {
    pub fn new(start_micros: u64) -> Self {
        FixedStampClock {
            micros: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl StampClock for FixedStampClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Issues strictly increasing stamps for one store instance.
///
/// The clock value is taken as-is when it moves forward; a stalled or
/// backwards clock yields `newest + 1` so allocation never repeats.
pub struct StampAllocator {
    clock: Box<dyn StampClock>,
    newest: Stamp,
}

impl StampAllocator {
    pub fn new(clock: Box<dyn StampClock>) -> Self {
        StampAllocator { clock, newest: 0 }
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemStampClock))
    }

    /// Allocate the next stamp.
    pub fn next(&mut self) -> Stamp {
        let mut stamp = self.clock.now_micros();
        if stamp <= self.newest {
            stamp = self.newest + 1;
        }
        debug_assert!(stamp > self.newest, "allocated stamp must increase");
        self.newest = stamp;
        stamp
    }

    /// Seed the allocator with a stamp seen on disk or in an import.
    pub fn observe(&mut self, stamp: Stamp) {
        if stamp > self.newest {
            self.newest = stamp;
        }
    }

    /// Newest stamp issued or observed so far (0 for a fresh store).
    pub fn newest(&self) -> Stamp {
        self.newest
    }
}

/// Parse a zulu datestamp (`YYYY-MM-DDThh:mm:ssZ`) into a stamp.
pub fn zulu_to_stamp(datestamp: &str) -> Option<Stamp> {
    let parsed = NaiveDateTime::parse_from_str(datestamp, ZULU_FORMAT).ok()?;
    let secs = parsed.and_utc().timestamp();
    if secs < 0 {
        return None;
    }
    Some(secs as u64 * DATESTAMP_FACTOR)
}

/// Render a stamp as a zulu datestamp. `precise` appends the microsecond
/// remainder, e.g. `2016-01-02T03:04:05.123456Z`.
pub fn stamp_to_zulu(stamp: Stamp, precise: bool) -> String {
    let secs = (stamp / DATESTAMP_FACTOR) as i64;
    let datetime = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    if precise {
        format!(
            "{}.{:06}Z",
            datetime.format("%Y-%m-%dT%H:%M:%S"),
            stamp % DATESTAMP_FACTOR
        )
    } else {
        datetime.format(ZULU_FORMAT).to_string()
    }
}

/// Lower bound of a selection range: 0 when absent, `u64::MAX` when the
/// value does not parse (matching an empty result, never a full scan).
pub fn from_time(oai_from: Option<&str>) -> Stamp {
    match oai_from {
        None | Some("") => 0,
        Some(datestamp) => zulu_to_stamp(datestamp).unwrap_or(u64::MAX),
    }
}

/// Exclusive upper bound of a selection range. Inclusive-until covers the
/// whole named second, so the bound is the first stamp of the next second.
pub fn until_time(oai_until: Option<&str>) -> Stamp {
    match oai_until {
        None | Some("") => u64::MAX,
        Some(datestamp) => match zulu_to_stamp(datestamp) {
            Some(stamp) => stamp.saturating_add(DATESTAMP_FACTOR),
            None => u64::MAX,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_strictly_increasing() {
        let clock = FixedStampClock::new(1000);
        let mut allocator = StampAllocator::new(Box::new(clock.clone()));

        assert_eq!(allocator.next(), 1000);
        // Clock did not move: allocation bumps past the newest stamp.
        assert_eq!(allocator.next(), 1001);
        assert_eq!(allocator.next(), 1002);

        clock.set(5000);
        assert_eq!(allocator.next(), 5000);
        assert_eq!(allocator.newest(), 5000);
    }

    #[test]
    fn test_allocator_ignores_backwards_clock() {
        let clock = FixedStampClock::new(9000);
        let mut allocator = StampAllocator::new(Box::new(clock.clone()));
        assert_eq!(allocator.next(), 9000);

        clock.set(100);
        assert_eq!(allocator.next(), 9001);
    }

    #[test]
    fn test_observe_seeds_newest() {
        let clock = FixedStampClock::new(10);
        let mut allocator = StampAllocator::new(Box::new(clock));
        allocator.observe(7777);
        allocator.observe(42);
        assert_eq!(allocator.newest(), 7777);
        assert_eq!(allocator.next(), 7778);
    }

    #[test]
    fn test_zulu_round_trip() {
        let stamp = zulu_to_stamp("2016-01-02T03:04:05Z").unwrap();
        assert_eq!(stamp % DATESTAMP_FACTOR, 0);
        assert_eq!(stamp_to_zulu(stamp, false), "2016-01-02T03:04:05Z");
        assert_eq!(
            stamp_to_zulu(stamp + 123_456, true),
            "2016-01-02T03:04:05.123456Z"
        );
    }

    #[test]
    fn test_invalid_zulu() {
        assert_eq!(zulu_to_stamp("not-a-date"), None);
        assert_eq!(zulu_to_stamp("2016-01-02"), None);
    }

    #[test]
    fn test_range_bounds() {
        assert_eq!(from_time(None), 0);
        assert_eq!(from_time(Some("")), 0);
        assert_eq!(from_time(Some("garbage")), u64::MAX);
        assert_eq!(until_time(None), u64::MAX);

        let from = from_time(Some("2016-01-02T03:04:05Z"));
        let until = until_time(Some("2016-01-02T03:04:05Z"));
        // Inclusive-until spans the entire named second.
        assert_eq!(until - from, DATESTAMP_FACTOR);
    }
}
