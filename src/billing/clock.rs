//! Wall-clock source and calendar windows.
//!
//! Ledger timestamps are stored as epoch milliseconds (UTC). Quota windows
//! are anchored to calendar day/month boundaries in a [`WindowZone`].

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;

/// Source of "now" for the billing core.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Time zone in which day/month windows start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowZone {
    /// Process-local zone.
    Local,
    /// Fixed IANA zone.
    Named(Tz),
}

impl WindowZone {
    /// Parse a zone name; `None`, empty or `"local"` means [`WindowZone::Local`].
    pub fn parse(name: Option<&str>) -> Result<Self, String> {
        match name.map(str::trim) {
            None | Some("") => Ok(Self::Local),
            Some(n) if n.eq_ignore_ascii_case("local") => Ok(Self::Local),
            Some(n) => n
                .parse::<Tz>()
                .map(Self::Named)
                .map_err(|_| format!("unknown time zone: {n}")),
        }
    }

    /// `[start, end)` of the calendar day containing `now`, in epoch millis.
    pub fn day_bounds(&self, now: DateTime<Utc>) -> (i64, i64) {
        match self {
            Self::Local => day_bounds_in(&chrono::Local, now),
            Self::Named(tz) => day_bounds_in(tz, now),
        }
    }

    /// `[start, end)` of the calendar month containing `now`, in epoch millis.
    pub fn month_bounds(&self, now: DateTime<Utc>) -> (i64, i64) {
        match self {
            Self::Local => month_bounds_in(&chrono::Local, now),
            Self::Named(tz) => month_bounds_in(tz, now),
        }
    }
}

fn day_bounds_in<Z: TimeZone>(zone: &Z, now: DateTime<Utc>) -> (i64, i64) {
    let today = now.with_timezone(zone).date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);
    (midnight_millis(zone, today), midnight_millis(zone, tomorrow))
}

fn month_bounds_in<Z: TimeZone>(zone: &Z, now: DateTime<Utc>) -> (i64, i64) {
    let today = now.with_timezone(zone).date_naive();
    let first = today.with_day(1).unwrap_or(today);
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .unwrap_or(first);
    (midnight_millis(zone, first), midnight_millis(zone, next))
}

/// Epoch millis of the first instant of `date` in `zone`.
///
/// Zones that skip midnight (DST jumps) resolve to the earliest valid
/// instant of that day.
fn midnight_millis<Z: TimeZone>(zone: &Z, date: NaiveDate) -> i64 {
    let mut naive = date.and_time(chrono::NaiveTime::MIN);
    for _ in 0..4 {
        match zone.from_local_datetime(&naive) {
            LocalResult::Single(t) => return t.timestamp_millis(),
            LocalResult::Ambiguous(earliest, _) => return earliest.timestamp_millis(),
            LocalResult::None => naive += chrono::Duration::hours(1),
        }
    }
    naive.and_utc().timestamp_millis()
}
