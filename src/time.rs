//! Time and delay functions
//!
//! Delays and deadlines for the transport retry loop, plus conversion between
//! Unix time and the packed date/time fields stored in FAT directory entries.
//! FAT stores local time without a zone; this crate treats it as UTC.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Sleep the calling thread for `ms` milliseconds
#[inline]
pub fn delay_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// A deadline-based timeout for retry loops
///
/// # Example
///
/// ```ignore
/// let timeout = Timeout::from_ms(10_000);
/// while !timeout.is_expired() {
///     if try_command().is_ok() {
///         return Ok(());
///     }
///     delay_ms(100);
/// }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    start: Instant,
    deadline: Instant,
}

impl Timeout {
    /// Create a timeout that expires after `ms` milliseconds
    #[inline]
    pub fn from_ms(ms: u64) -> Self {
        let start = Instant::now();
        Self {
            start,
            deadline: start + Duration::from_millis(ms),
        }
    }

    /// Check if the timeout has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Milliseconds since the timeout was armed
    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// FAT directory entries cannot represent anything before 1980-01-01
const FAT_EPOCH_UNIX_MS: u64 = 315_532_800_000;

/// A packed FAT timestamp
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FatTimestamp {
    /// bits 15-9 year since 1980, 8-5 month, 4-0 day
    pub date: u16,
    /// bits 15-11 hours, 10-5 minutes, 4-0 seconds / 2
    pub time: u16,
    /// 10 ms units, 0-199 (only stored for creation time)
    pub tenths: u8,
}

impl FatTimestamp {
    /// Encode Unix milliseconds; times before 1980 clamp to the FAT epoch.
    pub fn from_unix_ms(ms: u64) -> Self {
        let ms = ms.max(FAT_EPOCH_UNIX_MS);
        let secs = ms / 1000;
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;

        let (year, month, day) = civil_from_days(days);
        let hours = (rem / 3600) as u16;
        let minutes = ((rem % 3600) / 60) as u16;
        let seconds = (rem % 60) as u16;

        let year_off = (year - 1980).clamp(0, 127) as u16;
        Self {
            date: (year_off << 9) | ((month as u16) << 5) | day as u16,
            time: (hours << 11) | (minutes << 5) | (seconds / 2),
            tenths: (((seconds % 2) * 1000 + (ms % 1000) as u16) / 10) as u8,
        }
    }

    /// Decode to Unix milliseconds. A zero date decodes to 0.
    pub fn to_unix_ms(self) -> u64 {
        if self.date == 0 {
            return 0;
        }
        let year = 1980 + (self.date >> 9) as i64;
        let month = ((self.date >> 5) & 0x0F).clamp(1, 12) as u32;
        let day = (self.date & 0x1F).max(1) as u32;
        let hours = (self.time >> 11) as u64;
        let minutes = ((self.time >> 5) & 0x3F) as u64;
        let seconds = ((self.time & 0x1F) * 2) as u64;

        let days = days_from_civil(year, month, day) as u64;
        let secs = days * 86_400 + hours * 3600 + minutes * 60 + seconds;
        secs * 1000 + self.tenths as u64 * 10
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`]
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}
