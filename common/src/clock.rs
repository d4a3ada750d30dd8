//! Wall-clock estimation for a device with no RTC and no OS calendar.
//!
//! Calendar fields are derived arithmetically from the unix second count:
//! leap years are counted as whole 4-year blocks since 2017 with no
//! century correction, so the derivation is only valid from 2019 until 2100.
//! The deployed fleet's stored timestamps and printed output depend on this
//! exact arithmetic; do not "fix" it.

use crate::config::ClockConfig;

/// Retry cadence before the first successful sync.
const FIRST_SYNC_RETRY_MS: u64 = 5_000;

/// Poll cadence inside the blocking `begin` loop.
const BEGIN_POLL_MS: u64 = 50;

const UNIX_JAN_1_2017: u32 = 1_483_228_800;
const UNIX_JAN_1_2019: u32 = 1_546_300_800;
const SECONDS_PER_4_YEARS: u32 = 126_230_400;
const SECONDS_PER_YEAR: u32 = 31_536_000;
const SECONDS_PER_DAY: u32 = 86_400;

/// Cumulative day-of-year at each month's end, February onward (non-leap).
const MONTH_END_DOY: [u16; 11] = [59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 366];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

// Jan 1 2019 was a Tuesday.
const DAY_NAMES: [&str; 7] = [
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
    "Monday",
];

const SENTINEL_TIMESTAMP: &str = "####/##/##-##:##:##";
const SENTINEL_DATE_TIME: &str = "### ### ##, #### - ##:####";

/// One answer from a remote time authority. `utc_offset_seconds` is present
/// when the authority reports the caller's timezone (worldtimeapi does,
/// plain NTP does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReading {
    pub unix_seconds: u32,
    pub utc_offset_seconds: Option<i32>,
}

/// Transport seam for time sync. Requests are fire-and-forget over an
/// unreliable transport; a lost response simply means the next periodic
/// attempt tries again.
pub trait TimeAuthority {
    fn send_request(&mut self);
    fn poll_response(&mut self) -> Option<TimeReading>;
}

/// Monotonically-advancing estimate of local wall-clock time, refreshed
/// periodically from a `TimeAuthority`. Tolerates being queried before any
/// sync: accessors return sentinel placeholders instead of panicking.
pub struct MachineClock<A: TimeAuthority> {
    authority: A,
    config: ClockConfig,
    tz_offset_seconds: i32,
    last_synced_unix: u32,
    synced_at_ms: u64,
    last_request_ms: Option<u64>,
    has_synced: bool,
}

impl<A: TimeAuthority> MachineClock<A> {
    pub fn new(authority: A, mut config: ClockConfig) -> Self {
        config.sanitize();
        let tz_offset_seconds = config.timezone_offset_minutes * 60;
        Self {
            authority,
            config,
            tz_offset_seconds,
            last_synced_unix: 0,
            synced_at_ms: 0,
            last_request_ms: None,
            has_synced: false,
        }
    }

    pub fn has_synced(&self) -> bool {
        self.has_synced
    }

    pub fn tz_offset_seconds(&self) -> i32 {
        self.tz_offset_seconds
    }

    /// Blocks the calling thread until a sync succeeds or `timeout_ms`
    /// elapses, polling the authority at a short cadence. Run after a network
    /// connection is established; returns whether a valid time exists.
    pub fn begin(&mut self, timeout_ms: u64, mut now_ms: impl FnMut() -> u64) -> bool {
        if self.has_synced {
            return true;
        }

        let started = now_ms();
        loop {
            if self.handle(now_ms()) {
                return true;
            }
            if now_ms().saturating_sub(started) >= timeout_ms {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(BEGIN_POLL_MS));
        }
    }

    /// Must be called every loop iteration. Sends a sync request whenever the
    /// retry interval has elapsed (short before the first sync, the
    /// configured interval after) and consumes at most one pending response.
    /// Returns whether a valid time estimate exists.
    pub fn handle(&mut self, now_ms: u64) -> bool {
        let interval_ms = if self.has_synced {
            u64::from(self.config.sync_interval_s) * 1_000
        } else {
            FIRST_SYNC_RETRY_MS
        };

        let due = match self.last_request_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
        };
        if due {
            self.last_request_ms = Some(now_ms);
            self.authority.send_request();
        }

        if let Some(reading) = self.authority.poll_response() {
            if let Some(offset) = reading.utc_offset_seconds {
                self.tz_offset_seconds = offset;
            }
            self.last_synced_unix = apply_offset(reading.unix_seconds, self.tz_offset_seconds);
            self.synced_at_ms = now_ms;
            self.has_synced = true;
        }

        self.has_synced
    }

    /// Current local unix time: the last synced second plus elapsed uptime.
    pub fn unix_time(&self, now_ms: u64) -> u32 {
        let elapsed_s = now_ms.saturating_sub(self.synced_at_ms) / 1_000;
        self.last_synced_unix.saturating_add(elapsed_s as u32)
    }

    pub fn year(&self, now_ms: u64) -> Option<u16> {
        self.has_synced.then(|| year_of(self.unix_time(now_ms)))
    }

    pub fn month_number(&self, now_ms: u64, add_zero: bool) -> String {
        match self.has_synced {
            true => pad(month_of(self.unix_time(now_ms)) as u16, add_zero),
            false => "##".to_string(),
        }
    }

    pub fn month_name(&self, now_ms: u64, short: bool) -> String {
        if !self.has_synced {
            return "###".to_string();
        }
        let name = MONTH_NAMES[usize::from(month_of(self.unix_time(now_ms))) - 1];
        if short {
            name[..3].to_string()
        } else {
            name.to_string()
        }
    }

    pub fn day_of_month(&self, now_ms: u64, add_zero: bool) -> String {
        match self.has_synced {
            true => pad(day_of_month_of(self.unix_time(now_ms)) as u16, add_zero),
            false => "##".to_string(),
        }
    }

    pub fn day_of_week(&self, now_ms: u64, short: bool) -> String {
        if !self.has_synced {
            return "###".to_string();
        }
        let name = weekday_of(self.unix_time(now_ms));
        if short {
            name[..3].to_string()
        } else {
            name.to_string()
        }
    }

    pub fn hour(&self, now_ms: u64, add_zero: bool, format_24_hour: bool) -> String {
        match self.has_synced {
            true => pad(
                hour_display(self.unix_time(now_ms), format_24_hour) as u16,
                add_zero,
            ),
            false => "##".to_string(),
        }
    }

    pub fn minute(&self, now_ms: u64, add_zero: bool) -> String {
        match self.has_synced {
            true => pad(minute_of(self.unix_time(now_ms)) as u16, add_zero),
            false => "##".to_string(),
        }
    }

    pub fn second(&self, now_ms: u64, add_zero: bool) -> String {
        match self.has_synced {
            true => pad(second_of(self.unix_time(now_ms)) as u16, add_zero),
            false => "##".to_string(),
        }
    }

    pub fn am_pm(&self, now_ms: u64) -> String {
        match self.has_synced {
            true => am_pm_of(self.unix_time(now_ms)).to_string(),
            false => "##".to_string(),
        }
    }

    /// `"Tue Jan 1, 2019 - 12:00AM"`, or the blank placeholder before the
    /// first sync.
    pub fn date_time(&self, now_ms: u64) -> String {
        match self.has_synced {
            true => format_date_time(self.unix_time(now_ms)),
            false => SENTINEL_DATE_TIME.to_string(),
        }
    }

    /// `"2019/01/01-00:00:00"`, or the blank placeholder before the first
    /// sync.
    pub fn timestamp(&self, now_ms: u64) -> String {
        match self.has_synced {
            true => format_timestamp(self.unix_time(now_ms)),
            false => SENTINEL_TIMESTAMP.to_string(),
        }
    }

    /// Reformats an externally supplied UTC timestamp (e.g. the relay's
    /// `time:` field) into the long date-time form, applying the configured
    /// timezone offset. Independent of the sync state.
    pub fn format_external(&self, unix_seconds: u32) -> String {
        format_date_time(apply_offset(unix_seconds, self.tz_offset_seconds))
    }
}

/// Parses a worldtimeapi.org `ip.txt` body into a reading. Returns None when
/// either the `unixtime:` or `utc_offset:` line is missing or malformed.
pub fn parse_world_time_text(body: &str) -> Option<TimeReading> {
    let unix_seconds = field_value(body, "unixtime: ")?.trim().parse::<u32>().ok()?;

    // utc_offset looks like "-08:00" or "+05:30"; minutes inherit the sign
    // of the hours.
    let offset_text = field_value(body, "utc_offset: ")?.trim();
    let hours = offset_text.get(0..3)?.parse::<i32>().ok()?;
    let minutes = offset_text.get(4..6)?.parse::<i32>().ok()?;
    let mut offset = hours * 3_600;
    if offset >= 0 {
        offset += minutes * 60;
    } else {
        offset -= minutes * 60;
    }

    Some(TimeReading {
        unix_seconds,
        utc_offset_seconds: Some(offset),
    })
}

fn field_value<'a>(body: &'a str, marker: &str) -> Option<&'a str> {
    let start = body.find(marker)? + marker.len();
    let rest = &body[start..];
    Some(rest.split('\n').next().unwrap_or(rest))
}

fn apply_offset(unix_seconds: u32, offset_seconds: i32) -> u32 {
    (i64::from(unix_seconds) + i64::from(offset_seconds)).clamp(0, i64::from(u32::MAX)) as u32
}

fn leap_years_since_2017(unix: u32) -> u32 {
    unix.saturating_sub(UNIX_JAN_1_2017) / SECONDS_PER_4_YEARS
}

fn year_of(unix: u32) -> u16 {
    let since_2019 = unix
        .saturating_sub(UNIX_JAN_1_2019)
        .saturating_sub(leap_years_since_2017(unix) * SECONDS_PER_DAY);
    (since_2019 / SECONDS_PER_YEAR) as u16 + 2019
}

fn day_of_year(unix: u32) -> u16 {
    let year_start = UNIX_JAN_1_2019
        + u32::from(year_of(unix) - 2019) * SECONDS_PER_YEAR
        + leap_years_since_2017(unix) * SECONDS_PER_DAY;
    (unix.saturating_sub(year_start) / SECONDS_PER_DAY) as u16 + 1
}

/// Day-of-year shifted back one day after a leap February, so the non-leap
/// month table applies. January compares against the raw count.
fn adjusted_day_of_year(unix: u32) -> u16 {
    let doy = day_of_year(unix);
    if year_of(unix) % 4 == 0 {
        doy.saturating_sub(1)
    } else {
        doy
    }
}

fn month_of(unix: u32) -> u8 {
    if day_of_year(unix) <= 31 {
        return 1;
    }
    let adjusted = adjusted_day_of_year(unix);
    for (index, threshold) in MONTH_END_DOY.iter().enumerate() {
        if adjusted <= *threshold {
            return index as u8 + 2;
        }
    }
    12
}

fn day_of_month_of(unix: u32) -> u8 {
    match month_of(unix) {
        1 => day_of_year(unix) as u8,
        2 => (day_of_year(unix) - 31) as u8,
        month => (adjusted_day_of_year(unix) - MONTH_END_DOY[usize::from(month) - 3]) as u8,
    }
}

fn weekday_of(unix: u32) -> &'static str {
    let days = unix.saturating_sub(UNIX_JAN_1_2019) / SECONDS_PER_DAY;
    DAY_NAMES[(days % 7) as usize]
}

fn hour_of(unix: u32) -> u8 {
    (unix / 3_600 % 24) as u8
}

fn hour_display(unix: u32, format_24_hour: bool) -> u8 {
    let hour = hour_of(unix);
    if format_24_hour {
        hour
    } else if hour == 0 {
        12
    } else if hour <= 12 {
        hour
    } else {
        hour - 12
    }
}

fn minute_of(unix: u32) -> u8 {
    (unix / 60 % 60) as u8
}

fn second_of(unix: u32) -> u8 {
    (unix % 60) as u8
}

fn am_pm_of(unix: u32) -> &'static str {
    if hour_of(unix) <= 11 {
        "AM"
    } else {
        "PM"
    }
}

fn pad(value: u16, add_zero: bool) -> String {
    if add_zero && value <= 9 {
        format!("0{value}")
    } else {
        value.to_string()
    }
}

fn format_date_time(unix: u32) -> String {
    format!(
        "{} {} {}, {} - {}:{}{}",
        &weekday_of(unix)[..3],
        &MONTH_NAMES[usize::from(month_of(unix)) - 1][..3],
        day_of_month_of(unix),
        year_of(unix),
        hour_display(unix, false),
        pad(minute_of(unix) as u16, true),
        am_pm_of(unix),
    )
}

fn format_timestamp(unix: u32) -> String {
    format!(
        "{}/{}/{}-{}:{}:{}",
        year_of(unix),
        pad(month_of(unix) as u16, true),
        pad(day_of_month_of(unix) as u16, true),
        pad(hour_display(unix, true) as u16, true),
        pad(minute_of(unix) as u16, true),
        pad(second_of(unix) as u16, true),
    )
}
