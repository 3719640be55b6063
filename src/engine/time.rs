// Copyright © 2024 Pathway

use std::fmt::{self, Display};
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::str::FromStr;

use chrono::{self, DurationRound, LocalResult, TimeZone};
use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use num_integer::Integer;
use serde::{Deserialize, Serialize};

use super::error::{DataError, DataResult};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Units accepted by timestamp and duration conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    pub fn nanoseconds(self) -> i64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => NANOS_PER_SECOND,
            Self::Minutes => 60 * NANOS_PER_SECOND,
            Self::Hours => 3_600 * NANOS_PER_SECOND,
            Self::Days => 86_400 * NANOS_PER_SECOND,
            Self::Weeks => 7 * 86_400 * NANOS_PER_SECOND,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = DataError;

    fn from_str(unit: &str) -> DataResult<Self> {
        match unit {
            "ns" => Ok(Self::Nanoseconds),
            "us" => Ok(Self::Microseconds),
            "ms" => Ok(Self::Milliseconds),
            "s" => Ok(Self::Seconds),
            "m" => Ok(Self::Minutes),
            "h" => Ok(Self::Hours),
            "D" => Ok(Self::Days),
            "W" => Ok(Self::Weeks),
            _ => Err(DataError::ValueError(format!(
                "unit has to be one of W, D, h, m, s, ms, us, ns but is {unit:?}"
            ))),
        }
    }
}

fn split_nanos(timestamp: i64) -> (i64, u32) {
    let (secs, nanos) = Integer::div_mod_floor(&timestamp, &NANOS_PER_SECOND);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    (secs, nanos as u32)
}

fn nanos_of(datetime: chrono::NaiveDateTime) -> DataResult<i64> {
    datetime
        .and_utc()
        .timestamp_nanos_opt()
        .ok_or(DataError::DateTimeConversionError)
}

#[allow(clippy::module_name_repetitions)]
pub trait DateTime {
    fn timestamp(&self) -> i64;

    fn as_chrono_datetime(&self) -> chrono::NaiveDateTime {
        let (secs, nanos) = split_nanos(self.timestamp());
        // any i64 nanosecond count is within chrono's range
        chrono::DateTime::from_timestamp(secs, nanos)
            .unwrap_or_default()
            .naive_utc()
    }

    fn nanosecond(&self) -> i64 {
        self.as_chrono_datetime().nanosecond().into()
    }

    fn microsecond(&self) -> i64 {
        (self.as_chrono_datetime().nanosecond() / 1_000).into()
    }

    fn millisecond(&self) -> i64 {
        (self.as_chrono_datetime().nanosecond() / 1_000_000).into()
    }

    fn second(&self) -> i64 {
        self.as_chrono_datetime().second().into()
    }

    fn minute(&self) -> i64 {
        self.as_chrono_datetime().minute().into()
    }

    fn hour(&self) -> i64 {
        self.as_chrono_datetime().hour().into()
    }

    fn day(&self) -> i64 {
        self.as_chrono_datetime().day().into()
    }

    fn month(&self) -> i64 {
        self.as_chrono_datetime().month().into()
    }

    fn year(&self) -> i64 {
        self.as_chrono_datetime().year().into()
    }

    fn weekday(&self) -> i64 {
        self.as_chrono_datetime()
            .weekday()
            .num_days_from_monday()
            .into()
    }

    #[allow(clippy::cast_precision_loss)]
    fn timestamp_in_unit(&self, unit: TimeUnit) -> f64 {
        self.timestamp() as f64 / unit.nanoseconds() as f64
    }

    fn strftime(&self, format: &str) -> String;

    fn rounded_timestamp(&self, duration: Duration) -> DataResult<i64> {
        let rounded = self
            .as_chrono_datetime()
            .duration_round(duration.as_chrono_duration())
            .map_err(|e| DataError::ValueError(e.to_string()))?;
        nanos_of(rounded)
    }

    fn truncated_timestamp(&self, duration: Duration) -> DataResult<i64> {
        let truncated = self
            .as_chrono_datetime()
            .duration_trunc(duration.as_chrono_duration())
            .map_err(|e| DataError::ValueError(e.to_string()))?;
        nanos_of(truncated)
    }

    fn sanitize_format_string(format: &str) -> DataResult<String> {
        let format = format.replace(".%f", "%.f");
        if format.matches("%f").count() == format.matches("%%f").count() {
            Ok(format)
        } else {
            Err(DataError::ParseError(format!(
                "cannot use format {format:?}: using \"%f\" without the leading dot is not supported"
            )))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTimeNaive {
    timestamp: i64,
}

impl DateTimeNaive {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    pub fn strptime(date_string: &str, format: &str) -> DataResult<Self> {
        let format = Self::sanitize_format_string(format)?;
        let parsed = chrono::NaiveDateTime::parse_from_str(date_string, &format)
            .ok()
            .or_else(|| {
                chrono::NaiveDate::parse_from_str(date_string, &format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
            .or_else(|| {
                let time = chrono::NaiveTime::parse_from_str(date_string, &format).ok()?;
                Some(chrono::NaiveDate::from_ymd_opt(1900, 1, 1)?.and_time(time))
            });
        match parsed {
            Some(datetime) => Ok(Self::new(nanos_of(datetime)?)),
            None => Err(DataError::ParseError(format!(
                "cannot parse date {date_string:?} using format {format:?}"
            ))),
        }
    }

    pub fn to_utc_from_timezone(&self, timezone: &str) -> DataResult<DateTimeUtc> {
        let tz: Tz = timezone.parse().map_err(|e| {
            DataError::ParseError(format!("cannot parse time zone {timezone:?}: {e}"))
        })?;
        let naive_local = self.as_chrono_datetime();
        match tz.from_local_datetime(&naive_local) {
            LocalResult::Single(localized) | LocalResult::Ambiguous(_, localized) => {
                DateTimeUtc::try_from_chrono(&localized)
            }
            LocalResult::None => {
                // Local time skipped by a DST change; take the first valid hour after it.
                let moved = naive_local + chrono::Duration::minutes(30);
                let rounded = moved
                    .duration_round(chrono::Duration::hours(1))
                    .map_err(|_| DataError::DateTimeConversionError)?;
                match tz.from_local_datetime(&rounded) {
                    LocalResult::Single(localized) => DateTimeUtc::try_from_chrono(&localized),
                    _ => Err(DataError::DateTimeConversionError),
                }
            }
        }
    }

    pub fn round(&self, duration: Duration) -> DataResult<Self> {
        self.rounded_timestamp(duration).map(Self::new)
    }

    pub fn truncate(&self, duration: Duration) -> DataResult<Self> {
        self.truncated_timestamp(duration).map(Self::new)
    }

    pub fn from_timestamp(timestamp: i64, unit: TimeUnit) -> DataResult<Self> {
        timestamp
            .checked_mul(unit.nanoseconds())
            .map(Self::new)
            .ok_or(DataError::DateTimeConversionError)
    }
}

impl DateTime for DateTimeNaive {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn strftime(&self, format: &str) -> String {
        self.as_chrono_datetime().format(format).to_string()
    }
}

impl Sub for DateTimeNaive {
    type Output = Duration;

    fn sub(self, other: Self) -> Self::Output {
        Duration::new(self.timestamp - other.timestamp)
    }
}

impl Add<Duration> for DateTimeNaive {
    type Output = Self;

    fn add(self, other: Duration) -> Self::Output {
        Self::new(self.timestamp + other.duration)
    }
}

impl Sub<Duration> for DateTimeNaive {
    type Output = Self;

    fn sub(self, other: Duration) -> Self::Output {
        Self::new(self.timestamp - other.duration)
    }
}

impl Display for DateTimeNaive {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.strftime("%Y-%m-%dT%H:%M:%S%.9f"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTimeUtc {
    timestamp: i64,
}

impl DateTimeUtc {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    fn try_from_chrono<Tz: chrono::TimeZone>(value: &chrono::DateTime<Tz>) -> DataResult<Self> {
        value
            .timestamp_nanos_opt()
            .map(Self::new)
            .ok_or(DataError::DateTimeConversionError)
    }

    pub fn strptime(date_string: &str, format: &str) -> DataResult<Self> {
        let format = Self::sanitize_format_string(format)?;
        let datetime = chrono::DateTime::parse_from_str(date_string, &format).map_err(|e| {
            DataError::ParseError(format!(
                "cannot parse date {date_string:?} using format {format:?}: {e}"
            ))
        })?;
        Self::try_from_chrono(&datetime)
    }

    pub fn to_naive_in_timezone(&self, timezone: &str) -> DataResult<DateTimeNaive> {
        let tz: Tz = timezone.parse().map_err(|e| {
            DataError::ParseError(format!("cannot parse time zone {timezone:?}: {e}"))
        })?;
        let localized = tz.from_utc_datetime(&self.as_chrono_datetime());
        Ok(DateTimeNaive::new(nanos_of(localized.naive_local())?))
    }

    pub fn round(&self, duration: Duration) -> DataResult<Self> {
        self.rounded_timestamp(duration).map(Self::new)
    }

    pub fn truncate(&self, duration: Duration) -> DataResult<Self> {
        self.truncated_timestamp(duration).map(Self::new)
    }

    pub fn from_timestamp(timestamp: i64, unit: TimeUnit) -> DataResult<Self> {
        timestamp
            .checked_mul(unit.nanoseconds())
            .map(Self::new)
            .ok_or(DataError::DateTimeConversionError)
    }
}

impl DateTime for DateTimeUtc {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn strftime(&self, format: &str) -> String {
        chrono::Utc
            .timestamp_nanos(self.timestamp)
            .format(format)
            .to_string()
    }
}

impl Sub for DateTimeUtc {
    type Output = Duration;

    fn sub(self, other: Self) -> Self::Output {
        Duration::new(self.timestamp - other.timestamp)
    }
}

impl Add<Duration> for DateTimeUtc {
    type Output = Self;

    fn add(self, other: Duration) -> Self::Output {
        Self::new(self.timestamp + other.duration)
    }
}

impl Sub<Duration> for DateTimeUtc {
    type Output = Self;

    fn sub(self, other: Duration) -> Self::Output {
        Self::new(self.timestamp - other.duration)
    }
}

impl Display for DateTimeUtc {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.strftime("%Y-%m-%dT%H:%M:%S%.9f%z"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Duration {
    duration: i64,
}

impl Duration {
    pub fn new(duration: i64) -> Self {
        Self { duration }
    }

    pub fn new_with_unit(duration: i64, unit: TimeUnit) -> DataResult<Self> {
        duration
            .checked_mul(unit.nanoseconds())
            .map(Self::new)
            .ok_or_else(|| DataError::ValueError(format!("duration {duration} overflows")))
    }

    fn as_chrono_duration(self) -> chrono::Duration {
        chrono::Duration::nanoseconds(self.duration)
    }

    pub fn nanoseconds(&self) -> i64 {
        self.duration
    }

    /// Whole units contained in the duration, rounded toward zero.
    pub fn in_unit(&self, unit: TimeUnit) -> i64 {
        self.duration / unit.nanoseconds()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn in_unit_f64(&self, unit: TimeUnit) -> f64 {
        self.duration as f64 / unit.nanoseconds() as f64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn true_div(self, other: Self) -> DataResult<f64> {
        if other.duration == 0 {
            Err(DataError::DivisionByZero)
        } else {
            Ok(self.duration as f64 / other.duration as f64)
        }
    }
}

impl Neg for Duration {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(-self.duration)
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.duration + other.duration)
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.duration - other.duration)
    }
}

impl Mul<i64> for Duration {
    type Output = Self;

    fn mul(self, other: i64) -> Self::Output {
        Self::new(self.duration * other)
    }
}

impl Mul<f64> for Duration {
    type Output = Self;

    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_precision_loss)]
    fn mul(self, other: f64) -> Self::Output {
        Self::new((self.duration as f64 * other) as i64)
    }
}

impl Div for Duration {
    type Output = DataResult<i64>;

    fn div(self, other: Self) -> Self::Output {
        if other.duration == 0 {
            Err(DataError::DivisionByZero)
        } else {
            Ok(Integer::div_floor(&self.duration, &other.duration))
        }
    }
}

impl Div<i64> for Duration {
    type Output = DataResult<Duration>;

    fn div(self, other: i64) -> Self::Output {
        if other == 0 {
            Err(DataError::DivisionByZero)
        } else {
            Ok(Self::new(Integer::div_floor(&self.duration, &other)))
        }
    }
}

impl Rem for Duration {
    type Output = DataResult<Duration>;

    fn rem(self, other: Self) -> Self::Output {
        if other.duration == 0 {
            Err(DataError::DivisionByZero)
        } else {
            Ok(Self::new(Integer::mod_floor(&self.duration, &other.duration)))
        }
    }
}

impl Display for Duration {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        const PARTS: [(TimeUnit, &str); 4] = [
            (TimeUnit::Days, "d"),
            (TimeUnit::Hours, "h"),
            (TimeUnit::Minutes, "m"),
            (TimeUnit::Seconds, "s"),
        ];
        let mut parts = Vec::new();
        let mut remaining = self.duration;
        for (unit, suffix) in PARTS {
            let whole = remaining / unit.nanoseconds();
            if whole != 0 {
                parts.push(format!("{whole}{suffix}"));
                remaining %= unit.nanoseconds();
            }
        }
        if remaining != 0 || parts.is_empty() {
            parts.push(format!("{remaining}ns"));
        }
        write!(fmt, "{}", parts.join(" "))
    }
}
