// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Human friendly config types.

use std::{
    fmt,
    ops::{Div, Mul},
    str::FromStr,
    time::Duration,
};

use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// A duration that (de)serializes from strings like "10m", "2h", "1d12h",
/// "500ms". A bare integer is interpreted as milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableDuration(pub Duration);

impl ReadableDuration {
    pub const fn secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub const fn minutes(minutes: u64) -> Self {
        Self::secs(minutes * 60)
    }

    pub const fn hours(hours: u64) -> Self {
        Self::minutes(hours * 60)
    }

    pub const fn days(days: u64) -> Self {
        Self::hours(days * 24)
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn is_zero(&self) -> bool {
        self.0.as_nanos() == 0
    }
}

impl From<ReadableDuration> for Duration {
    fn from(d: ReadableDuration) -> Self {
        d.0
    }
}

impl From<Duration> for ReadableDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl Mul<u32> for ReadableDuration {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<u32> for ReadableDuration {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        Self(self.0 / rhs)
    }
}

impl FromStr for ReadableDuration {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total_ms = 0u64;
        let mut digits = String::new();
        let mut chars = input.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }

            let value: u64 = digits
                .parse()
                .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
            digits.clear();

            let unit_ms = match c {
                'd' => MS_PER_DAY,
                'h' => MS_PER_HOUR,
                's' => MS_PER_SECOND,
                'm' => {
                    if chars.peek() == Some(&'s') {
                        chars.next();
                        1
                    } else {
                        MS_PER_MINUTE
                    }
                }
                _ => return Err(format!("unknown unit {c:?} in duration {input:?}")),
            };
            total_ms += value * unit_ms;
        }

        if !digits.is_empty() {
            // Trailing bare integer means milliseconds.
            let value: u64 = digits
                .parse()
                .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
            total_ms += value;
        }

        Ok(ReadableDuration(Duration::from_millis(total_ms)))
    }
}

impl fmt::Display for ReadableDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ms = self.as_millis();
        if ms == 0 {
            return write!(f, "0s");
        }

        for (unit_ms, unit) in [
            (MS_PER_DAY, "d"),
            (MS_PER_HOUR, "h"),
            (MS_PER_MINUTE, "m"),
            (MS_PER_SECOND, "s"),
        ] {
            if ms >= unit_ms {
                write!(f, "{}{}", ms / unit_ms, unit)?;
                ms %= unit_ms;
            }
        }
        if ms > 0 {
            write!(f, "{ms}ms")?;
        }

        Ok(())
    }
}

impl Serialize for ReadableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = ReadableDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a duration string or a number of milliseconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ReadableDuration::millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(ReadableDuration::millis(v as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
