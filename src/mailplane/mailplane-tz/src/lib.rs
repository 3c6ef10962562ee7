//! Timezone resolution against compiled tz data.
//!
//! Parses RFC 8536 TZif files (versions 1 through 3) including the POSIX
//! TZ footer, and standalone POSIX TZ strings, and maps instants between
//! UTC and local wall time for a named IANA zone.

/*
 * mailplane groupware submission plane
 * Copyright (C) 2023 The mailplane developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod posix;
mod tzif;

pub use posix::PosixTz;

use std::path::Path;

/// Reasons a zone could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum TzError {
    /// The zone name did not resolve to a tz database entry.
    #[error("unknown timezone {0:?}")]
    UnknownZone(String),
    /// The TZif data is malformed.
    #[error("malformed tz data: {0}")]
    Malformed(&'static str),
    /// The POSIX TZ string is malformed.
    #[error("malformed POSIX TZ string {0:?}")]
    BadPosix(String),
    /// Reading the zone file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One local-time type: offset from UTC plus its DST marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimeType {
    /// Seconds east of UTC.
    pub utoff: i32,
    pub is_dst: bool,
    pub abbr: String,
}

/// A resolved timezone.
///
/// Offsets before the first recorded transition use the first standard
/// type; offsets past the last transition follow the POSIX footer rule
/// when one is present, the last type otherwise.
#[derive(Debug, Clone)]
pub struct TimeZone {
    /// Transition instants (UTC seconds), ascending, paired with the
    /// index of the type in force from that instant on.
    transitions: Vec<(i64, usize)>,
    types: Vec<TimeType>,
    footer: Option<PosixTz>,
}

impl TimeZone {
    /// Load a zone by IANA name from the system tz database.
    ///
    /// `TZDIR` overrides the default `/usr/share/zoneinfo` root. Names
    /// with `..` components are rejected.
    ///
    /// # Errors
    ///
    /// [`TzError::UnknownZone`] when the name escapes the database root
    /// or no such file exists, otherwise the parse errors of
    /// [`TimeZone::from_tzif`].
    pub fn load(name: &str) -> Result<Self, TzError> {
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(TzError::UnknownZone(name.to_owned()));
        }
        let root = std::env::var_os("TZDIR")
            .map_or_else(|| "/usr/share/zoneinfo".into(), std::path::PathBuf::from);
        Self::load_from(&root, name)
    }

    /// Load a zone by name under an explicit database root.
    ///
    /// # Errors
    ///
    /// Same as [`TimeZone::load`].
    pub fn load_from(root: &Path, name: &str) -> Result<Self, TzError> {
        let path = root.join(name);
        let data = std::fs::read(&path)
            .map_err(|_| TzError::UnknownZone(name.to_owned()))?;
        Self::from_tzif(&data)
    }

    /// Parse a TZif byte image.
    ///
    /// # Errors
    ///
    /// [`TzError::Malformed`] on any structural violation.
    pub fn from_tzif(data: &[u8]) -> Result<Self, TzError> {
        tzif::parse(data)
    }

    /// Build a zone from a POSIX TZ string alone.
    ///
    /// # Errors
    ///
    /// [`TzError::BadPosix`] when the string does not parse.
    pub fn from_posix(tz: &str) -> Result<Self, TzError> {
        let footer = PosixTz::parse(tz)?;
        Ok(Self {
            transitions: Vec::new(),
            types: Vec::new(),
            footer: Some(footer),
        })
    }

    /// UTC offset (seconds east) in force at a UTC instant.
    #[must_use]
    pub fn offset_at(&self, utc: i64) -> i32 {
        match self
            .transitions
            .partition_point(|&(when, _)| when <= utc)
            .checked_sub(1)
        {
            Some(i) => {
                let (_, ty) = self.transitions[i];
                if i + 1 == self.transitions.len() {
                    if let Some(footer) = &self.footer {
                        return footer.offset_at(utc);
                    }
                }
                self.types[ty].utoff
            }
            None => {
                if self.transitions.is_empty() {
                    if let Some(footer) = &self.footer {
                        return footer.offset_at(utc);
                    }
                }
                // before history began: the first standard type
                self.types
                    .iter()
                    .find(|ty| !ty.is_dst)
                    .or_else(|| self.types.first())
                    .map_or(0, |ty| ty.utoff)
            }
        }
    }

    /// Map a UTC instant to local wall seconds.
    #[must_use]
    pub fn utc_to_local(&self, utc: i64) -> i64 {
        utc + i64::from(self.offset_at(utc))
    }

    /// Map local wall seconds back to UTC.
    ///
    /// On ambiguous wall clocks (repeated hour) the earlier instant is
    /// returned; inside a spring-forward gap the pre-transition offset
    /// is applied.
    #[must_use]
    pub fn local_to_utc(&self, local: i64) -> i64 {
        let mut candidates: Vec<i32> = self.types.iter().map(|ty| ty.utoff).collect();
        if let Some(footer) = &self.footer {
            candidates.extend(footer.offsets());
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut best: Option<i64> = None;
        for off in candidates {
            let utc = local - i64::from(off);
            if self.offset_at(utc) == off {
                best = Some(best.map_or(utc, |b: i64| b.min(utc)));
            }
        }
        best.unwrap_or_else(|| {
            let guess = local - i64::from(self.offset_at(local));
            local - i64::from(self.offset_at(guess))
        })
    }

    pub(crate) fn from_parts(
        transitions: Vec<(i64, usize)>,
        types: Vec<TimeType>,
        footer: Option<PosixTz>,
    ) -> Self {
        Self {
            transitions,
            types,
            footer,
        }
    }
}

/// Civil-date helpers shared by the TZif and POSIX rule math.
pub(crate) mod civil {
    /// Days since 1970-01-01 for a proleptic Gregorian date.
    pub fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
        let y = if month <= 2 { year - 1 } else { year };
        let era = y.div_euclid(400);
        let yoe = y - era * 400;
        let mp = (month + 9) % 12;
        let doy = (153 * mp + 2) / 5 + day - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146_097 + doe - 719_468
    }

    pub fn is_leap(year: i64) -> bool {
        (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
    }

    /// 0 = Sunday.
    pub fn weekday_of_days(days: i64) -> i64 {
        (days + 4).rem_euclid(7)
    }

    pub fn days_in_month(year: i64, month: i64) -> i64 {
        const DAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        if month == 2 && is_leap(year) {
            29
        } else {
            DAYS[(month - 1) as usize]
        }
    }

    /// Year a UTC instant falls in.
    pub fn year_of(utc: i64) -> i64 {
        let days = utc.div_euclid(86_400);
        // unwind days_from_civil
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        if mp < 10 {
            y
        } else {
            y + 1
        }
    }
}

#[cfg(test)]
mod tests;
