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

//! POSIX TZ strings: `STD offset [DST [offset] [, start[/time], end[/time]]]`.
//!
//! Used both standalone and as the extrapolation footer of a TZif file.
//! POSIX offsets are west-positive; they are negated on parse so the rest
//! of the crate deals in seconds east of UTC only.

use crate::civil;
use crate::TzError;

/// A transition day rule.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayRule {
    /// `Jn`: Julian day 1..=365, February 29 never counted.
    JulianNoLeap(u16),
    /// `n`: zero-based day of year, leap day counted.
    ZeroBased(u16),
    /// `Mm.w.d`: day `d` (0 = Sunday) of week `w` (5 = last) of month `m`.
    MonthWeekDay(u8, u8, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transition {
    day: DayRule,
    /// Seconds after local midnight; POSIX allows -167h..=167h.
    time: i32,
}

/// A parsed POSIX TZ string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixTz {
    std_abbr: String,
    /// Seconds east of UTC while standard time is in force.
    std_offset: i32,
    dst: Option<Dst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dst {
    abbr: String,
    offset: i32,
    start: Transition,
    end: Transition,
}

impl PosixTz {
    /// Parse a POSIX TZ string.
    ///
    /// # Errors
    ///
    /// [`TzError::BadPosix`] on any syntax violation.
    pub fn parse(tz: &str) -> Result<Self, TzError> {
        let bad = || TzError::BadPosix(tz.to_owned());
        let mut rest = tz;

        let std_abbr = take_abbr(&mut rest).ok_or_else(bad)?;
        let std_offset = -take_offset(&mut rest).ok_or_else(bad)?;

        if rest.is_empty() {
            return Ok(Self {
                std_abbr,
                std_offset,
                dst: None,
            });
        }

        let dst_abbr = take_abbr(&mut rest).ok_or_else(bad)?;
        let dst_offset = match rest.chars().next() {
            Some(',') | None => std_offset + 3600,
            _ => -take_offset(&mut rest).ok_or_else(bad)?,
        };

        let (start, end) = if rest.is_empty() {
            // no rule: fall back to the US convention the tz database
            // historically applied
            (
                Transition {
                    day: DayRule::MonthWeekDay(3, 2, 0),
                    time: 2 * 3600,
                },
                Transition {
                    day: DayRule::MonthWeekDay(11, 1, 0),
                    time: 2 * 3600,
                },
            )
        } else {
            let mut parts = rest.splitn(2, ',').skip(1);
            let spec = parts.next().ok_or_else(bad)?;
            let mut spec_parts = spec.splitn(2, ',');
            let start = parse_transition(spec_parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
            let end = parse_transition(spec_parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
            (start, end)
        };

        Ok(Self {
            std_abbr,
            std_offset,
            dst: Some(Dst {
                abbr: dst_abbr,
                offset: dst_offset,
                start,
                end,
            }),
        })
    }

    /// UTC offset (seconds east) in force at a UTC instant.
    #[must_use]
    pub fn offset_at(&self, utc: i64) -> i32 {
        let Some(dst) = &self.dst else {
            return self.std_offset;
        };
        let year = civil::year_of(utc + i64::from(self.std_offset));
        let start = transition_utc(&dst.start, year, self.std_offset);
        let end = transition_utc(&dst.end, year, dst.offset);
        let in_dst = if start <= end {
            utc >= start && utc < end
        } else {
            // southern hemisphere: DST wraps the new year
            utc >= start || utc < end
        };
        if in_dst {
            dst.offset
        } else {
            self.std_offset
        }
    }

    /// The distinct offsets this rule can produce.
    pub(crate) fn offsets(&self) -> impl Iterator<Item = i32> + '_ {
        std::iter::once(self.std_offset).chain(self.dst.as_ref().map(|d| d.offset))
    }

    /// Abbreviation of standard time (`CET` in `CET-1CEST,...`).
    #[must_use]
    pub fn std_abbr(&self) -> &str {
        &self.std_abbr
    }
}

/// UTC instant of a rule transition within `year`, given the offset in
/// force just before it.
fn transition_utc(tr: &Transition, year: i64, offset_before: i32) -> i64 {
    let day = match tr.day {
        DayRule::JulianNoLeap(n) => {
            let mut doy = i64::from(n);
            if civil::is_leap(year) && doy > 59 {
                doy += 1; // skip February 29
            }
            civil::days_from_civil(year, 1, 1) + doy - 1
        }
        DayRule::ZeroBased(n) => civil::days_from_civil(year, 1, 1) + i64::from(n),
        DayRule::MonthWeekDay(m, w, d) => {
            let month = i64::from(m);
            let first = civil::days_from_civil(year, month, 1);
            let first_dow = civil::weekday_of_days(first);
            let mut day = 1 + (i64::from(d) - first_dow).rem_euclid(7) + 7 * (i64::from(w) - 1);
            while day > civil::days_in_month(year, month) {
                day -= 7;
            }
            civil::days_from_civil(year, month, day)
        }
    };
    day * 86_400 + i64::from(tr.time) - i64::from(offset_before)
}

fn take_abbr(rest: &mut &str) -> Option<String> {
    if let Some(stripped) = rest.strip_prefix('<') {
        let end = stripped.find('>')?;
        let abbr = stripped[..end].to_owned();
        *rest = &stripped[end + 1..];
        return (!abbr.is_empty()).then_some(abbr);
    }
    let len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    if len < 3 {
        return None;
    }
    let abbr = rest[..len].to_owned();
    *rest = &rest[len..];
    Some(abbr)
}

/// `[+-]hh[:mm[:ss]]` in seconds, sign preserved (west positive).
fn take_offset(rest: &mut &str) -> Option<i32> {
    let mut chars = rest.char_indices().peekable();
    let mut sign = 1;
    if let Some(&(_, c)) = chars.peek() {
        if c == '+' || c == '-' {
            if c == '-' {
                sign = -1;
            }
            chars.next();
        }
    }
    let mut consumed = 0;
    let mut fields = [0_i32; 3];
    let mut field = 0;
    let mut digits = 0;
    for (i, c) in chars {
        match c {
            '0'..='9' if digits < 3 => {
                fields[field] = fields[field] * 10 + (c as i32 - '0' as i32);
                digits += 1;
            }
            ':' if field < 2 && digits > 0 => {
                field += 1;
                digits = 0;
            }
            _ => break,
        }
        consumed = i + 1;
    }
    if consumed == 0 || fields[0] > 167 || fields[1] > 59 || fields[2] > 59 {
        return None;
    }
    *rest = &rest[consumed..];
    Some(sign * (fields[0] * 3600 + fields[1] * 60 + fields[2]))
}

fn parse_transition(spec: &str) -> Option<Transition> {
    let (day_str, time_str) = match spec.split_once('/') {
        Some((d, t)) => (d, Some(t)),
        None => (spec, None),
    };
    let day = if let Some(n) = day_str.strip_prefix('J') {
        let n: u16 = n.parse().ok()?;
        (1..=365).contains(&n).then_some(DayRule::JulianNoLeap(n))?
    } else if let Some(m) = day_str.strip_prefix('M') {
        let mut it = m.split('.');
        let month: u8 = it.next()?.parse().ok()?;
        let week: u8 = it.next()?.parse().ok()?;
        let dow: u8 = it.next()?.parse().ok()?;
        if it.next().is_some()
            || !(1..=12).contains(&month)
            || !(1..=5).contains(&week)
            || dow > 6
        {
            return None;
        }
        DayRule::MonthWeekDay(month, week, dow)
    } else {
        let n: u16 = day_str.parse().ok()?;
        (n <= 365).then_some(DayRule::ZeroBased(n))?
    };
    let time = match time_str {
        None => 2 * 3600,
        Some(t) => {
            let mut s = t;
            take_offset(&mut s).filter(|_| s.is_empty())?
        }
    };
    Some(Transition { day, time })
}
