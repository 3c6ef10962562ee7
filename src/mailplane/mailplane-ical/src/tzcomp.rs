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

//! Scalar value parsers and VTIMEZONE offset resolution.
//!
//! A VTIMEZONE names its zone through STANDARD and DAYLIGHT children;
//! the offset for a given wall time comes from picking the child in
//! force at that instant, re-expanding a child's yearly RRULE for the
//! requested year when one is present.

use crate::component::Component;
use crate::itime::{day_of_month_by_order, month_days, ITime, Weekday};
use crate::rrule;

/// Parse a `±HHMM` UTC offset into signed seconds east of UTC.
#[must_use]
pub fn parse_utc_offset(text: &str) -> Option<i32> {
    let text = text.trim();
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    if rest.len() < 4 || !rest.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let hour: i32 = rest[..2].parse().ok()?;
    let minute: i32 = rest[2..4].parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(sign * (hour * 3600 + minute * 60))
}

/// Parse a `YYYYMMDD` date.
#[must_use]
pub fn parse_date(text: &str) -> Option<(i32, u32, u32)> {
    let text = text.trim();
    if text.len() < 8 || !text.as_bytes()[..8].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let year = text[..4].parse().ok()?;
    let month = text[4..6].parse().ok()?;
    let day = text[6..8].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some((year, month, day))
}

/// Parse a `YYYYMMDDTHHMMSS[SS][Z]` date-time; the boolean reports the
/// trailing `Z`.
#[must_use]
pub fn parse_datetime(text: &str) -> Option<(ITime, bool)> {
    let mut text = text.trim();
    let utc = text.ends_with(['Z', 'z']);
    if utc {
        text = &text[..text.len() - 1];
    }
    if text.len() != 15 && text.len() != 17 {
        return None;
    }
    let (year, month, day) = parse_date(&text[..8])?;
    if text.as_bytes()[8] != b'T' {
        return None;
    }
    let time = &text[9..];
    if !time.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut itime = ITime {
        year,
        month,
        day,
        hour: time[..2].parse().ok()?,
        minute: time[2..4].parse().ok()?,
        second: time[4..6].parse().ok()?,
        leap_second: 0,
    };
    if time.len() == 8 {
        itime.leap_second = time[6..8].parse().ok()?;
    }
    if itime.hour > 23 || itime.minute > 59 || itime.second > 59 {
        return None;
    }
    Some((itime, utc))
}

/// Parse an RFC 5545 duration (`[±]P[nW]` or `[±]P[nD][T[nH][nM][nS]]`)
/// into signed seconds.
#[must_use]
pub fn parse_duration(text: &str) -> Option<i64> {
    let text = text.trim();
    let (sign, rest) = match text.as_bytes().first()? {
        b'-' => (-1_i64, &text[1..]),
        b'+' => (1, &text[1..]),
        _ => (1, text),
    };
    let rest = rest.strip_prefix(['P', 'p'])?;
    let mut seconds = 0_i64;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_part = false;
    for c in rest.chars() {
        match c {
            '0'..='9' => number.push(c),
            'T' | 't' if number.is_empty() => in_time = true,
            'W' | 'w' | 'D' | 'd' | 'H' | 'h' | 'M' | 'm' | 'S' | 's' => {
                let value: i64 = number.parse().ok()?;
                number.clear();
                seen_part = true;
                seconds += value
                    * match c.to_ascii_uppercase() {
                        'W' => 7 * 86_400,
                        'D' => 86_400,
                        'H' if in_time => 3600,
                        'M' if in_time => 60,
                        'S' if in_time => 1,
                        _ => return None,
                    };
            }
            _ => return None,
        }
    }
    if !number.is_empty() || !seen_part {
        return None;
    }
    Some(sign * seconds)
}

/// Offset (seconds east) a VTIMEZONE assigns to a wall-time instant.
#[must_use]
pub fn tz_component_offset(tz_component: &Component, itime: ITime) -> Option<i32> {
    let mut standard: Option<(i32, ITime)> = None;
    let mut daylight: Option<(i32, ITime)> = None;

    for child in &tz_component.components {
        let is_standard = child.name.eq_ignore_ascii_case("STANDARD");
        if !is_standard && !child.name.eq_ignore_ascii_case("DAYLIGHT") {
            return None;
        }
        let dtstart_line = child.line("DTSTART")?;
        if dtstart_line.param_value("TZID").is_some() {
            return None;
        }
        let (dtstart, utc) = parse_datetime(dtstart_line.first_subvalue()?)?;
        if utc {
            return None;
        }
        if itime < dtstart {
            continue;
        }
        let rrule_line = child.line("RRULE");
        if let Some(line) = rrule_line {
            // an UNTIL in the past disqualifies the child
            if let Some(until) = line.first_subvalue_by_name("UNTIL") {
                let bound = match parse_datetime(until) {
                    Some((it, false)) => it,
                    Some((it, true)) => {
                        let offset = parse_utc_offset(
                            child.line("TZOFFSETTO")?.first_subvalue()?,
                        )?;
                        ITime::from_utc_naive(it.to_utc_naive() + i64::from(offset))
                    }
                    None => {
                        let (year, month, day) = parse_date(until)?;
                        ITime::date(year, month, day)
                    }
                };
                if itime > bound {
                    continue;
                }
            }
        }
        let offset = parse_utc_offset(child.line("TZOFFSETTO")?.first_subvalue()?)?;
        let mut marker = dtstart;
        if let Some(line) = rrule_line {
            if line
                .first_subvalue_by_name("FREQ")
                .map_or(true, |f| !f.eq_ignore_ascii_case("YEARLY"))
            {
                return None;
            }
            let byday = line.first_subvalue_by_name("BYDAY");
            let bymonthday = line.first_subvalue_by_name("BYMONTHDAY");
            if byday.is_some() == bymonthday.is_some() {
                return None;
            }
            let month = match line.first_subvalue_by_name("BYMONTH") {
                None => dtstart.month,
                Some(text) => {
                    let m: u32 = text.parse().ok()?;
                    if !(1..=12).contains(&m) {
                        return None;
                    }
                    m
                }
            };
            marker.year = itime.year;
            marker.month = month;
            marker.day = if let Some(byday) = byday {
                let (dayofweek, weekorder) = rrule::parse_byday(byday)?;
                if weekorder == 0 || !(-5..=5).contains(&weekorder) {
                    return None;
                }
                let day =
                    day_of_month_by_order(itime.year, month, weekorder, dayofweek.number());
                u32::try_from(day).ok().filter(|&d| d >= 1)?
            } else {
                let mut day: i32 = bymonthday?.parse().ok()?;
                if day.abs() < 1 || day.abs() > 31 {
                    return None;
                }
                if day < 0 {
                    day += month_days(itime.year, month) as i32 + 1;
                }
                u32::try_from(day).ok().filter(|&d| d >= 1)?
            };
            marker.hour = match line.first_subvalue_by_name("BYHOUR") {
                None => dtstart.hour,
                Some(text) => text.parse().ok().filter(|&h| h < 24)?,
            };
            marker.minute = match line.first_subvalue_by_name("BYMINUTE") {
                None => dtstart.minute,
                Some(text) => text.parse().ok().filter(|&m| m < 60)?,
            };
            marker.second = match line.first_subvalue_by_name("BYSECOND") {
                None => dtstart.second,
                Some(text) => text.parse().ok().filter(|&s| s < 60)?,
            };
            marker.leap_second = 0;
        } else {
            marker.year = itime.year;
        }
        if is_standard {
            standard = Some((offset, marker));
        } else {
            daylight = Some((offset, marker));
        }
        if standard.is_some() && daylight.is_some() {
            break;
        }
    }

    match (standard, daylight) {
        (None, None) => None,
        (Some((offset, _)), None) | (None, Some((offset, _))) => Some(offset),
        (Some((std_offset, std_at)), Some((dst_offset, dst_at))) => {
            if itime.year != std_at.year || itime.year != dst_at.year {
                return None;
            }
            if std_at >= dst_at {
                if itime < dst_at || itime >= std_at {
                    Some(std_offset)
                } else {
                    Some(dst_offset)
                }
            } else if itime < std_at || itime >= dst_at {
                Some(dst_offset)
            } else {
                Some(std_offset)
            }
        }
    }
}

/// Wall time in a zone to UTC seconds. `None` as the zone means the
/// wall time already is UTC.
#[must_use]
pub fn itime_to_utc(tz_component: Option<&Component>, itime: ITime) -> Option<i64> {
    let naive = itime.to_utc_naive();
    match tz_component {
        None => Some(naive),
        Some(tz) => Some(naive - i64::from(tz_component_offset(tz, itime)?)),
    }
}

/// A DATE-TIME string in a zone to UTC seconds.
#[must_use]
pub fn datetime_to_utc(tz_component: Option<&Component>, text: &str) -> Option<i64> {
    let (itime, utc) = parse_datetime(text)?;
    if utc {
        Some(itime.to_utc_naive())
    } else {
        itime_to_utc(tz_component, itime)
    }
}

/// UTC seconds to wall time in a zone. The candidate offsets come from
/// the zone's TZOFFSETTO lines; the one that round-trips wins.
#[must_use]
pub fn utc_to_itime(tz_component: Option<&Component>, utc: i64) -> Option<ITime> {
    let Some(tz) = tz_component else {
        return Some(ITime::from_utc_naive(utc));
    };
    for child in &tz.components {
        if !child.name.eq_ignore_ascii_case("STANDARD")
            && !child.name.eq_ignore_ascii_case("DAYLIGHT")
        {
            return None;
        }
        let offset = parse_utc_offset(child.line("TZOFFSETTO")?.first_subvalue()?)?;
        let candidate = ITime::from_utc_naive(utc + i64::from(offset));
        if itime_to_utc(Some(tz), candidate) == Some(utc) {
            return Some(candidate);
        }
    }
    None
}

/// An RRULE UNTIL value (date or date-time, zone-local or UTC) to UTC
/// seconds.
#[must_use]
pub(crate) fn parse_until(tz_component: Option<&Component>, text: &str) -> Option<i64> {
    match parse_datetime(text) {
        Some((itime, true)) => Some(itime.to_utc_naive()),
        Some((itime, false)) => itime_to_utc(tz_component, itime),
        None => {
            let (year, month, day) = parse_date(text)?;
            itime_to_utc(tz_component, ITime::date(year, month, day))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BERLIN: &str = "BEGIN:VTIMEZONE\r\n\
TZID:Europe/Berlin\r\n\
BEGIN:DAYLIGHT\r\n\
TZOFFSETFROM:+0100\r\n\
TZOFFSETTO:+0200\r\n\
TZNAME:CEST\r\n\
DTSTART:19700329T020000\r\n\
RRULE:FREQ=YEARLY;BYMONTH=3;BYDAY=-1SU\r\n\
END:DAYLIGHT\r\n\
BEGIN:STANDARD\r\n\
TZOFFSETFROM:+0200\r\n\
TZOFFSETTO:+0100\r\n\
TZNAME:CET\r\n\
DTSTART:19701025T030000\r\n\
RRULE:FREQ=YEARLY;BYMONTH=10;BYDAY=-1SU\r\n\
END:STANDARD\r\n\
END:VTIMEZONE\r\n";

    fn berlin() -> Component {
        Component::parse(BERLIN).unwrap()
    }

    #[test]
    fn scalar_parsers() {
        assert_eq!(parse_utc_offset("+0130"), Some(5400));
        assert_eq!(parse_utc_offset("-0500"), Some(-18_000));
        assert_eq!(parse_utc_offset("0100"), None);
        assert_eq!(parse_date("20240229"), Some((2024, 2, 29)));
        assert_eq!(
            parse_datetime("20240107T100000Z"),
            Some((ITime::new(2024, 1, 7, 10, 0, 0), true))
        );
        assert_eq!(parse_datetime("20240107T100000").map(|x| x.1), Some(false));
        assert_eq!(parse_duration("P1DT2H3M4S"), Some(93_784));
        assert_eq!(parse_duration("-P1W"), Some(-604_800));
        assert_eq!(parse_duration("PT"), None);
    }

    #[test]
    fn berlin_offsets_by_season() {
        let tz = berlin();
        assert_eq!(
            tz_component_offset(&tz, ITime::new(2024, 1, 15, 12, 0, 0)),
            Some(3600)
        );
        assert_eq!(
            tz_component_offset(&tz, ITime::new(2024, 7, 15, 12, 0, 0)),
            Some(7200)
        );
        // the switch itself: 2024-03-31 02:00 wall jumps to DST
        assert_eq!(
            tz_component_offset(&tz, ITime::new(2024, 3, 31, 1, 59, 59)),
            Some(3600)
        );
        assert_eq!(
            tz_component_offset(&tz, ITime::new(2024, 3, 31, 3, 0, 0)),
            Some(7200)
        );
    }

    #[test]
    fn wall_time_round_trip() {
        let tz = berlin();
        for &utc in &[1_705_276_800_i64, 1_721_001_600, 1_711_843_200] {
            let itime = utc_to_itime(Some(&tz), utc).unwrap();
            assert_eq!(itime_to_utc(Some(&tz), itime), Some(utc));
        }
    }

    #[test]
    fn datetime_conversion_applies_offset() {
        let tz = berlin();
        // 10:00 Berlin winter time = 09:00 UTC
        assert_eq!(
            datetime_to_utc(Some(&tz), "20240115T100000"),
            Some(ITime::new(2024, 1, 15, 9, 0, 0).to_utc_naive())
        );
        assert_eq!(
            datetime_to_utc(None, "20240115T100000Z"),
            Some(ITime::new(2024, 1, 15, 10, 0, 0).to_utc_naive())
        );
    }
}
