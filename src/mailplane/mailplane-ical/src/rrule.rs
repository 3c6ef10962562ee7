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

//! RRULE expansion per RFC 5545 §3.3.10, including the Outlook-style
//! BY-rule interactions.
//!
//! Iteration walks two nested cadences: the declared frequency advances
//! the base window by `INTERVAL`, and the *real* frequency (the finest
//! BY-rule present) walks candidate instants inside the window. Every
//! candidate runs through the BY-bitmap filters; the first filter that
//! rejects also tells the walk how far it may skip ahead.

use crate::component::{first_subvalue_by_name, subval_list, Component, Value};
use crate::itime::{
    day_of_month_by_order, day_of_week, day_of_year, is_leap_year, month_days, month_week_order,
    negative_month_week_order, negative_week_of_year, negative_year_week_order, week_of_year,
    year_week_order, ITime, Weekday,
};
use crate::tzcomp;

/// Errors of [`Rrule::parse`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RruleError {
    /// FREQ missing or unknown.
    #[error("missing or invalid FREQ part")]
    BadFrequency,
    /// A BY-rule or scalar part held an out-of-range value.
    #[error("invalid {0} part")]
    BadPart(&'static str),
    /// COUNT and UNTIL are mutually exclusive, and UNTIL must follow
    /// the start.
    #[error("conflicting rule bounds")]
    ConflictingBounds,
    /// BYSETPOS with a frequency combination RFC 5545 rules out.
    #[error("BYSETPOS not expressible at this frequency")]
    BadSetPos,
}

/// Recurrence cadence, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    /// SECONDLY
    Second,
    /// MINUTELY
    Minute,
    /// HOURLY
    Hour,
    /// DAILY
    Day,
    /// WEEKLY
    Week,
    /// MONTHLY
    Month,
    /// YEARLY
    Year,
}

/// The BY-rule filters, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByRule {
    Month,
    WeekNo,
    YearDay,
    MonthDay,
    Day,
    Hour,
    Minute,
    Second,
}

/// Fixed-size bit set backing the BY-rule masks (the widest, BYDAY with
/// year week orders, needs 7 × 53 + 7 bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BitSet([u64; 6]);

impl BitSet {
    fn set(&mut self, index: usize) {
        self.0[index / 64] |= 1 << (index % 64);
    }

    fn test(&self, index: usize) -> bool {
        index < 384 && self.0[index / 64] & (1 << (index % 64)) != 0
    }
}

/// A parsed recurrence rule plus its iteration state.
#[derive(Debug, Clone)]
pub struct Rrule {
    frequency: Frequency,
    real_frequency: Frequency,
    interval: u32,
    total_count: u32,
    until_itime: Option<ITime>,
    weekstart: u32,

    has_by: [bool; 8],
    by_setpos: bool,
    second_bitmap: BitSet,
    minute_bitmap: BitSet,
    hour_bitmap: BitSet,
    mday_bitmap: BitSet,
    nmday_bitmap: BitSet,
    yday_bitmap: BitSet,
    nyday_bitmap: BitSet,
    wday_bitmap: BitSet,
    nwday_bitmap: BitSet,
    week_bitmap: BitSet,
    nweek_bitmap: BitSet,
    month_bitmap: BitSet,
    setpos_bitmap: BitSet,
    nsetpos_bitmap: BitSet,

    start_exceptional: bool,
    real_start_itime: ITime,
    base_itime: ITime,
    next_base_itime: ITime,
    instance_itime: ITime,
    current_instance: u32,
    cur_setpos: u32,
    setpos_count: u32,
}

impl Rrule {
    fn has(&self, rule: ByRule) -> bool {
        self.has_by[rule as usize]
    }

    fn mark(&mut self, rule: ByRule) {
        self.has_by[rule as usize] = true;
    }

    /// The wall time of the instance the iterator currently stands on.
    #[must_use]
    pub fn instance(&self) -> ITime {
        self.instance_itime
    }

    /// 1-based ordinal of the current instance.
    #[must_use]
    pub fn current_instance(&self) -> u32 {
        self.current_instance
    }

    /// Whether the rule carries neither COUNT nor UNTIL.
    #[must_use]
    pub fn endless(&self) -> bool {
        self.total_count == 0 && self.until_itime.is_none()
    }

    /// The COUNT bound, zero when absent.
    #[must_use]
    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    /// The UNTIL bound as wall time, when present.
    #[must_use]
    pub fn until(&self) -> Option<ITime> {
        self.until_itime
    }

    /// Week-start day number (0 = Sunday).
    #[must_use]
    pub fn weekstart(&self) -> u32 {
        self.weekstart
    }

    /// Whether DTSTART itself fell outside the rule's own cadence.
    #[must_use]
    pub fn start_exceptional(&self) -> bool {
        self.start_exceptional
    }

    /// Parse the value groups of an RRULE line against a start instant.
    ///
    /// `tz_component` localizes the start and UNTIL instants; `None`
    /// reads them as UTC. After a successful parse the iterator stands
    /// on the first instance (DTSTART).
    ///
    /// # Errors
    ///
    /// [`RruleError`] on malformed or contradictory parts.
    pub fn parse(
        tz_component: Option<&Component>,
        start_utc: i64,
        values: &[Value],
    ) -> Result<Self, RruleError> {
        let frequency = match first_subvalue_by_name(values, "FREQ")
            .ok_or(RruleError::BadFrequency)?
            .to_ascii_uppercase()
            .as_str()
        {
            "SECONDLY" => Frequency::Second,
            "MINUTELY" => Frequency::Minute,
            "HOURLY" => Frequency::Hour,
            "DAILY" => Frequency::Day,
            "WEEKLY" => Frequency::Week,
            "MONTHLY" => Frequency::Month,
            "YEARLY" => Frequency::Year,
            _ => return Err(RruleError::BadFrequency),
        };

        let mut rule = Self {
            frequency,
            real_frequency: frequency,
            interval: 1,
            total_count: 0,
            until_itime: None,
            weekstart: 0,
            has_by: [false; 8],
            by_setpos: false,
            second_bitmap: BitSet::default(),
            minute_bitmap: BitSet::default(),
            hour_bitmap: BitSet::default(),
            mday_bitmap: BitSet::default(),
            nmday_bitmap: BitSet::default(),
            yday_bitmap: BitSet::default(),
            nyday_bitmap: BitSet::default(),
            wday_bitmap: BitSet::default(),
            nwday_bitmap: BitSet::default(),
            week_bitmap: BitSet::default(),
            nweek_bitmap: BitSet::default(),
            month_bitmap: BitSet::default(),
            setpos_bitmap: BitSet::default(),
            nsetpos_bitmap: BitSet::default(),
            start_exceptional: false,
            real_start_itime: ITime::default(),
            base_itime: ITime::default(),
            next_base_itime: ITime::default(),
            instance_itime: ITime::default(),
            current_instance: 0,
            cur_setpos: 0,
            setpos_count: 0,
        };

        if let Some(text) = first_subvalue_by_name(values, "INTERVAL") {
            rule.interval = text
                .parse::<u32>()
                .ok()
                .filter(|&v| v > 0)
                .ok_or(RruleError::BadPart("INTERVAL"))?;
        }
        if let Some(text) = first_subvalue_by_name(values, "COUNT") {
            rule.total_count = text
                .parse::<u32>()
                .ok()
                .filter(|&v| v > 0)
                .ok_or(RruleError::BadPart("COUNT"))?;
        }
        if let Some(text) = first_subvalue_by_name(values, "UNTIL") {
            if rule.total_count != 0 {
                return Err(RruleError::ConflictingBounds);
            }
            let until_utc = tzcomp::parse_until(tz_component, text)
                .ok_or(RruleError::BadPart("UNTIL"))?;
            if until_utc <= start_utc {
                return Err(RruleError::ConflictingBounds);
            }
            rule.until_itime = Some(
                tzcomp::utc_to_itime(tz_component, until_utc)
                    .ok_or(RruleError::BadPart("UNTIL"))?,
            );
        }
        rule.instance_itime = tzcomp::utc_to_itime(tz_component, start_utc)
            .ok_or(RruleError::BadPart("DTSTART"))?;

        let by_second = subval_list(values, "BYSECOND");
        if let Some(list) = by_second {
            for entry in flatten(list)? {
                let v: u32 = entry.parse().map_err(|_| RruleError::BadPart("BYSECOND"))?;
                if v > 59 {
                    return Err(RruleError::BadPart("BYSECOND"));
                }
                rule.second_bitmap.set(v as usize);
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Second);
            rule.mark(ByRule::Second);
        }
        let by_minute = subval_list(values, "BYMINUTE");
        if let Some(list) = by_minute {
            for entry in flatten(list)? {
                let v: u32 = entry.parse().map_err(|_| RruleError::BadPart("BYMINUTE"))?;
                if v > 59 {
                    return Err(RruleError::BadPart("BYMINUTE"));
                }
                rule.minute_bitmap.set(v as usize);
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Minute);
            rule.mark(ByRule::Minute);
        }
        let by_hour = subval_list(values, "BYHOUR");
        if let Some(list) = by_hour {
            for entry in flatten(list)? {
                let v: u32 = entry.parse().map_err(|_| RruleError::BadPart("BYHOUR"))?;
                if v > 23 {
                    return Err(RruleError::BadPart("BYHOUR"));
                }
                rule.hour_bitmap.set(v as usize);
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Hour);
            rule.mark(ByRule::Hour);
        }
        let by_monthday = subval_list(values, "BYMONTHDAY");
        if let Some(list) = by_monthday {
            for entry in flatten(list)? {
                let v: i32 = entry.parse().map_err(|_| RruleError::BadPart("BYMONTHDAY"))?;
                if v == 0 || v.abs() > 31 {
                    return Err(RruleError::BadPart("BYMONTHDAY"));
                }
                if v > 0 {
                    rule.mday_bitmap.set((v - 1) as usize);
                } else {
                    rule.nmday_bitmap.set((-v - 1) as usize);
                }
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Day);
            rule.mark(ByRule::MonthDay);
        }
        let by_yearday = subval_list(values, "BYYEARDAY");
        if let Some(list) = by_yearday {
            for entry in flatten(list)? {
                let v: i32 = entry.parse().map_err(|_| RruleError::BadPart("BYYEARDAY"))?;
                if v == 0 || v.abs() > 366 {
                    return Err(RruleError::BadPart("BYYEARDAY"));
                }
                if v > 0 {
                    rule.yday_bitmap.set((v - 1) as usize);
                } else {
                    rule.nyday_bitmap.set((-v - 1) as usize);
                }
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Day);
            rule.mark(ByRule::YearDay);
        }
        let by_day = subval_list(values, "BYDAY");
        if let Some(list) = by_day {
            if !matches!(
                rule.frequency,
                Frequency::Week | Frequency::Month | Frequency::Year
            ) {
                return Err(RruleError::BadPart("BYDAY"));
            }
            for entry in flatten(list)? {
                let (dayofweek, weekorder) =
                    parse_byday(entry).ok_or(RruleError::BadPart("BYDAY"))?;
                let dow = dayofweek.number() as usize;
                match rule.frequency {
                    Frequency::Month => {
                        if !(-5..=5).contains(&weekorder) {
                            return Err(RruleError::BadPart("BYDAY"));
                        } else if weekorder > 0 {
                            rule.wday_bitmap.set(7 * (weekorder - 1) as usize + dow);
                        } else if weekorder < 0 {
                            rule.nwday_bitmap.set(7 * (-weekorder - 1) as usize + dow);
                        } else {
                            for week in 0..5 {
                                rule.wday_bitmap.set(7 * week + dow);
                            }
                        }
                    }
                    Frequency::Year => {
                        if weekorder > 0 {
                            rule.wday_bitmap.set(7 * (weekorder - 1) as usize + dow);
                        } else if weekorder < 0 {
                            rule.nwday_bitmap.set(7 * (-weekorder - 1) as usize + dow);
                        } else {
                            for week in 0..53 {
                                rule.wday_bitmap.set(7 * week + dow);
                            }
                        }
                    }
                    _ => {
                        if weekorder != 0 {
                            return Err(RruleError::BadPart("BYDAY"));
                        }
                        rule.wday_bitmap.set(dow);
                    }
                }
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Day);
            rule.mark(ByRule::Day);
        }
        let by_weekno = subval_list(values, "BYWEEKNO");
        if let Some(list) = by_weekno {
            for entry in flatten(list)? {
                let v: i32 = entry.parse().map_err(|_| RruleError::BadPart("BYWEEKNO"))?;
                if v == 0 || v.abs() > 53 {
                    return Err(RruleError::BadPart("BYWEEKNO"));
                }
                if v > 0 {
                    rule.week_bitmap.set((v - 1) as usize);
                } else {
                    rule.nweek_bitmap.set((-v - 1) as usize);
                }
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Week);
            rule.mark(ByRule::WeekNo);
        }
        let by_month = subval_list(values, "BYMONTH");
        if let Some(list) = by_month {
            for entry in flatten(list)? {
                let v: u32 = entry.parse().map_err(|_| RruleError::BadPart("BYMONTH"))?;
                if !(1..=12).contains(&v) {
                    return Err(RruleError::BadPart("BYMONTH"));
                }
                rule.month_bitmap.set((v - 1) as usize);
            }
            rule.real_frequency = rule.real_frequency.min(Frequency::Month);
            rule.mark(ByRule::Month);
        }
        if let Some(list) = subval_list(values, "BYSETPOS") {
            rule.check_setpos_expressible()?;
            for entry in flatten(list)? {
                let v: i32 = entry.parse().map_err(|_| RruleError::BadPart("BYSETPOS"))?;
                if v == 0 || v.abs() > 366 {
                    return Err(RruleError::BadPart("BYSETPOS"));
                }
                if v > 0 {
                    rule.setpos_bitmap.set((v - 1) as usize);
                } else {
                    rule.nsetpos_bitmap.set((-v - 1) as usize);
                }
            }
            rule.by_setpos = true;
        }
        rule.weekstart = match first_subvalue_by_name(values, "WKST") {
            Some(code) => Weekday::from_code(code)
                .ok_or(RruleError::BadPart("WKST"))?
                .number(),
            None if by_weekno.is_some() => 1,
            None => 0,
        };

        // rewind the start to the beginning of the base window the
        // coarser BY-rules will refine
        let mut itime = rule.instance_itime;
        match rule.frequency {
            Frequency::Second => {}
            Frequency::Minute => {
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
            Frequency::Hour => {
                if by_minute.is_some() {
                    itime.minute = 0;
                }
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
            Frequency::Day => {
                if by_hour.is_some() {
                    itime.hour = 0;
                }
                if by_minute.is_some() {
                    itime.minute = 0;
                }
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
            Frequency::Week => {
                if by_day.is_some() {
                    let dayofweek = itime.day_of_week();
                    if dayofweek >= rule.weekstart {
                        itime.sub_days(dayofweek - rule.weekstart);
                    } else {
                        itime.sub_days(7 + dayofweek - rule.weekstart);
                    }
                }
                if by_hour.is_some() {
                    itime.hour = 0;
                }
                if by_minute.is_some() {
                    itime.minute = 0;
                }
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
            Frequency::Month => {
                if by_yearday.is_some() || by_monthday.is_some() || by_day.is_some() {
                    itime.day = 1;
                }
                if by_hour.is_some() {
                    itime.hour = 0;
                }
                if by_minute.is_some() {
                    itime.minute = 0;
                }
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
            Frequency::Year => {
                if by_month.is_some() {
                    itime.month = 1;
                }
                if by_yearday.is_some() || by_monthday.is_some() || by_day.is_some() {
                    itime.day = 1;
                }
                if by_hour.is_some() {
                    itime.hour = 0;
                }
                if by_minute.is_some() {
                    itime.minute = 0;
                }
                if by_second.is_some() {
                    itime.second = 0;
                }
            }
        }
        rule.base_itime = itime;
        rule.advance_base();
        if rule.by_setpos {
            rule.calculate_setpos();
        }

        // walk the first window looking for DTSTART
        let mut itime = rule.base_itime;
        while itime < rule.next_base_itime {
            if let Some(until) = rule.until_itime {
                if itime > until {
                    return Err(RruleError::ConflictingBounds);
                }
            }
            match rule.hint(itime) {
                None => {
                    if rule.by_setpos {
                        rule.cur_setpos += 1;
                        if !rule.hint_setpos() {
                            itime = rule.next_itime(None, itime);
                            continue;
                        }
                    }
                    match itime.cmp(&rule.instance_itime) {
                        std::cmp::Ordering::Less => {
                            itime = rule.next_itime(None, itime);
                            continue;
                        }
                        std::cmp::Ordering::Greater => {
                            rule.start_exceptional = true;
                            rule.real_start_itime = itime;
                            rule.current_instance = 1;
                            rule.next_base_itime = rule.base_itime;
                            return Ok(rule);
                        }
                        std::cmp::Ordering::Equal => {
                            rule.current_instance = 1;
                            return Ok(rule);
                        }
                    }
                }
                Some(blocked) => itime = rule.next_itime(Some(blocked), itime),
            }
        }

        // nothing in the first window: the start is exceptional and the
        // real cadence begins in a later window (or never)
        let base_itime = rule.base_itime;
        let dtstart_itime = rule.instance_itime;
        rule.current_instance = 1;
        rule.instance_itime = rule.next_base_itime;
        if !rule.iterate() {
            rule.total_count = 1;
            rule.instance_itime = dtstart_itime;
        } else {
            rule.real_start_itime = rule.instance_itime;
            rule.next_base_itime = rule.base_itime;
            rule.base_itime = base_itime;
            rule.instance_itime = dtstart_itime;
        }
        rule.current_instance = 1;
        rule.start_exceptional = true;
        Ok(rule)
    }

    /// Advance to the next instance. `false` once the rule is exhausted.
    pub fn iterate(&mut self) -> bool {
        if self.total_count != 0 && self.current_instance >= self.total_count {
            return false;
        }
        if self.start_exceptional {
            let itime = self.real_start_itime;
            if self.until_itime.is_some_and(|until| itime > until) {
                return false;
            }
            self.start_exceptional = false;
            self.current_instance += 1;
            self.instance_itime = itime;
            self.base_itime = self.next_base_itime;
            self.advance_base();
            return true;
        }
        let mut hint_result = None;
        let mut itime = self.instance_itime;
        loop {
            itime = self.next_itime(hint_result, itime);
            if self.until_itime.is_some_and(|until| itime > until) {
                return false;
            }
            if itime >= self.next_base_itime {
                self.base_itime = self.next_base_itime;
                itime = self.next_base_itime;
                self.advance_base();
                if self.by_setpos {
                    self.calculate_setpos();
                }
            }
            hint_result = self.hint(itime);
            if hint_result.is_none() {
                if self.by_setpos {
                    self.cur_setpos += 1;
                    if !self.hint_setpos() {
                        continue;
                    }
                }
                self.current_instance += 1;
                self.instance_itime = itime;
                return true;
            }
        }
    }

    /// First BY-filter that rejects `itime`; `None` means it passes.
    fn hint(&self, itime: ITime) -> Option<ByRule> {
        if self.has(ByRule::Month) && !self.month_bitmap.test((itime.month - 1) as usize) {
            return Some(ByRule::Month);
        }
        if self.has(ByRule::WeekNo) {
            let (weekorder, yeargap) =
                week_of_year(itime.year, itime.month, itime.day, self.weekstart);
            if yeargap && self.frequency == Frequency::Year {
                return Some(ByRule::WeekNo);
            }
            let (nweekorder, yeargap) =
                negative_week_of_year(itime.year, itime.month, itime.day, self.weekstart);
            if yeargap && self.frequency == Frequency::Year {
                return Some(ByRule::WeekNo);
            }
            if !self.week_bitmap.test((weekorder - 1) as usize)
                && !self.nweek_bitmap.test((-nweekorder - 1) as usize)
            {
                return Some(ByRule::WeekNo);
            }
        }
        if self.has(ByRule::YearDay) {
            let yeardays = if is_leap_year(itime.year) { 366 } else { 365 };
            let yearday = day_of_year(itime.year, itime.month, itime.day);
            if !self.yday_bitmap.test((yearday - 1) as usize)
                && !self.nyday_bitmap.test((yeardays - yearday) as usize)
            {
                return Some(ByRule::YearDay);
            }
        }
        if self.has(ByRule::MonthDay)
            && !self.mday_bitmap.test((itime.day - 1) as usize)
            && !self
                .nmday_bitmap
                .test((month_days(itime.year, itime.month) - itime.day) as usize)
        {
            return Some(ByRule::MonthDay);
        }
        if self.has(ByRule::Day) {
            let dayofweek = day_of_week(itime.year, itime.month, itime.day);
            let (weekorder, nweekorder);
            if self.frequency == Frequency::Week {
                weekorder = (itime.delta_days(self.base_itime) / 7 + 1) as i32;
                nweekorder = -((itime.delta_days(self.next_base_itime) as i32 - 1) / 7) - 1;
            } else if self.frequency == Frequency::Month || self.has(ByRule::Month) {
                weekorder = month_week_order(itime.day);
                nweekorder = negative_month_week_order(itime.year, itime.month, itime.day);
            } else {
                weekorder = year_week_order(itime.year, itime.month, itime.day);
                nweekorder = negative_year_week_order(itime.year, itime.month, itime.day);
            }
            if !self
                .wday_bitmap
                .test(7 * (weekorder - 1) as usize + dayofweek as usize)
                && !self
                    .nwday_bitmap
                    .test(7 * (-nweekorder - 1) as usize + dayofweek as usize)
            {
                return Some(ByRule::Day);
            }
        }
        if self.has(ByRule::Hour) && !self.hour_bitmap.test(itime.hour as usize) {
            return Some(ByRule::Hour);
        }
        if self.has(ByRule::Minute) && !self.minute_bitmap.test(itime.minute as usize) {
            return Some(ByRule::Minute);
        }
        if self.has(ByRule::Second) && !self.second_bitmap.test(itime.second as usize) {
            return Some(ByRule::Second);
        }
        None
    }

    fn hint_setpos(&self) -> bool {
        self.setpos_bitmap.test((self.cur_setpos - 1) as usize)
            || self
                .nsetpos_bitmap
                .test((self.setpos_count - self.cur_setpos) as usize)
    }

    /// Step a candidate forward: by the real frequency when it passed
    /// the filters, or by the span the failing filter lets us skip.
    /// Overshooting the base window snaps to the next one.
    fn next_itime(&self, hint_result: Option<ByRule>, mut itime: ITime) -> ITime {
        match hint_result {
            None => {
                let same = self.real_frequency == self.frequency;
                match self.real_frequency {
                    Frequency::Year => itime.add_years(self.interval as i32),
                    Frequency::Month => itime.add_months(if same { self.interval } else { 1 }),
                    Frequency::Week => itime.add_days(if same { 7 * self.interval } else { 7 }),
                    Frequency::Day => itime.add_days(if same { self.interval } else { 1 }),
                    Frequency::Hour => itime.add_hours(if same { self.interval } else { 1 }),
                    Frequency::Minute => itime.add_minutes(if same { self.interval } else { 1 }),
                    Frequency::Second => itime.add_seconds(if same { self.interval } else { 1 }),
                }
                return itime;
            }
            Some(blocked) => match self.frequency {
                Frequency::Year | Frequency::Month => match blocked {
                    ByRule::Month => {
                        let dayofweek = itime.day_of_week();
                        itime.add_months(1);
                        if self.has(ByRule::WeekNo) {
                            itime.day = day_of_month_by_order(itime.year, itime.month, 1, dayofweek)
                                .max(1) as u32;
                        }
                        if self.has(ByRule::YearDay)
                            || self.has(ByRule::MonthDay)
                            || self.has(ByRule::Day)
                        {
                            itime.day = 1;
                        }
                        self.zero_below(&mut itime, ByRule::Hour);
                    }
                    ByRule::WeekNo => {
                        itime.add_days(7);
                        if self.has(ByRule::YearDay)
                            || self.has(ByRule::MonthDay)
                            || self.has(ByRule::Day)
                        {
                            let dayofweek = itime.day_of_week();
                            if dayofweek >= self.weekstart {
                                itime.sub_days(dayofweek - self.weekstart);
                            } else {
                                itime.sub_days(7 + dayofweek - self.weekstart);
                            }
                        }
                        self.zero_below(&mut itime, ByRule::Hour);
                    }
                    ByRule::YearDay | ByRule::MonthDay | ByRule::Day => {
                        itime.add_days(1);
                        self.zero_below(&mut itime, ByRule::Hour);
                    }
                    ByRule::Hour => {
                        itime.add_hours(1);
                        self.zero_below(&mut itime, ByRule::Minute);
                    }
                    ByRule::Minute => {
                        itime.add_minutes(1);
                        self.zero_below(&mut itime, ByRule::Second);
                    }
                    ByRule::Second => itime.add_seconds(1),
                },
                Frequency::Week => match blocked {
                    ByRule::YearDay | ByRule::MonthDay | ByRule::Day => itime.add_days(1),
                    ByRule::Hour => itime.add_hours(1),
                    ByRule::Minute => itime.add_minutes(1),
                    ByRule::Second => itime.add_seconds(1),
                    _ => itime.add_days(7),
                },
                Frequency::Day => match blocked {
                    ByRule::Hour => itime.add_hours(1),
                    ByRule::Minute => itime.add_minutes(1),
                    ByRule::Second => itime.add_seconds(1),
                    _ => itime.add_days(1),
                },
                Frequency::Hour => match blocked {
                    ByRule::Minute => itime.add_minutes(1),
                    ByRule::Second => itime.add_seconds(1),
                    _ => itime.add_hours(1),
                },
                Frequency::Minute => match blocked {
                    ByRule::Second => itime.add_seconds(1),
                    _ => itime.add_minutes(1),
                },
                Frequency::Second => itime.add_seconds(1),
            },
        }
        let overshot = match self.frequency {
            Frequency::Year => itime.year > self.base_itime.year,
            Frequency::Month => itime.month > self.base_itime.month,
            Frequency::Week => itime.delta_days(self.base_itime) >= 7,
            Frequency::Day => itime.day > self.base_itime.day,
            Frequency::Hour => itime.hour > self.base_itime.hour,
            Frequency::Minute => itime.minute > self.base_itime.minute,
            Frequency::Second => itime.second > self.base_itime.second,
        };
        if overshot {
            self.next_base_itime
        } else {
            itime
        }
    }

    fn zero_below(&self, itime: &mut ITime, from: ByRule) {
        if matches!(from, ByRule::Hour) && self.has(ByRule::Hour) {
            itime.hour = 0;
        }
        if matches!(from, ByRule::Hour | ByRule::Minute) && self.has(ByRule::Minute) {
            itime.minute = 0;
        }
        if self.has(ByRule::Second) {
            itime.second = 0;
        }
    }

    /// Count the candidates the current window will accept, resetting
    /// the SETPOS cursor.
    fn calculate_setpos(&mut self) {
        self.cur_setpos = 0;
        self.setpos_count = 0;
        let mut itime = self.base_itime;
        while self.next_base_itime > itime {
            let hint_result = self.hint(itime);
            if hint_result.is_none() {
                self.setpos_count += 1;
            }
            itime = self.next_itime(hint_result, itime);
        }
    }

    /// `next_base_itime = base_itime + INTERVAL` at the declared cadence.
    fn advance_base(&mut self) {
        self.next_base_itime = self.base_itime;
        match self.frequency {
            Frequency::Year => self.next_base_itime.add_years(self.interval as i32),
            Frequency::Month => self.next_base_itime.add_months(self.interval),
            Frequency::Week => self.next_base_itime.add_days(7 * self.interval),
            Frequency::Day => self.next_base_itime.add_days(self.interval),
            Frequency::Hour => self.next_base_itime.add_hours(self.interval),
            Frequency::Minute => self.next_base_itime.add_minutes(self.interval),
            Frequency::Second => self.next_base_itime.add_seconds(self.interval),
        }
    }

    /// RFC 5545 constrains which (FREQ, finest BY-rule) pairs BYSETPOS
    /// may ride on; window sizes past one year are rejected outright.
    fn check_setpos_expressible(&self) -> Result<(), RruleError> {
        let ok = match self.frequency {
            Frequency::Second => false,
            Frequency::Minute => {
                self.real_frequency == Frequency::Second && 60 * self.interval <= 366
            }
            Frequency::Hour => {
                self.real_frequency == Frequency::Minute && 60 * self.interval <= 366
            }
            Frequency::Day => self.real_frequency == Frequency::Hour && 24 * self.interval <= 366,
            Frequency::Week => match self.real_frequency {
                Frequency::Day => true,
                Frequency::Hour => 7 * 24 * self.interval <= 366,
                _ => false,
            },
            Frequency::Month => match self.real_frequency {
                Frequency::Day => 31 * self.interval <= 366,
                Frequency::Week => 5 * self.interval <= 366,
                _ => false,
            },
            Frequency::Year => match self.real_frequency {
                Frequency::Day => self.interval <= 1,
                Frequency::Week => self.interval <= 8,
                Frequency::Month => self.interval <= 30,
                _ => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(RruleError::BadSetPos)
        }
    }
}

fn flatten(list: &[Option<String>]) -> Result<Vec<&str>, RruleError> {
    list.iter()
        .map(|entry| entry.as_deref().ok_or(RruleError::BadPart("NIL")))
        .collect()
}

/// `[+|-][n]WD`: an optional week order and a weekday code.
pub(crate) fn parse_byday(text: &str) -> Option<(Weekday, i32)> {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let code = &rest[digits.len()..];
    let weekorder = if digits.is_empty() {
        0
    } else {
        let order: i32 = digits.parse().ok()?;
        if !(1..=53).contains(&order) {
            return None;
        }
        if negative {
            -order
        } else {
            order
        }
    };
    Some((Weekday::from_code(code)?, weekorder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use pretty_assertions::assert_eq;

    fn rule_values(rule: &str) -> Vec<Value> {
        let text = format!("BEGIN:VCALENDAR\r\nRRULE:{rule}\r\nEND:VCALENDAR\r\n");
        let cal = Component::parse_calendar(&text).unwrap();
        cal.line("RRULE").unwrap().values.clone()
    }

    fn expand(rule: &str, dtstart: ITime, cap: usize) -> Vec<ITime> {
        let values = rule_values(rule);
        let mut rrule = Rrule::parse(None, dtstart.to_utc_naive(), &values).unwrap();
        let mut out = vec![rrule.instance()];
        while out.len() < cap && rrule.iterate() {
            out.push(rrule.instance());
        }
        out
    }

    #[test]
    fn monthly_first_sunday() {
        let instances = expand(
            "FREQ=MONTHLY;BYDAY=1SU;COUNT=3",
            ITime::new(2024, 1, 7, 10, 0, 0),
            10,
        );
        assert_eq!(
            instances,
            vec![
                ITime::new(2024, 1, 7, 10, 0, 0),
                ITime::new(2024, 2, 4, 10, 0, 0),
                ITime::new(2024, 3, 3, 10, 0, 0),
            ]
        );
    }

    #[test]
    fn daily_interval_two() {
        let instances = expand("FREQ=DAILY;INTERVAL=2;COUNT=4", ITime::new(2024, 2, 27, 9, 30, 0), 10);
        assert_eq!(
            instances,
            vec![
                ITime::new(2024, 2, 27, 9, 30, 0),
                ITime::new(2024, 2, 29, 9, 30, 0),
                ITime::new(2024, 3, 2, 9, 30, 0),
                ITime::new(2024, 3, 4, 9, 30, 0),
            ]
        );
    }

    #[test]
    fn weekly_byday_walks_both_days() {
        let instances = expand(
            "FREQ=WEEKLY;BYDAY=MO,FR;COUNT=5",
            ITime::new(2024, 1, 1, 8, 0, 0), // a Monday
            10,
        );
        assert_eq!(
            instances,
            vec![
                ITime::new(2024, 1, 1, 8, 0, 0),
                ITime::new(2024, 1, 5, 8, 0, 0),
                ITime::new(2024, 1, 8, 8, 0, 0),
                ITime::new(2024, 1, 12, 8, 0, 0),
                ITime::new(2024, 1, 15, 8, 0, 0),
            ]
        );
    }

    #[test]
    fn monthly_last_workday_via_setpos() {
        let instances = expand(
            "FREQ=MONTHLY;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1;COUNT=3",
            ITime::new(2024, 1, 31, 17, 0, 0), // Wednesday, last workday
            10,
        );
        assert_eq!(
            instances,
            vec![
                ITime::new(2024, 1, 31, 17, 0, 0),
                ITime::new(2024, 2, 29, 17, 0, 0),
                ITime::new(2024, 3, 29, 17, 0, 0),
            ]
        );
    }

    #[test]
    fn exceptional_start_emits_dtstart_first() {
        // DTSTART is a Sunday, the rule wants Mondays
        let values = rule_values("FREQ=WEEKLY;BYDAY=MO;COUNT=3");
        let dtstart = ITime::new(2024, 1, 7, 12, 0, 0);
        let mut rrule = Rrule::parse(None, dtstart.to_utc_naive(), &values).unwrap();
        assert!(rrule.start_exceptional());
        assert_eq!(rrule.instance(), dtstart);
        assert!(rrule.iterate());
        assert_eq!(rrule.instance(), ITime::new(2024, 1, 8, 12, 0, 0));
    }

    #[test]
    fn instances_strictly_increase() {
        let instances = expand(
            "FREQ=MONTHLY;BYDAY=2WE;COUNT=24",
            ITime::new(2024, 1, 10, 6, 0, 0),
            24,
        );
        assert_eq!(instances.len(), 24);
        for pair in instances.windows(2) {
            assert!(pair[0].to_utc_naive() < pair[1].to_utc_naive());
        }
    }

    #[test]
    fn until_bounds_the_expansion() {
        let instances = expand(
            "FREQ=DAILY;UNTIL=20240105T090000Z",
            ITime::new(2024, 1, 1, 9, 0, 0),
            100,
        );
        assert_eq!(instances.len(), 5);
        assert_eq!(*instances.last().unwrap(), ITime::new(2024, 1, 5, 9, 0, 0));
    }

    #[test]
    fn count_and_until_conflict() {
        let values = rule_values("FREQ=DAILY;COUNT=3;UNTIL=20250101T000000Z");
        let err = Rrule::parse(None, ITime::new(2024, 1, 1, 0, 0, 0).to_utc_naive(), &values)
            .unwrap_err();
        assert_eq!(err, RruleError::ConflictingBounds);
    }

    #[test]
    fn yearly_bymonth_byday() {
        // second Tuesday of April and October
        let instances = expand(
            "FREQ=YEARLY;BYMONTH=4,10;BYDAY=2TU;COUNT=4",
            ITime::new(2024, 4, 9, 15, 0, 0),
            10,
        );
        assert_eq!(
            instances,
            vec![
                ITime::new(2024, 4, 9, 15, 0, 0),
                ITime::new(2024, 10, 8, 15, 0, 0),
                ITime::new(2025, 4, 8, 15, 0, 0),
                ITime::new(2025, 10, 14, 15, 0, 0),
            ]
        );
    }

    #[test]
    fn bad_frequency_is_rejected() {
        let values = rule_values("FREQ=FORTNIGHTLY");
        assert_eq!(
            Rrule::parse(None, 0, &values).unwrap_err(),
            RruleError::BadFrequency
        );
    }
}
