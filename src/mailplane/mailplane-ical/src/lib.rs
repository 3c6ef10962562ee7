//! iCalendar engine: parse and serialize RFC 5545 streams, expand
//! recurrence rules, and resolve VTIMEZONE offsets.
//!
//! The component model is deliberately order-preserving: a parsed file
//! serializes back with its lines, parameters and values in their
//! original sequence.

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

mod component;
mod itime;
mod rrule;
mod tzcomp;

pub use component::{Component, IcalError, Line, Param, Value};
pub use itime::{ITime, Weekday};
pub use rrule::{Frequency, Rrule, RruleError};
pub use tzcomp::{
    datetime_to_utc, itime_to_utc, parse_date, parse_datetime, parse_duration, parse_utc_offset,
    tz_component_offset, utc_to_itime,
};
