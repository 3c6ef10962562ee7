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

//! RFC 8536 TZif reader.
//!
//! A version 2+ file carries a 32-bit data block first and a 64-bit one
//! after it; only the second is used there, as the RFC prescribes.

use crate::posix::PosixTz;
use crate::{TimeType, TimeZone, TzError};

struct Header {
    version: u8,
    isutcnt: usize,
    isstdcnt: usize,
    leapcnt: usize,
    timecnt: usize,
    typecnt: usize,
    charcnt: usize,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TzError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(TzError::Malformed("truncated file"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, TzError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, TzError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, TzError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, TzError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

fn read_header(cur: &mut Cursor<'_>) -> Result<Header, TzError> {
    if cur.take(4)? != b"TZif" {
        return Err(TzError::Malformed("bad magic"));
    }
    let version = cur.u8()?;
    cur.take(15)?;
    let isutcnt = cur.u32()? as usize;
    let isstdcnt = cur.u32()? as usize;
    let leapcnt = cur.u32()? as usize;
    let timecnt = cur.u32()? as usize;
    let typecnt = cur.u32()? as usize;
    let charcnt = cur.u32()? as usize;
    if typecnt == 0 || charcnt == 0 {
        return Err(TzError::Malformed("empty type table"));
    }
    if isutcnt != 0 && isutcnt != typecnt {
        return Err(TzError::Malformed("isutcnt mismatch"));
    }
    if isstdcnt != 0 && isstdcnt != typecnt {
        return Err(TzError::Malformed("isstdcnt mismatch"));
    }
    Ok(Header {
        version,
        isutcnt,
        isstdcnt,
        leapcnt,
        timecnt,
        typecnt,
        charcnt,
    })
}

fn read_block(
    cur: &mut Cursor<'_>,
    hdr: &Header,
    wide: bool,
) -> Result<(Vec<(i64, usize)>, Vec<TimeType>), TzError> {
    let mut when = Vec::with_capacity(hdr.timecnt);
    for _ in 0..hdr.timecnt {
        when.push(if wide { cur.i64()? } else { i64::from(cur.i32()?) });
    }
    let mut type_idx = Vec::with_capacity(hdr.timecnt);
    for _ in 0..hdr.timecnt {
        let idx = cur.u8()? as usize;
        if idx >= hdr.typecnt {
            return Err(TzError::Malformed("transition type out of range"));
        }
        type_idx.push(idx);
    }
    let mut raw_types = Vec::with_capacity(hdr.typecnt);
    for _ in 0..hdr.typecnt {
        let utoff = cur.i32()?;
        let is_dst = match cur.u8()? {
            0 => false,
            1 => true,
            _ => return Err(TzError::Malformed("bad isdst")),
        };
        let abbrind = cur.u8()? as usize;
        raw_types.push((utoff, is_dst, abbrind));
    }
    let chars = cur.take(hdr.charcnt)?;
    let mut types = Vec::with_capacity(hdr.typecnt);
    for (utoff, is_dst, abbrind) in raw_types {
        if abbrind >= chars.len() {
            return Err(TzError::Malformed("abbreviation index out of range"));
        }
        let abbr = chars[abbrind..]
            .split(|&c| c == 0)
            .next()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        types.push(TimeType {
            utoff,
            is_dst,
            abbr,
        });
    }
    // leap seconds, standard/wall and ut/local indicators are skipped:
    // lookups operate on POSIX timestamps
    cur.take(hdr.leapcnt * if wide { 12 } else { 8 })?;
    cur.take(hdr.isstdcnt)?;
    cur.take(hdr.isutcnt)?;

    let mut transitions = Vec::with_capacity(hdr.timecnt);
    let mut last = i64::MIN;
    for (t, idx) in when.into_iter().zip(type_idx) {
        if t <= last {
            return Err(TzError::Malformed("transitions not ascending"));
        }
        last = t;
        transitions.push((t, idx));
    }
    Ok((transitions, types))
}

pub(crate) fn parse(data: &[u8]) -> Result<TimeZone, TzError> {
    let mut cur = Cursor { data, pos: 0 };
    let hdr = read_header(&mut cur)?;

    if hdr.version == 0 {
        let (transitions, types) = read_block(&mut cur, &hdr, false)?;
        return Ok(TimeZone::from_parts(transitions, types, None));
    }

    // skip the legacy 32-bit block, then read the 64-bit one
    cur.take(5 * hdr.timecnt + 6 * hdr.typecnt + hdr.charcnt + 8 * hdr.leapcnt)?;
    cur.take(hdr.isstdcnt + hdr.isutcnt)?;
    let hdr2 = read_header(&mut cur)?;
    let (transitions, types) = read_block(&mut cur, &hdr2, true)?;

    let footer = read_footer(&mut cur)?;
    Ok(TimeZone::from_parts(transitions, types, footer))
}

fn read_footer(cur: &mut Cursor<'_>) -> Result<Option<PosixTz>, TzError> {
    if cur.u8()? != b'\n' {
        return Err(TzError::Malformed("missing footer newline"));
    }
    let rest = &cur.data[cur.pos..];
    let end = rest
        .iter()
        .position(|&c| c == b'\n')
        .ok_or(TzError::Malformed("unterminated footer"))?;
    if end == 0 {
        return Ok(None);
    }
    let tz = std::str::from_utf8(&rest[..end])
        .map_err(|_| TzError::Malformed("footer is not UTF-8"))?;
    Ok(Some(PosixTz::parse(tz)?))
}
