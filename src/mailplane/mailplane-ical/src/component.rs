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

//! The iCalendar component tree and its textual form.

use std::fmt::Write as _;

/// Content lines are folded at this many octets on output.
const MAX_LINE: usize = 73;

/// Properties whose value is free text: the part after the colon is kept
/// as one subvalue instead of being split at `;` and `,`.
const UNSTRUCTURED: &[&str] = &[
    "DESCRIPTION",
    "SUMMARY",
    "LOCATION",
    "COMMENT",
    "CONTACT",
    "UID",
    "PRODID",
    "X-WR-CALNAME",
];

/// Errors of the iCalendar reader.
#[derive(Debug, thiserror::Error)]
pub enum IcalError {
    /// The stream does not begin with `BEGIN:VCALENDAR`.
    #[error("stream is not a VCALENDAR")]
    NotACalendar,
    /// A `BEGIN` had no matching `END`, or names mismatched.
    #[error("unterminated component {0:?}")]
    Unterminated(String),
    /// A content line had no name/value separator.
    #[error("malformed content line {0:?}")]
    BadLine(String),
    /// An `END` appeared without an open component.
    #[error("stray END line")]
    StrayEnd,
}

/// One property parameter: a name with one or more values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Param {
    /// Parameter name, stored as given.
    pub name: String,
    /// Parameter values, unquoted.
    pub values: Vec<String>,
}

/// One value group of a content line. A group may itself be named
/// (`RRULE:FREQ=WEEKLY;BYDAY=MO,TU`) and carries a comma-separated list
/// of sub-values; an empty sub-value is an explicit NIL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    /// Group name, empty for a plain value.
    pub name: String,
    /// The sub-values; `None` is an explicit NIL.
    pub subvals: Vec<Option<String>>,
}

/// One content line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line {
    /// Property name.
    pub name: String,
    /// Parameters in order of appearance.
    pub params: Vec<Param>,
    /// Value groups in order of appearance.
    pub values: Vec<Value>,
}

/// A named component: ordered lines plus nested components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Component {
    /// Component name (`VCALENDAR`, `VTIMEZONE`, `STANDARD`, ...).
    pub name: String,
    /// Content lines in order of appearance.
    pub lines: Vec<Line>,
    /// Nested components in order of appearance.
    pub components: Vec<Component>,
}

impl Line {
    /// A line holding one plain value.
    #[must_use]
    pub fn simple(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            params: Vec::new(),
            values: vec![Value {
                name: String::new(),
                subvals: vec![Some(value.to_owned())],
            }],
        }
    }

    /// First value of a parameter, by name.
    #[must_use]
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.values.first())
            .map(String::as_str)
    }

    /// The single sub-value of the single unnamed value group, if the
    /// line has exactly that shape.
    #[must_use]
    pub fn first_subvalue(&self) -> Option<&str> {
        let value = self.values.first()?;
        if !value.name.is_empty() || self.values.len() != 1 || value.subvals.len() != 1 {
            return None;
        }
        value.subvals[0].as_deref()
    }

    /// The single sub-value of the named value group, if unambiguous.
    #[must_use]
    pub fn first_subvalue_by_name(&self, name: &str) -> Option<&str> {
        first_subvalue_by_name(&self.values, name)
    }

    /// The sub-value list of the named value group.
    #[must_use]
    pub fn subval_list(&self, name: &str) -> Option<&[Option<String>]> {
        subval_list(&self.values, name)
    }
}

/// The single sub-value of the named group within a value list.
#[must_use]
pub(crate) fn first_subvalue_by_name<'a>(values: &'a [Value], name: &str) -> Option<&'a str> {
    let list = subval_list(values, name)?;
    if list.len() != 1 {
        return None;
    }
    list[0].as_deref()
}

/// The sub-value list of the named group within a value list.
#[must_use]
pub(crate) fn subval_list<'a>(values: &'a [Value], name: &str) -> Option<&'a [Option<String>]> {
    values
        .iter()
        .find(|v| v.name.eq_ignore_ascii_case(name))
        .map(|v| v.subvals.as_slice())
}

impl Component {
    /// An empty component.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            lines: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Parse a stream whose first component must be `VCALENDAR`.
    ///
    /// # Errors
    ///
    /// [`IcalError`] on structural violations.
    pub fn parse_calendar(input: &str) -> Result<Self, IcalError> {
        let root = Self::parse(input)?;
        if !root.name.eq_ignore_ascii_case("VCALENDAR") {
            return Err(IcalError::NotACalendar);
        }
        Ok(root)
    }

    /// Parse the first component of a stream, whatever its name.
    ///
    /// # Errors
    ///
    /// [`IcalError`] on structural violations.
    pub fn parse(input: &str) -> Result<Self, IcalError> {
        let mut lines = unfold(input).into_iter();
        let first = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => return Err(IcalError::NotACalendar),
            }
        };
        let (name, params, values) = split_line(&first)?;
        if !name.eq_ignore_ascii_case("BEGIN") || !params.is_empty() {
            return Err(IcalError::NotACalendar);
        }
        let root_name = single_raw_value(values).ok_or(IcalError::NotACalendar)?;
        let mut root = Self::new(&root_name);
        parse_into(&mut root, &mut lines)?;
        Ok(root)
    }

    /// First line with the given property name.
    #[must_use]
    pub fn line(&self, name: &str) -> Option<&Line> {
        self.lines.iter().find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// First nested component with the given name.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Serialize with CRLF line endings and 75-octet folding.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }

    fn serialize_into(&self, out: &mut String) {
        let _ = write!(out, "BEGIN:{}\r\n", self.name);
        for line in &self.lines {
            let line_begin = out.len();
            out.push_str(&line.name);
            for param in &line.params {
                let _ = write!(out, ";{}=", param.name);
                for (i, value) in param.values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    serialize_param_value(out, value);
                }
            }
            out.push(':');
            for (i, value) in line.values.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                if !value.name.is_empty() {
                    let _ = write!(out, "{}=", value.name);
                }
                for (j, subval) in value.subvals.iter().enumerate() {
                    if j > 0 {
                        out.push(',');
                    }
                    if let Some(subval) = subval {
                        serialize_value_string(out, line_begin, subval);
                    }
                }
            }
            out.push_str("\r\n");
        }
        for component in &self.components {
            component.serialize_into(out);
        }
        let _ = write!(out, "END:{}\r\n", self.name);
    }
}

fn parse_into(
    component: &mut Component,
    lines: &mut std::vec::IntoIter<String>,
) -> Result<(), IcalError> {
    while let Some(raw) = lines.next() {
        if raw.trim().is_empty() {
            continue;
        }
        let (name, params, value_part) = split_line(&raw)?;
        if name.eq_ignore_ascii_case("BEGIN") {
            let child_name =
                single_raw_value(value_part).ok_or_else(|| IcalError::BadLine(raw.clone()))?;
            let mut child = Component::new(&child_name);
            parse_into(&mut child, lines)?;
            component.components.push(child);
            continue;
        }
        if name.eq_ignore_ascii_case("END") {
            let end_name =
                single_raw_value(value_part).ok_or_else(|| IcalError::BadLine(raw.clone()))?;
            if !end_name.eq_ignore_ascii_case(&component.name) {
                return Err(IcalError::Unterminated(component.name.clone()));
            }
            return Ok(());
        }
        let values = if UNSTRUCTURED.iter().any(|n| name.eq_ignore_ascii_case(n)) {
            vec![Value {
                name: String::new(),
                subvals: vec![Some(unescape(value_part))],
            }]
        } else {
            parse_values(value_part)
        };
        component.lines.push(Line {
            name,
            params,
            values,
        });
    }
    Err(IcalError::Unterminated(component.name.clone()))
}

/// Unfold the physical lines of a stream into logical lines.
fn unfold(input: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in input.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(cont) = raw.strip_prefix([' ', '\t']) {
            if let Some(last) = out.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        out.push(raw.to_owned());
    }
    out
}

/// Split one logical line into property name, parameters, and the raw
/// value part after the first unquoted colon.
fn split_line(line: &str) -> Result<(String, Vec<Param>, &str), IcalError> {
    let bytes = line.as_bytes();
    let mut in_quotes = false;
    let mut colon = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b':' if !in_quotes => {
                colon = Some(i);
                break;
            }
            _ => {}
        }
    }
    let colon = colon.ok_or_else(|| IcalError::BadLine(line.to_owned()))?;
    let (tag_part, value_part) = (&line[..colon], &line[colon + 1..]);

    let mut segments = split_unquoted(tag_part, b';');
    let name = segments
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IcalError::BadLine(line.to_owned()))?
        .to_owned();
    let mut params = Vec::new();
    for segment in segments {
        let (pname, pvalues) = match segment.split_once('=') {
            Some((n, v)) => (n, v),
            None => (segment, ""),
        };
        params.push(Param {
            name: pname.to_owned(),
            values: split_unquoted(pvalues, b',')
                .map(|v| v.trim_matches('"').to_owned())
                .collect(),
        });
    }
    Ok((name, params, value_part))
}

/// Iterate over `sep`-separated pieces of `input`, honoring quoting.
fn split_unquoted(input: &str, sep: u8) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let bytes = input.as_bytes();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == sep && !in_quotes {
            pieces.push(&input[start..i]);
            start = i + 1;
        }
    }
    pieces.push(&input[start..]);
    pieces.into_iter()
}

/// The raw value part as a single unescaped string, for BEGIN/END lines.
fn single_raw_value(value_part: &str) -> Option<String> {
    let trimmed = value_part.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Split a value part at unescaped `;` into groups and `,` into
/// sub-values; an empty sub-value becomes NIL.
fn parse_values(value_part: &str) -> Vec<Value> {
    split_escaped(value_part, b';')
        .into_iter()
        .map(|group| {
            let (name, rest) = match find_unescaped(group, b'=') {
                Some(eq) if is_value_name(&group[..eq]) => {
                    (group[..eq].to_owned(), &group[eq + 1..])
                }
                _ => (String::new(), group),
            };
            let subvals = split_escaped(rest, b',')
                .into_iter()
                .map(|sv| (!sv.is_empty()).then(|| unescape(sv)))
                .collect();
            Value { name, subvals }
        })
        .collect()
}

fn is_value_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn find_unescaped(input: &str, needle: u8) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == needle {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn split_escaped(input: &str, sep: u8) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == sep {
            pieces.push(&input[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    pieces.push(&input[start..]);
    pieces
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn serialize_param_value(out: &mut String, value: &str) {
    if value.contains([',', ';', ':']) {
        let _ = write!(out, "\"{value}\"");
    } else {
        out.push_str(value);
    }
}

/// Write a value string with escaping, folding the physical line
/// whenever it runs past [`MAX_LINE`] octets.
fn serialize_value_string(out: &mut String, line_begin: usize, value: &str) {
    let mut line_len = out.len() - line_begin;
    // previous folds moved the physical line start forward
    if let Some(fold) = out.rfind("\r\n ") {
        if fold >= line_begin {
            line_len = out.len() - (fold + 3);
        }
    }
    for c in value.chars() {
        if line_len >= MAX_LINE {
            out.push_str("\r\n ");
            line_len = 0;
        }
        match c {
            '\\' | ';' | ',' => {
                out.push('\\');
                out.push(c);
                line_len += 2;
            }
            '\n' => {
                out.push_str("\\n");
                line_len += 2;
            }
            '\r' => {}
            _ => {
                out.push(c);
                line_len += c.len_utf8();
            }
        }
    }
}
