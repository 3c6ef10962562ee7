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

//! The bounce producer.
//!
//! Renders localized non-delivery reports from on-disk templates. A
//! template set lives under `mail_bounce/<charset>/`; a set is valid
//! when all four kind files are present and small. Template bodies
//! carry substitution tags (`<time>`, `<from>`, `<rcpt>`, `<subject>`,
//! `<parts>`, `<length>`) whose offsets are discovered once at load.
//!
//! Refresh is copy-and-swap: a new list is built from disk, then the
//! shared root is exchanged; in-flight renderings keep their snapshot.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use time::format_description::well_known::Rfc2822;

/// Upper bound on a template file.
const MAX_TEMPLATE_SIZE: u64 = 64 * 1024;
/// Upper bound on the rendered `<parts>` list.
const MAX_PARTS_LENGTH: usize = 128 * 1024;

/// The four report kinds, in template-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceKind {
    /// Out-of-office style automatic response.
    AutoResponse,
    /// The message exceeded a size ceiling.
    MailTooLarge,
    /// The message could not be rendered for the recipient.
    CannotDisplay,
    /// Any other delivery failure.
    GenericError,
}

impl BounceKind {
    const ALL: [Self; 4] = [
        Self::AutoResponse,
        Self::MailTooLarge,
        Self::CannotDisplay,
        Self::GenericError,
    ];

    /// The exact template file name of this kind.
    #[must_use]
    pub fn template_name(self) -> &'static str {
        match self {
            Self::AutoResponse => "BOUNCE_AUTO_RESPONSE",
            Self::MailTooLarge => "BOUNCE_MAIL_TOO_LARGE",
            Self::CannotDisplay => "BOUNCE_CANNOT_DISPLAY",
            Self::GenericError => "BOUNCE_GENERIC_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Time,
    From,
    Rcpt,
    Subject,
    Parts,
    Length,
}

const TAGS: [(Tag, &str); 6] = [
    (Tag::Time, "<time>"),
    (Tag::From, "<from>"),
    (Tag::Rcpt, "<rcpt>"),
    (Tag::Subject, "<subject>"),
    (Tag::Parts, "<parts>"),
    (Tag::Length, "<length>"),
];

/// One parsed template.
#[derive(Debug, Default, Clone)]
struct Template {
    from: String,
    subject: String,
    content_type: String,
    body: Vec<u8>,
    /// `(tag, offset into body)`, ascending by offset.
    format: Vec<(Tag, usize)>,
}

/// All templates of one charset.
#[derive(Debug, Clone)]
struct ResourceNode {
    charset: String,
    templates: [Template; 4],
}

#[derive(Debug, Default)]
struct ResourceList {
    nodes: Vec<ResourceNode>,
    default_index: usize,
}

/// Errors of the template loader.
#[derive(Debug, thiserror::Error)]
pub enum BounceError {
    /// `mail_bounce/` is not readable.
    #[error("cannot open bounce template directory {0}")]
    NoTemplateDir(std::path::PathBuf),
    /// No `ascii` charset directory was found.
    #[error("no \"ascii\" bounce mail templates in {0}")]
    NoAsciiFallback(std::path::PathBuf),
    /// A template file broke the header/body format.
    #[error("bounce mail template {0} format error")]
    Format(std::path::PathBuf),
}

/// What the caller knows about the failed message.
#[derive(Debug, Default, Clone)]
pub struct BounceInfo {
    /// `PR_SUBJECT` of the message, when present.
    pub subject: Option<String>,
    /// Attachment display names.
    pub parts: Vec<String>,
    /// `PR_MESSAGE_SIZE` in bytes.
    pub message_size: u32,
    /// Charset of the user's preferred language, when known.
    pub lang_charset: Option<String>,
    /// Charset mapped from the message `PR_INTERNET_CPID`, when known.
    pub cpid_charset: Option<String>,
    /// IANA timezone of the user, when known.
    pub timezone: Option<String>,
}

/// The producer. Load once with [`BounceProducer::refresh`], render as
/// often as needed.
#[derive(Debug)]
pub struct BounceProducer {
    separator: String,
    host_id: String,
    resources: RwLock<Arc<ResourceList>>,
    boundary_seq: AtomicU64,
}

impl BounceProducer {
    /// A producer with an empty template list.
    #[must_use]
    pub fn new(separator: &str, host_id: &str) -> Self {
        Self {
            separator: separator.to_owned(),
            host_id: host_id.to_owned(),
            resources: RwLock::new(Arc::new(ResourceList::default())),
            boundary_seq: AtomicU64::new(0),
        }
    }

    /// Rebuild the template list from `data_path/mail_bounce` and swap
    /// it in.
    ///
    /// # Errors
    ///
    /// [`BounceError`] when the directory is unusable or the mandatory
    /// `ascii` set is missing; the previous list stays in place then.
    pub fn refresh(&self, data_path: &Path) -> Result<(), BounceError> {
        let base = data_path.join("mail_bounce");
        let entries = std::fs::read_dir(&base)
            .map_err(|_| BounceError::NoTemplateDir(base.clone()))?;

        let mut nodes = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !check_subdir(&dir) {
                continue;
            }
            match load_subdir(&dir) {
                Ok(node) => nodes.push(node),
                Err(err) => tracing::warn!(%err, "skipping bounce template set"),
            }
        }
        let default_index = nodes
            .iter()
            .position(|n| n.charset.eq_ignore_ascii_case("ascii"))
            .ok_or(BounceError::NoAsciiFallback(base))?;

        let fresh = Arc::new(ResourceList {
            nodes,
            default_index,
        });
        *self
            .resources
            .write()
            .unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    /// Render the template body for one report, substituting every tag.
    /// Also returns the template's From, Subject and Content-Type.
    #[must_use]
    pub fn make_content(
        &self,
        from: &str,
        rcpt: &str,
        info: &BounceInfo,
        kind: BounceKind,
    ) -> Option<(String, String, String, String)> {
        let snapshot = self
            .resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if snapshot.nodes.is_empty() {
            return None;
        }
        let charset = info
            .lang_charset
            .as_deref()
            .or(info.cpid_charset.as_deref())
            .unwrap_or("ascii");
        let node = snapshot
            .nodes
            .iter()
            .find(|n| n.charset.eq_ignore_ascii_case(charset))
            .unwrap_or(&snapshot.nodes[snapshot.default_index]);
        let template = &node.templates[kind as usize];

        let date_buff = local_timestamp(info.timezone.as_deref());
        let mut out = Vec::with_capacity(template.body.len() + 256);
        let mut prev = 0;
        for &(tag, position) in &template.format {
            out.extend_from_slice(&template.body[prev..position]);
            prev = position + tag_text(tag).len();
            match tag {
                Tag::Time => out.extend_from_slice(date_buff.as_bytes()),
                Tag::From => out.extend_from_slice(from.as_bytes()),
                Tag::Rcpt => out.extend_from_slice(rcpt.as_bytes()),
                Tag::Subject => {
                    if let Some(subject) = &info.subject {
                        out.extend_from_slice(subject.as_bytes());
                    }
                }
                Tag::Parts => {
                    let mut joined = String::new();
                    for part in &info.parts {
                        if joined.len() + part.len() >= MAX_PARTS_LENGTH {
                            break;
                        }
                        if !joined.is_empty() {
                            joined.push_str(&self.separator);
                        }
                        joined.push_str(part);
                    }
                    out.extend_from_slice(joined.as_bytes());
                }
                Tag::Length => {
                    out.extend_from_slice(byte_size_string(info.message_size).as_bytes());
                }
            }
        }
        out.extend_from_slice(&template.body[prev..]);
        Some((
            String::from_utf8_lossy(&out).into_owned(),
            template.from.clone(),
            template.subject.clone(),
            template.content_type.clone(),
        ))
    }

    /// Assemble the full `multipart/report` message for one failed
    /// delivery.
    #[must_use]
    pub fn make(
        &self,
        from: &str,
        rcpt: &str,
        info: &BounceInfo,
        kind: BounceKind,
    ) -> Option<Vec<u8>> {
        let (content, mime_from, subject, content_type) =
            self.make_content(from, rcpt, info, kind)?;
        let boundary = format!(
            "=_mailplane_{:08x}_{:08x}",
            std::process::id(),
            self.boundary_seq.fetch_add(1, Ordering::Relaxed)
        );
        let date = time::OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .unwrap_or_default();

        let mut head = String::with_capacity(512);
        head.push_str(
            "Received: from unknown (helo localhost) (unknown@127.0.0.1)\r\n\tby herculiz with SMTP\r\n",
        );
        head.push_str(&format!("From: {mime_from}\r\n"));
        head.push_str(&format!("To: <{from}>\r\n"));
        head.push_str("MIME-Version: 1.0\r\n");
        head.push_str("X-Auto-Response-Suppress: All\r\n");
        head.push_str(&format!("Date: {date}\r\n"));
        head.push_str(&format!("Subject: {subject}\r\n"));
        head.push_str(&format!(
            "Content-Type: multipart/report;\r\n\treport-type=delivery-status;\r\n\tboundary=\"{boundary}\"\r\n"
        ));
        head.push_str("\r\n");
        head.push_str(&format!("--{boundary}\r\n"));
        head.push_str(&format!(
            "Content-Type: {content_type};\r\n\tcharset=\"utf-8\"\r\n"
        ));
        head.push_str("Content-Transfer-Encoding: base64\r\n\r\n");

        let mut mail = Vec::with_capacity(content.len() * 2 + 1024);
        mail.extend_from_slice(head.as_bytes());
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        for chunk in encoded.as_bytes().chunks(76) {
            mail.extend_from_slice(chunk);
            mail.extend_from_slice(b"\r\n");
        }

        let mut tail = String::with_capacity(256);
        tail.push_str(&format!("--{boundary}\r\n"));
        tail.push_str("Content-Type: message/delivery-status\r\n\r\n");
        tail.push_str(&format!("Reporting-MTA: dns;{}\r\n", self.host_id));
        tail.push_str(&format!("Arrival-Date: {date}\r\n"));
        tail.push_str("\r\n");
        tail.push_str(&format!("Final-Recipient: rfc822;{rcpt}\r\n"));
        tail.push_str("Action: failed\r\n");
        tail.push_str("Status: 5.0.0\r\n");
        tail.push_str(&format!("Remote-MTA: dns;{}\r\n", self.host_id));
        tail.push_str("\r\n");
        tail.push_str(&format!("--{boundary}--\r\n"));
        mail.extend_from_slice(tail.as_bytes());
        Some(mail)
    }
}

fn tag_text(tag: Tag) -> &'static str {
    TAGS.iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, text)| *text)
        .expect("every tag is in the table")
}

/// `MM/DD/YY HH:MM:SS [zone]` in the user's zone when one resolves,
/// UTC otherwise.
fn local_timestamp(timezone: Option<&str>) -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let (local, zone_suffix) = match timezone.and_then(|tz| mailplane_tz::TimeZone::load(tz).ok())
    {
        Some(zone) => (zone.utc_to_local(now), timezone.map(str::to_owned)),
        None => (now, None),
    };
    let stamp = time::OffsetDateTime::from_unix_timestamp(local)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let format = time::macros::format_description!(
        "[month]/[day]/[year repr:last_two] [hour]:[minute]:[second]"
    );
    let mut out = stamp.format(&format).unwrap_or_default();
    if let Some(zone) = zone_suffix {
        out.push(' ');
        out.push_str(&zone);
    }
    out
}

/// Human-readable byte count in the `1.2K` style.
fn byte_size_string(size: u32) -> String {
    let size = f64::from(size);
    if size >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1}G", size / (1024.0 * 1024.0 * 1024.0))
    } else if size >= 1024.0 * 1024.0 {
        format!("{:.1}M", size / (1024.0 * 1024.0))
    } else if size >= 1024.0 {
        format!("{:.1}K", size / 1024.0)
    } else {
        format!("{size:.0}")
    }
}

/// A charset directory is usable when all four template files exist as
/// regular files under the size bound.
fn check_subdir(dir: &Path) -> bool {
    BounceKind::ALL.iter().all(|kind| {
        std::fs::metadata(dir.join(kind.template_name()))
            .map(|meta| meta.is_file() && meta.len() < MAX_TEMPLATE_SIZE)
            .unwrap_or(false)
    })
}

fn load_subdir(dir: &Path) -> Result<ResourceNode, BounceError> {
    let mut templates: [Template; 4] = Default::default();
    for (slot, kind) in templates.iter_mut().zip(BounceKind::ALL) {
        let path = dir.join(kind.template_name());
        let raw = std::fs::read(&path).map_err(|_| BounceError::Format(path.clone()))?;
        *slot = parse_template(&raw).ok_or(BounceError::Format(path))?;
    }
    Ok(ResourceNode {
        charset: dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        templates,
    })
}

/// Split an RFC 5322 header block off the body, keep the three
/// recognized headers, and index the tag offsets ascending.
fn parse_template(raw: &[u8]) -> Option<Template> {
    let mut template = Template::default();
    let mut pos = 0;
    loop {
        let rest = &raw[pos..];
        let line_end = rest.iter().position(|&b| b == b'\n')?;
        let line = &rest[..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        pos += line_end + 1;
        if line.is_empty() {
            break;
        }
        let text = std::str::from_utf8(line).ok()?;
        if let Some((name, value)) = text.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("Content-Type") {
                template.content_type = value.to_owned();
            } else if name.eq_ignore_ascii_case("From") {
                template.from = value.to_owned();
            } else if name.eq_ignore_ascii_case("Subject") {
                template.subject = value.to_owned();
            }
        } else {
            return None;
        }
    }
    template.body = raw[pos..].to_vec();
    for i in 0..template.body.len() {
        if template.body[i] != b'<' {
            continue;
        }
        for (tag, text) in TAGS {
            if template.body[i..]
                .get(..text.len())
                .is_some_and(|probe| probe.eq_ignore_ascii_case(text.as_bytes()))
            {
                template.format.push((tag, i));
                break;
            }
        }
    }
    template.format.sort_by_key(|&(_, position)| position);
    Some(template)
}
