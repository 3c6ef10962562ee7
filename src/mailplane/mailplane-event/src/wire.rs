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

//! CRLF line framing and the selection-key derivation shared by the
//! command and subscriber sides.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Commands are bounded to this many octets including the CRLF.
pub(crate) const MAX_CMD_LENGTH: usize = 64 * 1024;

/// Result of waiting for a line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A complete line, terminator stripped.
    Line(String),
    /// Nothing arrived within the timeout; buffered bytes are kept.
    Timeout,
    /// Peer gone, line over-long, or not valid UTF-8.
    Closed,
}

/// Per-connection read buffer carrying bytes past the last CRLF.
///
/// Reads are restartable: a caller may drop the `read_mark` future
/// mid-wait (e.g. losing a `select!` race) and call again later without
/// losing buffered bytes.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    data: Vec<u8>,
}

impl LineBuffer {
    /// Wait for the next CRLF-terminated line, without the terminator.
    pub(crate) async fn read_mark<R>(&mut self, stream: &mut R, timeout: Duration) -> ReadOutcome
    where
        R: AsyncReadExt + Unpin,
    {
        loop {
            if let Some(pos) = self.data.windows(2).position(|w| w == b"\r\n") {
                let line = self.data.drain(..pos + 2).take(pos).collect::<Vec<u8>>();
                return match String::from_utf8(line) {
                    Ok(line) => ReadOutcome::Line(line),
                    Err(_) => ReadOutcome::Closed,
                };
            }
            if self.data.len() >= MAX_CMD_LENGTH {
                return ReadOutcome::Closed;
            }
            let mut chunk = [0_u8; 4096];
            let read = match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
                Err(_elapsed) => return ReadOutcome::Timeout,
                Ok(Err(_)) | Ok(Ok(0)) => return ReadOutcome::Closed,
                Ok(Ok(read)) => read,
            };
            self.data.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Send one reply line, CRLF appended.
pub(crate) async fn write_line<W>(stream: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await
}

/// Derive the interest key from the two tokens after a verb: the first
/// lowercased, a colon, the second verbatim. Enforces the wire length
/// caps.
pub(crate) fn selection_key(first: &str, second: &str) -> Option<String> {
    if first.is_empty() || second.is_empty() || first.len() > 127 || second.len() > 63 {
        return None;
    }
    Some(format!("{}:{}", first.to_lowercase(), second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn read_mark_frames_lines_and_keeps_the_tail() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"ID one\r\nPI").await.unwrap();

        let mut buffer = LineBuffer::default();
        let line = buffer.read_mark(&mut server, Duration::from_secs(1)).await;
        assert_eq!(line, ReadOutcome::Line("ID one".to_owned()));

        // the partial tail waits in the buffer across a timeout
        let line = buffer.read_mark(&mut server, Duration::from_millis(20)).await;
        assert_eq!(line, ReadOutcome::Timeout);

        client.write_all(b"NG\r\n").await.unwrap();
        let line = buffer.read_mark(&mut server, Duration::from_secs(1)).await;
        assert_eq!(line, ReadOutcome::Line("PING".to_owned()));
    }

    #[test]
    fn selection_keys_lowercase_the_first_token() {
        assert_eq!(selection_key("Alice", "INBOX").as_deref(), Some("alice:INBOX"));
        assert_eq!(selection_key("", "INBOX"), None);
        assert!(selection_key(&"x".repeat(128), "f").is_none());
        assert!(selection_key("u", &"x".repeat(64)).is_none());
    }
}
