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

//! The relay-side SMTP dialogue.
//!
//! One connection per message: greet, `HELO`, `MAIL FROM`, one
//! `RCPT TO` per recipient, `DATA`, the dot-stuffed payload, `QUIT`.
//! Every non-success path still sends `QUIT` before closing so the
//! relay never sees a dropped half-transaction.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Bounded wait for each relay response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// How a relay response classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseClass {
    Ok,
    Temporary,
    Permanent,
    Unknown,
    TimedOut,
}

/// A failed relay conversation.
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    /// TCP connect failed.
    #[error("cannot connect to SMTP server [{relay}]: {source}")]
    Connect {
        /// Relay address.
        relay: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The relay stopped answering.
    #[error("timeout with SMTP server [{relay}] after {command}")]
    Timeout {
        /// Relay address.
        relay: String,
        /// The command awaiting its response.
        command: &'static str,
    },
    /// A 4xx answer.
    #[error("SMTP server responded {response:?} after {command}")]
    Temporary {
        /// The command the relay objected to.
        command: &'static str,
        /// The relay's words.
        response: String,
    },
    /// A 5xx answer.
    #[error("SMTP server rejected {command}: {response:?}")]
    Permanent {
        /// The command the relay rejected.
        command: &'static str,
        /// The relay's words.
        response: String,
    },
    /// Anything that is neither success nor 4xx nor 5xx.
    #[error("unexpected SMTP response {response:?} after {command}")]
    Unknown {
        /// The command awaiting its response.
        command: &'static str,
        /// The relay's words.
        response: String,
    },
    /// Writing a command or the payload failed.
    #[error("cannot send {command} to SMTP server: {source}")]
    Write {
        /// The command being sent.
        command: &'static str,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl SmtpError {
    /// Whether retrying the same message is pointless.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Client for one configured relay.
#[derive(Debug, Clone)]
pub struct SmtpClient {
    ip: IpAddr,
    port: u16,
    host_id: String,
}

impl SmtpClient {
    /// A client talking to `ip:port`, announcing `host_id` in HELO.
    #[must_use]
    pub fn new(ip: IpAddr, port: u16, host_id: String) -> Self {
        Self { ip, port, host_id }
    }

    fn relay(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Deliver one message to the relay.
    ///
    /// A recipient without `@` is rewritten as `<rcpt@none>`. An
    /// `X-Mailer` header is prepended to the payload before streaming.
    ///
    /// # Errors
    ///
    /// [`SmtpError`] describing the first failing step; the connection
    /// is quit and closed in every case.
    pub async fn send_mail(
        &self,
        mail: &[u8],
        sender: &str,
        rcpt_list: &[String],
    ) -> Result<(), SmtpError> {
        let mut stream = TcpStream::connect((self.ip, self.port))
            .await
            .map_err(|source| SmtpError::Connect {
                relay: self.relay(),
                source,
            })?;

        self.expect(&mut stream, "greeting", false).await?;

        self.command(&mut stream, "HELO", format!("helo {}\r\n", self.host_id))
            .await?;
        self.expect(&mut stream, "HELO", false).await?;

        self.command(
            &mut stream,
            "MAIL FROM",
            format!("mail from:<{sender}>\r\n"),
        )
        .await?;
        self.expect(&mut stream, "MAIL FROM", false).await?;

        for rcpt in rcpt_list {
            let line = if rcpt.contains('@') {
                format!("rcpt to:<{rcpt}>\r\n")
            } else {
                format!("rcpt to:<{rcpt}@none>\r\n")
            };
            self.command(&mut stream, "RCPT TO", line).await?;
            self.expect(&mut stream, "RCPT TO", false).await?;
        }

        self.command(&mut stream, "DATA", "data\r\n".to_owned())
            .await?;
        self.expect(&mut stream, "DATA", true).await?;

        let mut payload = format!(
            "X-Mailer: mailplane-delivery {}\r\n",
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes();
        dot_stuff_into(mail, &mut payload);
        payload.extend_from_slice(b".\r\n");
        if let Err(source) = stream.write_all(&payload).await {
            let _ = stream.write_all(b"quit\r\n").await;
            return Err(SmtpError::Write {
                command: "mail content",
                source,
            });
        }
        self.expect(&mut stream, "mail content", false).await?;

        let _ = stream.write_all(b"quit\r\n").await;
        tracing::info!(relay = %self.relay(), %sender, "message accepted by relay");
        Ok(())
    }

    async fn command(
        &self,
        stream: &mut TcpStream,
        name: &'static str,
        line: String,
    ) -> Result<(), SmtpError> {
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|source| SmtpError::Write {
                command: name,
                source,
            })
    }

    /// Read one response and classify it; anything but success quits
    /// and reports.
    async fn expect(
        &self,
        stream: &mut TcpStream,
        command: &'static str,
        expect_3xx: bool,
    ) -> Result<(), SmtpError> {
        let (class, response) = read_response(stream, expect_3xx).await;
        match class {
            ResponseClass::Ok => Ok(()),
            ResponseClass::TimedOut => Err(SmtpError::Timeout {
                relay: self.relay(),
                command,
            }),
            other => {
                let _ = stream.write_all(b"quit\r\n").await;
                Err(match other {
                    ResponseClass::Temporary => SmtpError::Temporary { command, response },
                    ResponseClass::Permanent => SmtpError::Permanent { command, response },
                    _ => SmtpError::Unknown { command, response },
                })
            }
        }
    }
}

async fn read_response(stream: &mut TcpStream, expect_3xx: bool) -> (ResponseClass, String) {
    let mut buf = [0_u8; 1024];
    let read = match tokio::time::timeout(RESPONSE_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(read)) if read > 0 => read,
        _ => return (ResponseClass::TimedOut, String::new()),
    };
    let mut response = String::from_utf8_lossy(&buf[..read]).into_owned();
    while response.ends_with(['\r', '\n']) {
        response.pop();
    }
    let mut bytes = response.bytes();
    let first = bytes.next().unwrap_or(0);
    let code_ok = bytes.next().is_some_and(|b| b.is_ascii_digit())
        && bytes.next().is_some_and(|b| b.is_ascii_digit());
    let class = match first {
        b'2' if !expect_3xx && code_ok => ResponseClass::Ok,
        b'3' if expect_3xx && code_ok => ResponseClass::Ok,
        b'4' => ResponseClass::Temporary,
        b'5' => ResponseClass::Permanent,
        _ => ResponseClass::Unknown,
    };
    (class, response)
}

/// Copy `mail` transparently for the DATA phase: double a leading dot
/// on every line and guarantee a trailing CRLF.
fn dot_stuff_into(mail: &[u8], out: &mut Vec<u8>) {
    let mut at_line_start = true;
    for &byte in mail {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !mail.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
}
