//! Outbound submission.
//!
//! Three collaborating pieces: the [`smtp`] client drives the relay
//! dialogue for one message, the [`submit`] orchestrator turns a stored
//! MAPI message into a relayed RFC 5322 one and files the source
//! afterwards, and the [`bounce`] producer renders localized DSN and
//! notification mail from on-disk templates.

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

pub mod bounce;
pub mod smtp;
pub mod submit;

pub use bounce::{BounceError, BounceInfo, BounceKind, BounceProducer};
pub use smtp::{SmtpClient, SmtpError};
pub use submit::{SubmitContext, Submitter};
