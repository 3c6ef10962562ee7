//! The event fan-out service.
//!
//! Front-ends connect over TCP and speak a CRLF line protocol: they name
//! themselves (`ID`), advertise interest in mailbox folders (`SELECT` /
//! `UNSELECT`), publish change events (any other verb), or convert the
//! connection into a subscriber stream (`LISTEN`). Every publish is
//! fanned out to each interested resource except the publisher itself;
//! within one resource the subscriber connections take turns.
//!
//! Subscribers own a bounded FIFO. A full FIFO silently drops the event
//! for that subscriber while the publisher still sees `TRUE`; front-ends
//! rely on that wire behavior, so the drop is only counted.

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

mod acl;
mod broker;
mod wire;

pub use acl::load_acl;
pub use broker::{EventService, EventServiceBuilder};
