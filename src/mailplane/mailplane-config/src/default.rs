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

use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;

use crate::field::{FieldBounce, FieldDelivery, FieldEvent, FieldQueue, FieldServer};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

impl FieldServer {
    pub(crate) fn default_host_id() -> String {
        gethostname()
    }

    pub(crate) fn default_transporter_threads() -> usize {
        4
    }
}

impl FieldQueue {
    pub(crate) fn default_path() -> PathBuf {
        PathBuf::from("./queue")
    }

    pub(crate) fn default_max_memory() -> usize {
        256 * MIB
    }
}

impl FieldDelivery {
    pub(crate) fn default_smtp_ip() -> IpAddr {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    }

    pub(crate) fn default_smtp_port() -> u16 {
        25
    }

    pub(crate) fn default_max_mail_length() -> usize {
        64 * MIB
    }

    pub(crate) fn default_max_rcpt_num() -> usize {
        256
    }

    pub(crate) fn default_max_mail_num() -> usize {
        1_000_000
    }
}

impl FieldBounce {
    pub(crate) fn default_data_path() -> PathBuf {
        PathBuf::from("./data")
    }

    pub(crate) fn default_separator() -> String {
        ";".to_owned()
    }
}

impl FieldEvent {
    pub(crate) fn default_listen_ip() -> IpAddr {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    }

    pub(crate) fn default_listen_port() -> u16 {
        33333
    }

    pub(crate) fn default_threads_num() -> usize {
        50
    }

    pub(crate) fn default_acl_path() -> PathBuf {
        PathBuf::from("event_acl.txt")
    }
}

fn gethostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
