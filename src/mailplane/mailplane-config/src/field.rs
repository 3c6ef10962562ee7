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

//! The configuration tree. Every field carries a serde default so a
//! partial file (or none at all) yields a runnable configuration.

use std::net::IpAddr;
use std::path::PathBuf;

/// Root of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Daemon-wide settings.
    #[serde(default)]
    pub server: FieldServer,
    /// Mail queue settings.
    #[serde(default)]
    pub queue: FieldQueue,
    /// Outbound submission settings.
    #[serde(default)]
    pub delivery: FieldDelivery,
    /// Bounce template settings.
    #[serde(default)]
    pub bounce: FieldBounce,
    /// Event fan-out service settings.
    #[serde(default)]
    pub event: FieldEvent,
    /// Where this configuration was loaded from, if it came from a file.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: FieldServer::default(),
            queue: FieldQueue::default(),
            delivery: FieldDelivery::default(),
            bounce: FieldBounce::default(),
            event: FieldEvent::default(),
            path: None,
        }
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldServer {
    /// Name the daemon announces in HELO and Reporting-MTA.
    #[serde(default = "FieldServer::default_host_id")]
    pub host_id: String,
    /// Workers draining the dequeue engine.
    #[serde(default = "FieldServer::default_transporter_threads")]
    pub transporter_threads: usize,
}

impl Default for FieldServer {
    fn default() -> Self {
        Self {
            host_id: Self::default_host_id(),
            transporter_threads: Self::default_transporter_threads(),
        }
    }
}

/// Mail queue settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldQueue {
    /// Queue directory holding `mess/`, `save/` and `token.ipc`.
    #[serde(default = "FieldQueue::default_path")]
    pub path: PathBuf,
    /// Hard cap on in-RAM spill bytes.
    #[serde(default = "FieldQueue::default_max_memory")]
    pub max_memory: usize,
}

impl Default for FieldQueue {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            max_memory: Self::default_max_memory(),
        }
    }
}

/// Outbound submission settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDelivery {
    /// Address of the SMTP relay.
    #[serde(default = "FieldDelivery::default_smtp_ip")]
    pub smtp_ip: IpAddr,
    /// Port of the SMTP relay.
    #[serde(default = "FieldDelivery::default_smtp_port")]
    pub smtp_port: u16,
    /// Largest message the orchestrator accepts, in bytes.
    #[serde(default = "FieldDelivery::default_max_mail_length")]
    pub max_mail_length: usize,
    /// Most recipients a single submission may carry.
    #[serde(default = "FieldDelivery::default_max_rcpt_num")]
    pub max_rcpt_num: usize,
    /// Most messages a session may submit.
    #[serde(default = "FieldDelivery::default_max_mail_num")]
    pub max_mail_num: usize,
}

impl Default for FieldDelivery {
    fn default() -> Self {
        Self {
            smtp_ip: Self::default_smtp_ip(),
            smtp_port: Self::default_smtp_port(),
            max_mail_length: Self::default_max_mail_length(),
            max_rcpt_num: Self::default_max_rcpt_num(),
            max_mail_num: Self::default_max_mail_num(),
        }
    }
}

/// Bounce template settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldBounce {
    /// Data directory containing `mail_bounce/`.
    #[serde(default = "FieldBounce::default_data_path")]
    pub data_path: PathBuf,
    /// Delimiter between attachment names in `<parts>`.
    #[serde(default = "FieldBounce::default_separator")]
    pub separator_for_bounce: String,
}

impl Default for FieldBounce {
    fn default() -> Self {
        Self {
            data_path: Self::default_data_path(),
            separator_for_bounce: Self::default_separator(),
        }
    }
}

/// Event fan-out service settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldEvent {
    /// Listen address.
    #[serde(default = "FieldEvent::default_listen_ip")]
    pub listen_ip: IpAddr,
    /// Listen port.
    #[serde(default = "FieldEvent::default_listen_port")]
    pub listen_port: u16,
    /// Worker budget; also the concurrent-connection cap.
    #[serde(default = "FieldEvent::default_threads_num")]
    pub threads_num: usize,
    /// Allow-list file of peer addresses. A missing file means `{::1}`.
    #[serde(default = "FieldEvent::default_acl_path")]
    pub acl_path: PathBuf,
}

impl Default for FieldEvent {
    fn default() -> Self {
        Self {
            listen_ip: Self::default_listen_ip(),
            listen_port: Self::default_listen_port(),
            threads_num: Self::default_threads_num(),
            acl_path: Self::default_acl_path(),
        }
    }
}
