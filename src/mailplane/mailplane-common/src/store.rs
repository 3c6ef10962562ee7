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

//! Seams to the out-of-process collaborators.
//!
//! The store daemon, the directory service and the RFC 5322 exporter are
//! external to this plane; the orchestrator only sees these traits.

use crate::props::{BodyFormat, MessageContent, PropValue};

/// Errors surfaced by a store or directory backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or could not locate the object.
    #[error("store: {0}")]
    Backend(String),
    /// The link to the backend broke.
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// The per-user mail store, keyed by the store directory of the mailbox
/// the caller is logged on to.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Read a single property of a message.
    async fn get_message_property(
        &self,
        message_id: u64,
        proptag: u32,
    ) -> Result<Option<PropValue>, StoreError>;

    /// Load the complete message content.
    async fn read_message(
        &self,
        cpid: u32,
        message_id: u64,
    ) -> Result<Option<MessageContent>, StoreError>;

    /// Clear the submit flag of a message.
    async fn clear_submit(&self, message_id: u64) -> Result<(), StoreError>;

    /// Move a message to a target folder under a new message id.
    async fn movecopy_message(
        &self,
        cpid: u32,
        message_id: u64,
        folder_id: u64,
        new_id: u64,
    ) -> Result<(), StoreError>;

    /// Move a message into the Sent Items folder.
    async fn movecopy_to_sent(&self, cpid: u32, message_id: u64) -> Result<(), StoreError>;

    /// Hard-delete a message from its parent folder.
    async fn delete_message(
        &self,
        cpid: u32,
        parent_id: u64,
        message_id: u64,
    ) -> Result<(), StoreError>;

    /// Split a message entry id into (folder id, message id).
    fn message_entryid_to_ids(&self, entryid: &[u8]) -> Option<(u64, u64)>;
}

/// The user/address directory.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    /// Resolve an EX-style essdn to a primary SMTP address.
    async fn essdn_to_username(&self, essdn: &str) -> Option<String>;

    /// Resolve a recipient entry id to a primary SMTP address.
    async fn entryid_to_username(&self, entryid: &[u8]) -> Option<String>;

    /// Preferred language of a user, if the directory knows one.
    async fn get_user_lang(&self, username: &str) -> Option<String>;

    /// IANA timezone of a user, if the directory knows one.
    async fn get_timezone(&self, username: &str) -> Option<String>;

    /// Charset a language renders in.
    fn lang_to_charset(&self, lang: &str) -> Option<String>;

    /// Charset of a codepage id.
    fn cpid_to_charset(&self, cpid: u32) -> Option<String>;
}

/// Renders a stored message to RFC 5322 bytes. Never emits TNEF.
pub trait MessageExporter: Send + Sync {
    /// Render `content` with the requested body alternatives.
    fn export(&self, content: &MessageContent, body: BodyFormat) -> Result<Vec<u8>, StoreError>;
}
