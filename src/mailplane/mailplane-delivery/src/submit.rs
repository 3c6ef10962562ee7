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

//! The submission orchestrator.
//!
//! Takes a committed message out of the store, resolves its recipients
//! to SMTP addresses, renders it to RFC 5322, relays it, and files the
//! source: to the folder a `PR_TARGET_ENTRYID` names, to the void when
//! delete-after-submit is set, or to Sent Items otherwise. A failure at
//! any step leaves the source untouched with its submit flag still set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mailplane_common::{
    BodyFormat, Directory, MessageContent, MessageExporter, PropValue, Recipient, Store,
    MESSAGE_FORMAT_HTML_ONLY, MESSAGE_FORMAT_PLAIN_AND_HTML, MSGFLAG_RESEND, PR_ADDRTYPE,
    PR_DELETE_AFTER_SUBMIT, PR_EMAIL_ADDRESS, PR_ENTRYID, PR_INTERNET_CPID,
    PR_INTERNET_MAIL_OVERRIDE_FORMAT, PR_MESSAGE_FLAGS, PR_PARENT_FOLDER_ID, PR_RECIPIENT_TYPE,
    PR_SMTP_ADDRESS, PR_TARGET_ENTRYID, RECIPIENT_TYPE_NEED_RESEND,
};

use crate::smtp::SmtpClient;

/// The session the submission happens under.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    /// Account of the logged-on user; becomes the envelope sender.
    pub account: String,
    /// Code page of the session, appended to messages that carry none.
    pub cpid: u32,
}

#[derive(Debug, thiserror::Error)]
enum SubmitStep {
    #[error("cannot get parent folder id")]
    ParentFolder,
    #[error("cannot read message content")]
    ReadMessage,
    #[error("cannot get message flags")]
    MessageFlags,
    #[error("message has no recipients")]
    NoRecipients,
    #[error("cannot resolve recipient to an SMTP address")]
    ResolveRecipient,
    #[error("recipient count {0} exceeds the submission ceiling")]
    TooManyRecipients(usize),
    #[error("rendered message of {0} bytes exceeds the submission ceiling")]
    MailTooLarge(usize),
    #[error("session already submitted {0} messages, ceiling reached")]
    TooManyMessages(usize),
    #[error("cannot export message to RFC 5322")]
    Export,
    #[error("relay refused the message: {0}")]
    Relay(#[from] crate::smtp::SmtpError),
    #[error("cannot retrieve target entryid")]
    TargetEntryId,
    #[error("cannot clear submit flag")]
    ClearSubmit,
    #[error("cannot file message after submission")]
    FileMessage,
    #[error("store failure: {0}")]
    Store(#[from] mailplane_common::StoreError),
}

/// The orchestrator. One per mounted store.
pub struct Submitter {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    exporter: Arc<dyn MessageExporter>,
    smtp: SmtpClient,
    max_rcpt_num: usize,
    max_mail_length: usize,
    max_mail_num: usize,
    /// Messages this session has relayed so far.
    submitted: AtomicUsize,
}

impl Submitter {
    /// Wire the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        exporter: Arc<dyn MessageExporter>,
        smtp: SmtpClient,
        max_rcpt_num: usize,
        max_mail_length: usize,
        max_mail_num: usize,
    ) -> Self {
        Self {
            store,
            directory,
            exporter,
            smtp,
            max_rcpt_num,
            max_mail_length,
            max_mail_num,
            submitted: AtomicUsize::new(0),
        }
    }

    /// Send a committed message and post-process the source.
    ///
    /// Returns whether the full submission completed: relay acceptance
    /// plus the post-processing move or delete.
    pub async fn send_message(&self, ctx: &SubmitContext, message_id: u64, b_submit: bool) -> bool {
        match self.try_send_message(ctx, message_id, b_submit).await {
            Ok(()) => true,
            Err(step) => {
                tracing::warn!(mid = format_args!("0x{message_id:x}"), %step, "submission failed");
                false
            }
        }
    }

    async fn try_send_message(
        &self,
        ctx: &SubmitContext,
        message_id: u64,
        _b_submit: bool,
    ) -> Result<(), SubmitStep> {
        let submitted = self.submitted.load(Ordering::Relaxed);
        if submitted >= self.max_mail_num {
            return Err(SubmitStep::TooManyMessages(submitted));
        }

        let parent_id = self
            .store
            .get_message_property(message_id, PR_PARENT_FOLDER_ID)
            .await?
            .and_then(|v| v.as_long_long())
            .ok_or(SubmitStep::ParentFolder)?;

        let mut content = self
            .store
            .read_message(ctx.cpid, message_id)
            .await?
            .ok_or(SubmitStep::ReadMessage)?;
        content
            .props
            .insert_if_absent(PR_INTERNET_CPID, PropValue::Long(ctx.cpid));

        let message_flags = content
            .props
            .get(PR_MESSAGE_FLAGS)
            .and_then(PropValue::as_long)
            .ok_or(SubmitStep::MessageFlags)?;
        let b_resend = message_flags & MSGFLAG_RESEND != 0;

        if content.recipients.is_empty() {
            return Err(SubmitStep::NoRecipients);
        }
        let rcpt_list = self.resolve_recipients(&content, b_resend).await?;
        if rcpt_list.is_empty() {
            return Err(SubmitStep::NoRecipients);
        }
        if rcpt_list.len() > self.max_rcpt_num {
            return Err(SubmitStep::TooManyRecipients(rcpt_list.len()));
        }

        let body_type = match content
            .props
            .get(PR_INTERNET_MAIL_OVERRIDE_FORMAT)
            .and_then(PropValue::as_long)
        {
            None => BodyFormat::PlainAndHtml,
            Some(v) if v & MESSAGE_FORMAT_PLAIN_AND_HTML != 0 => BodyFormat::PlainAndHtml,
            Some(v) if v & MESSAGE_FORMAT_HTML_ONLY != 0 => BodyFormat::HtmlOnly,
            Some(_) => BodyFormat::PlainOnly,
        };

        let mail = self
            .exporter
            .export(&content, body_type)
            .map_err(|_| SubmitStep::Export)?;
        if mail.len() > self.max_mail_length {
            return Err(SubmitStep::MailTooLarge(mail.len()));
        }

        self.smtp.send_mail(&mail, &ctx.account, &rcpt_list).await?;
        // the message is out the door; it counts even if filing fails
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let b_delete = content
            .props
            .get(PR_DELETE_AFTER_SUBMIT)
            .and_then(PropValue::as_bool)
            .unwrap_or(false);
        let target = content
            .props
            .get(PR_TARGET_ENTRYID)
            .and_then(PropValue::as_binary)
            .map(<[u8]>::to_vec);

        if let Some(target) = target {
            let (folder_id, new_id) = self
                .store
                .message_entryid_to_ids(&target)
                .ok_or(SubmitStep::TargetEntryId)?;
            self.store
                .clear_submit(message_id)
                .await
                .map_err(|_| SubmitStep::ClearSubmit)?;
            self.store
                .movecopy_message(ctx.cpid, message_id, folder_id, new_id)
                .await
                .map_err(|_| SubmitStep::FileMessage)?;
        } else if b_delete {
            self.store
                .delete_message(ctx.cpid, parent_id, message_id)
                .await
                .map_err(|_| SubmitStep::FileMessage)?;
        } else {
            self.store
                .clear_submit(message_id)
                .await
                .map_err(|_| SubmitStep::ClearSubmit)?;
            self.store
                .movecopy_to_sent(ctx.cpid, message_id)
                .await
                .map_err(|_| SubmitStep::FileMessage)?;
        }
        Ok(())
    }

    /// Derive the SMTP address of every recipient taking part in this
    /// submission: the resolved `PR_SMTP_ADDRESS` when present, the
    /// plain address for type `SMTP`, the directory resolution of an
    /// `EX` essdn, and the entry-id resolution for everything else.
    async fn resolve_recipients(
        &self,
        content: &MessageContent,
        b_resend: bool,
    ) -> Result<Vec<String>, SubmitStep> {
        let mut rcpt_list = Vec::new();
        for recipient in &content.recipients {
            if b_resend {
                let Some(rcpt_type) = recipient.0.get(PR_RECIPIENT_TYPE).and_then(PropValue::as_long)
                else {
                    continue;
                };
                if rcpt_type & RECIPIENT_TYPE_NEED_RESEND == 0 {
                    continue;
                }
            }
            if let Some(smtp) = recipient.0.get(PR_SMTP_ADDRESS).and_then(PropValue::as_str) {
                if !smtp.is_empty() {
                    rcpt_list.push(smtp.to_owned());
                    continue;
                }
            }
            match recipient.0.get(PR_ADDRTYPE).and_then(PropValue::as_str) {
                Some(addrtype) if addrtype.eq_ignore_ascii_case("SMTP") => {
                    let address = recipient
                        .0
                        .get(PR_EMAIL_ADDRESS)
                        .and_then(PropValue::as_str)
                        .ok_or(SubmitStep::ResolveRecipient)?;
                    rcpt_list.push(address.to_owned());
                }
                Some(addrtype) if addrtype.eq_ignore_ascii_case("EX") => {
                    let resolved = match recipient
                        .0
                        .get(PR_EMAIL_ADDRESS)
                        .and_then(PropValue::as_str)
                    {
                        Some(essdn) => self.directory.essdn_to_username(essdn).await,
                        None => None,
                    };
                    match resolved {
                        Some(username) => rcpt_list.push(username),
                        None => rcpt_list.push(self.resolve_by_entryid(recipient).await?),
                    }
                }
                _ => rcpt_list.push(self.resolve_by_entryid(recipient).await?),
            }
        }
        Ok(rcpt_list)
    }

    async fn resolve_by_entryid(&self, recipient: &Recipient) -> Result<String, SubmitStep> {
        let entryid = recipient
            .0
            .get(PR_ENTRYID)
            .and_then(PropValue::as_binary)
            .ok_or(SubmitStep::ResolveRecipient)?;
        self.directory
            .entryid_to_username(entryid)
            .await
            .ok_or(SubmitStep::ResolveRecipient)
    }
}

#[cfg(test)]
mod tests;
