//! Shared domain types for the mailplane workspace.
//!
//! Everything the long-lived services exchange lives here: the minimal
//! MAPI property model the submission orchestrator operates on, the
//! traits behind which the out-of-process store and directory sit, and
//! the process-wide shutdown token.

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

mod props;
mod stop;
mod store;

pub use props::{
    BodyFormat, MessageContent, PropList, PropValue, Recipient, MESSAGE_FORMAT_HTML_ONLY,
    MESSAGE_FORMAT_PLAIN_AND_HTML, MSGFLAG_RESEND, PR_ADDRTYPE, PR_ATTACH_LONG_FILENAME,
    PR_DELETE_AFTER_SUBMIT, PR_EMAIL_ADDRESS, PR_ENTRYID, PR_INTERNET_CPID,
    PR_INTERNET_MAIL_OVERRIDE_FORMAT, PR_MESSAGE_FLAGS, PR_MESSAGE_SIZE, PR_PARENT_FOLDER_ID,
    PR_RECIPIENT_TYPE, PR_SENTMAIL_SVREID, PR_SMTP_ADDRESS, PR_SUBJECT, PR_TARGET_ENTRYID,
    RECIPIENT_TYPE_NEED_RESEND,
};
pub use stop::StopToken;
pub use store::{Directory, MessageExporter, Store, StoreError};
