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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mailplane_common::{
    BodyFormat, Directory, MessageContent, MessageExporter, PropList, PropValue, Recipient, Store,
    StoreError, MSGFLAG_RESEND, PR_ADDRTYPE, PR_DELETE_AFTER_SUBMIT, PR_EMAIL_ADDRESS, PR_ENTRYID,
    PR_MESSAGE_FLAGS, PR_PARENT_FOLDER_ID, PR_RECIPIENT_TYPE, PR_SMTP_ADDRESS, PR_TARGET_ENTRYID,
    RECIPIENT_TYPE_NEED_RESEND,
};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use super::{SubmitContext, Submitter};
use crate::smtp::SmtpClient;

const PARENT_FOLDER: u64 = 0x11;

#[derive(Default)]
struct MockStore {
    content: Mutex<Option<MessageContent>>,
    actions: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Store for MockStore {
    async fn get_message_property(
        &self,
        _message_id: u64,
        proptag: u32,
    ) -> Result<Option<PropValue>, StoreError> {
        if proptag == PR_PARENT_FOLDER_ID {
            return Ok(Some(PropValue::LongLong(PARENT_FOLDER)));
        }
        Ok(None)
    }

    async fn read_message(
        &self,
        _cpid: u32,
        _message_id: u64,
    ) -> Result<Option<MessageContent>, StoreError> {
        Ok(self.content.lock().unwrap().clone())
    }

    async fn clear_submit(&self, message_id: u64) -> Result<(), StoreError> {
        self.actions
            .lock()
            .unwrap()
            .push(format!("clear_submit {message_id}"));
        Ok(())
    }

    async fn movecopy_message(
        &self,
        _cpid: u32,
        message_id: u64,
        folder_id: u64,
        new_id: u64,
    ) -> Result<(), StoreError> {
        self.actions
            .lock()
            .unwrap()
            .push(format!("movecopy {message_id} -> {folder_id}/{new_id}"));
        Ok(())
    }

    async fn movecopy_to_sent(&self, _cpid: u32, message_id: u64) -> Result<(), StoreError> {
        self.actions
            .lock()
            .unwrap()
            .push(format!("move_to_sent {message_id}"));
        Ok(())
    }

    async fn delete_message(
        &self,
        _cpid: u32,
        parent_id: u64,
        message_id: u64,
    ) -> Result<(), StoreError> {
        self.actions
            .lock()
            .unwrap()
            .push(format!("delete {message_id} from {parent_id}"));
        Ok(())
    }

    fn message_entryid_to_ids(&self, entryid: &[u8]) -> Option<(u64, u64)> {
        if entryid.len() != 16 {
            return None;
        }
        let folder = u64::from_be_bytes(entryid[..8].try_into().unwrap());
        let message = u64::from_be_bytes(entryid[8..].try_into().unwrap());
        Some((folder, message))
    }
}

#[derive(Default)]
struct MockDirectory {
    essdn: HashMap<String, String>,
    entryid: HashMap<Vec<u8>, String>,
}

#[async_trait::async_trait]
impl Directory for MockDirectory {
    async fn essdn_to_username(&self, essdn: &str) -> Option<String> {
        self.essdn.get(essdn).cloned()
    }

    async fn entryid_to_username(&self, entryid: &[u8]) -> Option<String> {
        self.entryid.get(entryid).cloned()
    }

    async fn get_user_lang(&self, _username: &str) -> Option<String> {
        None
    }

    async fn get_timezone(&self, _username: &str) -> Option<String> {
        None
    }

    fn lang_to_charset(&self, _lang: &str) -> Option<String> {
        None
    }

    fn cpid_to_charset(&self, _cpid: u32) -> Option<String> {
        None
    }
}

struct MockExporter;

impl MessageExporter for MockExporter {
    fn export(&self, _content: &MessageContent, _body: BodyFormat) -> Result<Vec<u8>, StoreError> {
        Ok(b"Subject: exported\r\n\r\nbody\r\n".to_vec())
    }
}

/// An always-happy relay recording the commands it saw.
async fn accepting_relay() -> (u16, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);
        let mut seen = Vec::new();
        writer.write_all(b"220 ready\r\n").await.unwrap();
        let mut in_data = false;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let trimmed = line.trim_end().to_owned();
            if in_data {
                if trimmed == "." {
                    in_data = false;
                    writer.write_all(b"250 queued\r\n").await.unwrap();
                }
                continue;
            }
            seen.push(trimmed.clone());
            if trimmed.eq_ignore_ascii_case("quit") {
                break;
            }
            if trimmed.eq_ignore_ascii_case("data") {
                in_data = true;
                writer.write_all(b"354 go\r\n").await.unwrap();
            } else {
                writer.write_all(b"250 Ok\r\n").await.unwrap();
            }
        }
        seen
    });
    (port, handle)
}

fn base_message(extra_props: Vec<(u32, PropValue)>, recipients: Vec<Recipient>) -> MessageContent {
    let mut props = PropList(extra_props);
    props.insert_if_absent(PR_MESSAGE_FLAGS, PropValue::Long(0));
    MessageContent { props, recipients }
}

fn smtp_recipient(address: &str) -> Recipient {
    Recipient(PropList(vec![(
        PR_SMTP_ADDRESS,
        PropValue::Unicode(address.to_owned()),
    )]))
}

fn submitter(store: Arc<MockStore>, directory: MockDirectory, port: u16) -> Submitter {
    Submitter::new(
        store,
        Arc::new(directory),
        Arc::new(MockExporter),
        SmtpClient::new("127.0.0.1".parse().unwrap(), port, "testserver.com".to_owned()),
        16,
        1 << 20,
        1000,
    )
}

fn ctx() -> SubmitContext {
    SubmitContext {
        account: "alice@example.com".to_owned(),
        cpid: 1252,
    }
}

#[test_log::test(tokio::test)]
async fn successful_submission_moves_to_sent() {
    let (port, relay) = accepting_relay().await;
    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![],
        vec![smtp_recipient("bob@example.com")],
    ));

    let submitter = submitter(store.clone(), MockDirectory::default(), port);
    assert!(submitter.send_message(&ctx(), 0x99, true).await);

    let actions = store.actions.lock().unwrap().clone();
    assert_eq!(
        actions,
        vec!["clear_submit 153".to_owned(), "move_to_sent 153".to_owned()]
    );
    let seen = relay.await.unwrap();
    assert!(seen.contains(&"mail from:<alice@example.com>".to_owned()));
    assert!(seen.contains(&"rcpt to:<bob@example.com>".to_owned()));
}

#[test_log::test(tokio::test)]
async fn delete_after_submit_deletes_the_source() {
    let (port, _relay) = accepting_relay().await;
    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![(PR_DELETE_AFTER_SUBMIT, PropValue::Boolean(true))],
        vec![smtp_recipient("bob@example.com")],
    ));

    let submitter = submitter(store.clone(), MockDirectory::default(), port);
    assert!(submitter.send_message(&ctx(), 7, true).await);

    let actions = store.actions.lock().unwrap().clone();
    assert_eq!(actions, vec![format!("delete 7 from {PARENT_FOLDER}")]);
}

#[test_log::test(tokio::test)]
async fn target_entryid_wins_over_delete() {
    let (port, _relay) = accepting_relay().await;
    let mut entryid = 0x22_u64.to_be_bytes().to_vec();
    entryid.extend_from_slice(&0x33_u64.to_be_bytes());

    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![
            (PR_TARGET_ENTRYID, PropValue::Binary(entryid)),
            (PR_DELETE_AFTER_SUBMIT, PropValue::Boolean(true)),
        ],
        vec![smtp_recipient("bob@example.com")],
    ));

    let submitter = submitter(store.clone(), MockDirectory::default(), port);
    assert!(submitter.send_message(&ctx(), 5, true).await);

    let actions = store.actions.lock().unwrap().clone();
    assert_eq!(
        actions,
        vec!["clear_submit 5".to_owned(), "movecopy 5 -> 34/51".to_owned()]
    );
}

#[test_log::test(tokio::test)]
async fn relay_rejection_leaves_the_source_alone() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (_reader, mut writer) = socket.into_split();
        writer.write_all(b"554 go away\r\n").await.unwrap();
    });

    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![],
        vec![smtp_recipient("bob@example.com")],
    ));

    let submitter = submitter(store.clone(), MockDirectory::default(), port);
    assert!(!submitter.send_message(&ctx(), 1, true).await);
    assert!(store.actions.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn resend_includes_only_marked_recipients() {
    let (port, relay) = accepting_relay().await;
    let store = Arc::new(MockStore::default());

    let marked = Recipient(PropList(vec![
        (PR_SMTP_ADDRESS, PropValue::Unicode("keep@example.com".to_owned())),
        (
            PR_RECIPIENT_TYPE,
            PropValue::Long(1 | RECIPIENT_TYPE_NEED_RESEND),
        ),
    ]));
    let unmarked = Recipient(PropList(vec![
        (PR_SMTP_ADDRESS, PropValue::Unicode("skip@example.com".to_owned())),
        (PR_RECIPIENT_TYPE, PropValue::Long(1)),
    ]));
    *store.content.lock().unwrap() = Some(base_message(
        vec![(PR_MESSAGE_FLAGS, PropValue::Long(MSGFLAG_RESEND))],
        vec![marked, unmarked],
    ));

    let submitter = submitter(store.clone(), MockDirectory::default(), port);
    assert!(submitter.send_message(&ctx(), 2, true).await);

    let seen = relay.await.unwrap();
    assert!(seen.contains(&"rcpt to:<keep@example.com>".to_owned()));
    assert!(!seen.iter().any(|l| l.contains("skip@example.com")));
}

#[test_log::test(tokio::test)]
async fn recipient_resolution_order() {
    let (port, relay) = accepting_relay().await;
    let store = Arc::new(MockStore::default());

    let mut directory = MockDirectory::default();
    directory.essdn.insert(
        "/o=org/cn=Recipients/cn=carol".to_owned(),
        "carol@example.com".to_owned(),
    );
    directory
        .entryid
        .insert(vec![1, 2, 3], "dave@example.com".to_owned());

    let by_type_smtp = Recipient(PropList(vec![
        (PR_ADDRTYPE, PropValue::Unicode("SMTP".to_owned())),
        (PR_EMAIL_ADDRESS, PropValue::Unicode("bob@example.com".to_owned())),
    ]));
    let by_essdn = Recipient(PropList(vec![
        (PR_ADDRTYPE, PropValue::Unicode("EX".to_owned())),
        (
            PR_EMAIL_ADDRESS,
            PropValue::Unicode("/o=org/cn=Recipients/cn=carol".to_owned()),
        ),
    ]));
    let by_entryid = Recipient(PropList(vec![(
        PR_ENTRYID,
        PropValue::Binary(vec![1, 2, 3]),
    )]));
    *store.content.lock().unwrap() = Some(base_message(
        vec![],
        vec![by_type_smtp, by_essdn, by_entryid],
    ));

    let submitter = submitter(store.clone(), directory, port);
    assert!(submitter.send_message(&ctx(), 3, true).await);

    let seen = relay.await.unwrap();
    assert!(seen.contains(&"rcpt to:<bob@example.com>".to_owned()));
    assert!(seen.contains(&"rcpt to:<carol@example.com>".to_owned()));
    assert!(seen.contains(&"rcpt to:<dave@example.com>".to_owned()));
}

#[test_log::test(tokio::test)]
async fn session_message_ceiling_is_enforced() {
    let (port, _relay) = accepting_relay().await;
    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![],
        vec![smtp_recipient("bob@example.com")],
    ));

    let submitter = Submitter::new(
        store.clone(),
        Arc::new(MockDirectory::default()),
        Arc::new(MockExporter),
        SmtpClient::new("127.0.0.1".parse().unwrap(), port, "testserver.com".to_owned()),
        16,
        1 << 20,
        1,
    );
    assert!(submitter.send_message(&ctx(), 1, true).await);
    // the ceiling trips before the relay would even be contacted
    assert!(!submitter.send_message(&ctx(), 2, true).await);

    let actions = store.actions.lock().unwrap().clone();
    assert_eq!(
        actions,
        vec!["clear_submit 1".to_owned(), "move_to_sent 1".to_owned()]
    );
}

#[test_log::test(tokio::test)]
async fn unresolvable_recipient_fails_before_any_relay_contact() {
    let store = Arc::new(MockStore::default());
    *store.content.lock().unwrap() = Some(base_message(
        vec![],
        vec![Recipient(PropList(vec![(
            PR_ADDRTYPE,
            PropValue::Unicode("MAPIPDL".to_owned()),
        )]))],
    ));

    // port 9: nothing listens there, and the orchestrator must fail
    // before it would even try
    let submitter = submitter(store.clone(), MockDirectory::default(), 9);
    assert!(!submitter.send_message(&ctx(), 4, true).await);
    assert!(store.actions.lock().unwrap().is_empty());
}
