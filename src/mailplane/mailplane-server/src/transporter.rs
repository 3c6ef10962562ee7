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

//! The transporter: workers that drain the dequeue engine and run each
//! message through the installed hook.
//!
//! The core never retries on its own. A transient hook failure is
//! logged and the message released; the writer decides whether to
//! resubmit. A permanent failure additionally produces a non-delivery
//! report back to the envelope sender.

use std::sync::Arc;

use mailplane_common::StopToken;
use mailplane_delivery::{BounceInfo, BounceKind, BounceProducer, SmtpClient, SmtpError};
use mailplane_dequeue::{DequeueEngine, Message};

/// A delivery hook failure.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Retry could help; the core still will not retry by itself.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying the same message is pointless.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// What the transporter does with each admitted message.
#[async_trait::async_trait]
pub trait MessageHook: Send + Sync {
    /// Process one message. The message is released either way.
    async fn deliver(&self, message: &Message) -> Result<(), HookError>;
}

/// The stock hook: relay the message outbound; bounce on permanent
/// refusal.
pub struct OutboundHook {
    smtp: SmtpClient,
    bounce: Arc<BounceProducer>,
    host_id: String,
}

impl OutboundHook {
    /// Wire the hook to its relay and bounce producer.
    #[must_use]
    pub fn new(smtp: SmtpClient, bounce: Arc<BounceProducer>, host_id: String) -> Self {
        Self {
            smtp,
            bounce,
            host_id,
        }
    }
}

#[async_trait::async_trait]
impl MessageHook for OutboundHook {
    async fn deliver(&self, message: &Message) -> Result<(), HookError> {
        match self
            .smtp
            .send_mail(message.mail(), &message.envelope_from, &message.envelope_rcpt)
            .await
        {
            Ok(()) => Ok(()),
            Err(err @ SmtpError::Permanent { .. }) => {
                self.send_bounce(message).await;
                Err(HookError::Permanent(err.to_string()))
            }
            Err(err) => Err(HookError::Transient(err.to_string())),
        }
    }
}

impl OutboundHook {
    /// Tell the sender the relay refused the message for good.
    async fn send_bounce(&self, message: &Message) {
        let info = BounceInfo {
            message_size: message.mail_length() as u32,
            ..BounceInfo::default()
        };
        let Some(mail) = self.bounce.make(
            &message.envelope_from,
            message.envelope_rcpt.first().map_or("", String::as_str),
            &info,
            BounceKind::GenericError,
        ) else {
            tracing::warn!(flush_id = message.flush_id, "no bounce template to render");
            return;
        };
        let postmaster = format!("postmaster@{}", self.host_id);
        let rcpt = vec![message.envelope_from.clone()];
        if let Err(err) = self.smtp.send_mail(&mail, &postmaster, &rcpt).await {
            tracing::warn!(flush_id = message.flush_id, %err, "cannot deliver bounce");
        }
    }
}

/// Spawn `workers` transporter tasks over the engine.
pub(crate) fn spawn_pool(
    engine: Arc<DequeueEngine>,
    hook: Arc<dyn MessageHook>,
    workers: usize,
    stop: StopToken,
) {
    for worker in 0..workers.max(1) {
        let engine = engine.clone();
        let hook = hook.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            run_worker(worker, engine, hook, stop).await;
        });
    }
}

#[tracing::instrument(name = "transporter", skip_all, fields(worker))]
async fn run_worker(
    worker: usize,
    engine: Arc<DequeueEngine>,
    hook: Arc<dyn MessageHook>,
    stop: StopToken,
) {
    while !stop.is_stopped() {
        let Some(message) = engine.get() else {
            engine.wait_for_message().await;
            continue;
        };
        match hook.deliver(&message).await {
            Ok(()) => {
                tracing::debug!(flush_id = message.flush_id, "message processed");
            }
            Err(HookError::Transient(reason)) => {
                tracing::warn!(flush_id = message.flush_id, %reason, "delivery held back");
                engine.save(&message);
            }
            Err(HookError::Permanent(reason)) => {
                tracing::warn!(flush_id = message.flush_id, %reason, "delivery failed for good");
            }
        }
        engine.put(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingHook {
        seen: Mutex<Vec<(u32, String, Vec<String>)>>,
        verdict: fn() -> Result<(), HookError>,
    }

    #[async_trait::async_trait]
    impl MessageHook for RecordingHook {
        async fn deliver(&self, message: &Message) -> Result<(), HookError> {
            self.seen.lock().unwrap().push((
                message.flush_id,
                message.envelope_from.clone(),
                message.envelope_rcpt.clone(),
            ));
            (self.verdict)()
        }
    }

    fn spool(dir: &std::path::Path, id: u32, flush_id: u32) {
        let mut image = Vec::new();
        let body = b"Subject: t\r\n\r\nhello\r\n";
        image.extend_from_slice(&(body.len() as u32).to_le_bytes());
        image.extend_from_slice(body);
        image.extend_from_slice(&flush_id.to_le_bytes());
        image.extend_from_slice(&0_u32.to_le_bytes());
        image.extend_from_slice(&0_u32.to_le_bytes());
        image.extend_from_slice(b"from@a\0to@b\0\0");
        std::fs::write(dir.join("mess").join(id.to_string()), image).unwrap();
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[test_log::test(tokio::test)]
    async fn workers_drain_the_queue_through_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mess")).unwrap();
        std::fs::create_dir(dir.path().join("save")).unwrap();

        let stop = StopToken::new();
        let engine = Arc::new(DequeueEngine::open(dir.path(), 1 << 20).unwrap());
        let loader = engine.clone();
        let loader_stop = stop.clone();
        tokio::spawn(async move { loader.run_loader(loader_stop).await });

        let hook = Arc::new(RecordingHook {
            seen: Mutex::new(Vec::new()),
            verdict: || Ok(()),
        });
        spawn_pool(engine.clone(), hook.clone(), 2, stop.clone());

        for id in [10, 11, 12] {
            spool(dir.path(), id, id + 100);
            engine.sender().send(id).await.unwrap();
        }

        wait_until(|| hook.seen.lock().unwrap().len() == 3).await;
        let mut flush_ids: Vec<u32> = hook.seen.lock().unwrap().iter().map(|s| s.0).collect();
        flush_ids.sort_unstable();
        assert_eq!(flush_ids, vec![110, 111, 112]);
        for (_, from, rcpt) in hook.seen.lock().unwrap().iter() {
            assert_eq!(from, "from@a");
            assert_eq!(rcpt, &vec!["to@b".to_owned()]);
        }

        wait_until(|| !dir.path().join("mess/10").exists()).await;
        stop.stop();
    }

    #[test_log::test(tokio::test)]
    async fn transient_failure_archives_the_spill() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mess")).unwrap();
        std::fs::create_dir(dir.path().join("save")).unwrap();

        let stop = StopToken::new();
        let engine = Arc::new(DequeueEngine::open(dir.path(), 1 << 20).unwrap());
        let loader = engine.clone();
        let loader_stop = stop.clone();
        tokio::spawn(async move { loader.run_loader(loader_stop).await });

        let hook = Arc::new(RecordingHook {
            seen: Mutex::new(Vec::new()),
            verdict: || Err(HookError::Transient("relay busy".to_owned())),
        });
        spawn_pool(engine.clone(), hook.clone(), 1, stop.clone());

        spool(dir.path(), 20, 7);
        engine.sender().send(20).await.unwrap();

        wait_until(|| dir.path().join("save/7").exists()).await;
        stop.stop();
    }
}
