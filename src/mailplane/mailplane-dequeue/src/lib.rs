//! The message-dequeue engine.
//!
//! The mail queue has two parts: the spill directory and the
//! notification channel. When a front-end finishes spooling a message it
//! writes a spill file under `mess/` and pushes the file id into the
//! channel; the loader here admits the file into a bounded in-memory
//! working set and hands it to the transporter workers.
//!
//! Admission is memory-bounded twice over: a fixed arena of message
//! nodes (one per 128 KiB of the configured budget) and a byte counter
//! of the loaded spill data. A node is always in exactly one of three
//! places: the free list, the used list, or checked out to a worker.

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

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use mailplane_common::StopToken;

/// Arena granularity: one node per this many budget bytes.
const BLOCK_SIZE: usize = 128 * 1024;
/// Spill charges are rounded up to this multiple.
const ALLOC_UNIT: usize = 64 * 1024;
/// Poll cadence of the loader when the channel is empty.
const SLEEP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);
/// Depth of the producer→consumer notification channel.
const CHANNEL_DEPTH: usize = 4096;

/// Errors raised while opening the queue.
#[derive(Debug, thiserror::Error)]
pub enum DequeueError {
    /// A required queue directory is missing.
    #[error("cannot find directory {0}")]
    MissingDirectory(PathBuf),
    /// A queue path exists but is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    /// Creating the IPC token file failed.
    #[error("cannot create token file {path}: {source}")]
    Token {
        /// Token path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// A message checked out of the queue.
///
/// Holds the raw spill bytes plus the parsed envelope view. Give it
/// back with [`DequeueEngine::put`] once processed.
#[derive(Debug)]
pub struct Message {
    /// Spill file id under `mess/`.
    pub mess_id: u32,
    /// Monotonic id the writer assigned at flush time.
    pub flush_id: u32,
    /// Bound-type tag of the writer.
    pub bound_type: u32,
    /// Spam verdict of the inbound filter chain.
    pub is_spam: bool,
    /// Envelope sender.
    pub envelope_from: String,
    /// Envelope recipients.
    pub envelope_rcpt: Vec<String>,
    buffer: Vec<u8>,
    mail_length: usize,
    charged: usize,
    node: usize,
}

impl Message {
    /// The raw RFC 5322 bytes.
    #[must_use]
    pub fn mail(&self) -> &[u8] {
        &self.buffer[4..4 + self.mail_length]
    }

    /// Length of the raw message.
    #[must_use]
    pub fn mail_length(&self) -> usize {
        self.mail_length
    }
}

/// Counters exposed to the console and metrics plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Messages loaded and awaiting a worker.
    pub holding: usize,
    /// Messages currently checked out to workers.
    pub processing: usize,
    /// Messages released since the last metrics read.
    pub dequeued: u32,
    /// 64 KiB blocks currently charged against the memory budget.
    pub allocated_blocks: usize,
}

/// The engine. Clone-free; share it behind an [`std::sync::Arc`].
#[derive(Debug)]
pub struct DequeueEngine {
    path_mess: PathBuf,
    path_save: PathBuf,
    max_memory: usize,
    units: usize,

    free: Mutex<Vec<usize>>,
    used: Mutex<VecDeque<Message>>,
    mem: Mutex<usize>,
    loaded: Mutex<HashSet<u32>>,
    dequeued: AtomicU32,

    wakeup: tokio::sync::Notify,
    tx: tokio::sync::mpsc::Sender<u32>,
    rx: Mutex<Option<tokio::sync::mpsc::Receiver<u32>>>,
}

impl DequeueEngine {
    /// Open the queue at `path`.
    ///
    /// Validates `mess/` and `save/`, creates the zero-length
    /// `token.ipc` marker, and sizes the node arena as
    /// `max_memory / 128 KiB`.
    ///
    /// # Errors
    ///
    /// [`DequeueError`] when the directory layout is not usable.
    pub fn open(path: &Path, max_memory: usize) -> Result<Self, DequeueError> {
        let path_mess = path.join("mess");
        let path_save = path.join("save");
        for dir in [path, path_mess.as_path(), path_save.as_path()] {
            match std::fs::metadata(dir) {
                Err(_) => return Err(DequeueError::MissingDirectory(dir.to_path_buf())),
                Ok(meta) if !meta.is_dir() => {
                    return Err(DequeueError::NotADirectory(dir.to_path_buf()))
                }
                Ok(_) => {}
            }
        }
        let token = path.join("token.ipc");
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&token)
            .map_err(|source| DequeueError::Token {
                path: token.clone(),
                source,
            })?;

        let max_memory = max_memory.max(BLOCK_SIZE);
        let units = max_memory / BLOCK_SIZE;
        let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_DEPTH);
        Ok(Self {
            path_mess,
            path_save,
            max_memory,
            units,
            free: Mutex::new((0..units).collect()),
            used: Mutex::new(VecDeque::new()),
            mem: Mutex::new(0),
            loaded: Mutex::new(HashSet::new()),
            dequeued: AtomicU32::new(0),
            wakeup: tokio::sync::Notify::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Handle the writers push spill ids into.
    #[must_use]
    pub fn sender(&self) -> tokio::sync::mpsc::Sender<u32> {
        self.tx.clone()
    }

    /// Check one message out of the used list; `None` when it is empty.
    #[must_use]
    pub fn get(&self) -> Option<Message> {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Release a processed message: the spill file is removed, the
    /// memory charge dropped, and the node returned to the free list.
    pub fn put(&self, message: Message) {
        let name = self.path_mess.join(message.mess_id.to_string());
        if let Err(err) = std::fs::remove_file(&name) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %name.display(), %err, "cannot remove spill file");
            }
        }
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message.mess_id);
        self.release_node(message.node, message.charged);
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Archive the spill file of a message the consumer failed to
    /// retrieve, for post-mortem inspection.
    pub fn save(&self, message: &Message) {
        let old = self.path_mess.join(message.mess_id.to_string());
        let new = self.path_save.join(message.flush_id.to_string());
        if std::fs::hard_link(&old, &new).is_err() {
            if let Err(err) = std::fs::copy(&old, &new) {
                tracing::warn!(file = %new.display(), %err, "cannot archive spill file");
            }
        }
    }

    /// Wait until the loader signals a newly used message, bounded to
    /// one second so shutdown polls stay live.
    pub async fn wait_for_message(&self) {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.wakeup.notified())
            .await;
    }

    /// Counter snapshot. Reading resets the dequeued counter.
    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        let holding = self.used.lock().unwrap_or_else(|e| e.into_inner()).len();
        let free = self.free.lock().unwrap_or_else(|e| e.into_inner()).len();
        let mem = *self.mem.lock().unwrap_or_else(|e| e.into_inner());
        QueueMetrics {
            holding,
            // the two list snapshots are taken one after the other, so
            // clamp instead of trusting their sum
            processing: self.units.saturating_sub(free + holding),
            dequeued: self.dequeued.swap(0, Ordering::Relaxed),
            allocated_blocks: mem / ALLOC_UNIT,
        }
    }

    /// Loader loop: drain the notification channel, and whenever it
    /// idles with the arena fully free, rescan `mess/` for files whose
    /// notification was lost. Loss of the channel is fatal.
    pub async fn run_loader(&self, stop: StopToken) {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::error!("loader started twice");
            return;
        };
        while !stop.is_stopped() {
            match tokio::time::timeout(SLEEP_INTERVAL, rx.recv()).await {
                Ok(Some(mess_id)) => self.load_from_mess(mess_id),
                Ok(None) => {
                    tracing::error!("notification channel lost, loader exits");
                    return;
                }
                Err(_elapsed) => {
                    let free = self.free.lock().unwrap_or_else(|e| e.into_inner()).len();
                    if free == self.units {
                        self.reclaim();
                    }
                }
            }
        }
    }

    /// Admit one spill file into the used list.
    fn load_from_mess(&self, mess_id: u32) {
        if self
            .loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&mess_id)
        {
            return;
        }
        let name = self.path_mess.join(mess_id.to_string());
        let Ok(meta) = std::fs::metadata(&name) else {
            return;
        };
        if !meta.is_file() || meta.len() < 4 {
            return;
        }
        let size = meta.len() as usize;
        let charged = (size.max(1) - 1) / ALLOC_UNIT * ALLOC_UNIT + ALLOC_UNIT;

        {
            let mut mem = self.mem.lock().unwrap_or_else(|e| e.into_inner());
            if *mem + charged > self.max_memory {
                return;
            }
            *mem += charged;
        }
        let node = match self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
        {
            Some(node) => node,
            None => {
                tracing::error!("free list exhausted while memory budget holds");
                *self.mem.lock().unwrap_or_else(|e| e.into_inner()) -= charged;
                return;
            }
        };

        let buffer = match std::fs::read(&name) {
            Ok(buffer) if buffer.len() == size => buffer,
            _ => {
                tracing::warn!(file = %name.display(), "cannot read spill file");
                self.release_node(node, charged);
                return;
            }
        };
        // a zero length prefix marks a writer that has not finished
        if buffer[..4] == [0, 0, 0, 0] {
            self.release_node(node, charged);
            return;
        }
        let message = match parse_spill(mess_id, buffer, charged, node) {
            Some(message) => message,
            None => {
                tracing::warn!(file = %name.display(), "malformed spill file");
                self.release_node(node, charged);
                return;
            }
        };
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mess_id);
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message);
        self.wakeup.notify_one();
    }

    /// Pick up spill files whose notification never arrived. Dirent
    /// order, no sorting.
    fn reclaim(&self) {
        let Ok(entries) = std::fs::read_dir(&self.path_mess) else {
            tracing::warn!(dir = %self.path_mess.display(), "cannot scan spill directory");
            return;
        };
        for entry in entries.flatten() {
            if *self.mem.lock().unwrap_or_else(|e| e.into_inner()) == self.max_memory {
                break;
            }
            let Some(mess_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let mut prefix = [0_u8; 4];
            let Ok(()) = std::fs::File::open(entry.path()).and_then(|mut f| {
                std::io::Read::read_exact(&mut f, &mut prefix)
            }) else {
                continue;
            };
            if prefix == [0, 0, 0, 0] {
                continue;
            }
            self.load_from_mess(mess_id);
        }
    }

    fn release_node(&self, node: usize, charged: usize) {
        *self.mem.lock().unwrap_or_else(|e| e.into_inner()) -= charged;
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node);
    }
}

/// Decode a spill image: u32 length, body, u32 flush id, u32 bound
/// type, u32 spam flag, NUL-terminated sender, double-NUL recipients.
fn parse_spill(mess_id: u32, buffer: Vec<u8>, charged: usize, node: usize) -> Option<Message> {
    let mail_length = u32::from_le_bytes(buffer.get(..4)?.try_into().ok()?) as usize;
    let tail = buffer.get(4 + mail_length..)?;
    let flush_id = u32::from_le_bytes(tail.get(..4)?.try_into().ok()?);
    let bound_type = u32::from_le_bytes(tail.get(4..8)?.try_into().ok()?);
    let is_spam = u32::from_le_bytes(tail.get(8..12)?.try_into().ok()?) != 0;
    let env = tail.get(12..)?;

    // an empty sender is the null reverse-path of a bounce, not a
    // malformed file
    let from_end = env.iter().position(|&b| b == 0)?;
    let envelope_from = String::from_utf8(env[..from_end].to_vec()).ok()?;
    let mut envelope_rcpt = Vec::new();
    let mut rest = &env[from_end + 1..];
    loop {
        let end = rest.iter().position(|&b| b == 0)?;
        if end == 0 {
            break;
        }
        envelope_rcpt.push(String::from_utf8(rest[..end].to_vec()).ok()?);
        rest = &rest[end + 1..];
    }
    if mail_length == 0 {
        return None;
    }
    Some(Message {
        mess_id,
        flush_id,
        bound_type,
        is_spam,
        envelope_from,
        envelope_rcpt,
        buffer,
        mail_length,
        charged,
        node,
    })
}
