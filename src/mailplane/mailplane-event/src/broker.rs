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

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mailplane_common::StopToken;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::wire::{selection_key, write_line, LineBuffer, ReadOutcome};

/// Per-subscriber FIFO depth.
const FIFO_AVERAGE_LENGTH: usize = 128;

/// One subscriber stream of a host, addressed by its FIFO handle.
#[derive(Debug, Clone)]
struct SubscriberHandle {
    id: u64,
    queue: tokio::sync::mpsc::Sender<String>,
}

/// All state of one resource id.
#[derive(Debug, Default)]
struct HostNode {
    res_id: String,
    last_time: Option<Instant>,
    selections: HashMap<String, Instant>,
    subscribers: VecDeque<SubscriberHandle>,
}

/// Builder for [`EventService`]. The timing knobs exist so tests can
/// shrink the liveness protocol to something observable.
#[derive(Debug, Clone)]
pub struct EventServiceBuilder {
    acl: Vec<String>,
    threads_num: usize,
    socket_timeout: Duration,
    host_interval: Duration,
    select_interval: Duration,
    scan_interval: Duration,
}

impl Default for EventServiceBuilder {
    fn default() -> Self {
        Self {
            acl: vec!["::1".to_owned()],
            threads_num: 50,
            socket_timeout: Duration::from_secs(60),
            host_interval: Duration::from_secs(20 * 60),
            select_interval: Duration::from_secs(24 * 60 * 60),
            scan_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl EventServiceBuilder {
    /// Allow-list of numeric peer addresses.
    #[must_use]
    pub fn acl(mut self, acl: Vec<String>) -> Self {
        self.acl = acl;
        self
    }

    /// Concurrent connection budget.
    #[must_use]
    pub fn threads_num(mut self, threads_num: usize) -> Self {
        self.threads_num = threads_num.clamp(1, 1000);
        self
    }

    /// Read timeout; also drives the PING cadence.
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Idle-host garbage collection horizon.
    #[must_use]
    pub fn host_interval(mut self, interval: Duration) -> Self {
        self.host_interval = interval;
        self
    }

    /// Interest-entry expiry horizon.
    #[must_use]
    pub fn select_interval(mut self, interval: Duration) -> Self {
        self.select_interval = interval;
        self
    }

    /// Cadence of the expiry sweeps.
    #[must_use]
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Finish the builder.
    #[must_use]
    pub fn build(self) -> Arc<EventService> {
        Arc::new(EventService {
            acl: self.acl,
            threads_num: self.threads_num,
            socket_timeout: self.socket_timeout,
            host_interval: self.host_interval,
            select_interval: self.select_interval,
            scan_interval: self.scan_interval,
            hosts: Mutex::new(Vec::new()),
            connection_count: AtomicUsize::new(0),
            next_subscriber: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        })
    }
}

/// The fan-out service.
#[derive(Debug)]
pub struct EventService {
    acl: Vec<String>,
    threads_num: usize,
    socket_timeout: Duration,
    host_interval: Duration,
    select_interval: Duration,
    scan_interval: Duration,
    hosts: Mutex<Vec<HostNode>>,
    connection_count: AtomicUsize,
    next_subscriber: AtomicU64,
    dropped_events: AtomicU64,
}

/// What a connection is currently doing besides answering commands.
struct Subscription {
    listen_res_id: String,
    subscriber_id: u64,
    queue: tokio::sync::mpsc::Receiver<String>,
}

impl EventService {
    /// Events dropped so far because a subscriber FIFO was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Accept loop. Runs until the stop token fires; every connection
    /// gets its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, stop: StopToken) {
        let scanner = self.clone();
        let scan_stop = stop.clone();
        tokio::spawn(async move { scanner.run_scanner(scan_stop).await });

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = stop.wait() => return,
            };
            let Ok((mut socket, peer)) = accepted else {
                continue;
            };
            let peer_ip = peer.ip().to_string();
            if !self.acl.iter().any(|allowed| *allowed == peer_ip) {
                tracing::debug!(%peer_ip, "rejecting peer outside the access list");
                let _ = socket.write_all(b"Access Deny\r\n").await;
                continue;
            }
            if self.connection_count.load(Ordering::SeqCst) >= self.threads_num {
                let _ = socket.write_all(b"Maximum Connection Reached!\r\n").await;
                continue;
            }
            self.connection_count.fetch_add(1, Ordering::SeqCst);
            if socket.write_all(b"OK\r\n").await.is_err() {
                self.connection_count.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let service = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                service.handle_connection(socket, stop).await;
            });
        }
    }

    /// One connection, from banner to teardown.
    ///
    /// Before `LISTEN` the task only answers commands. After `LISTEN`
    /// it keeps answering commands and additionally drains the
    /// subscription FIFO: each delivered line (and each keepalive
    /// `PING`) must be acknowledged by the peer with `TRUE` before
    /// anything else is delivered.
    async fn handle_connection(self: Arc<Self>, socket: TcpStream, stop: StopToken) {
        let (mut reader, mut writer) = socket.into_split();
        let mut buffer = LineBuffer::default();
        let mut res_id = String::new();
        let mut subscription: Option<Subscription> = None;
        let mut last_time = Instant::now();
        let ping_after = self.socket_timeout.saturating_sub(Duration::from_secs(3));

        'conn: while !stop.is_stopped() {
            let line = match &mut subscription {
                None => match buffer.read_mark(&mut reader, self.socket_timeout).await {
                    ReadOutcome::Line(line) => line,
                    ReadOutcome::Timeout | ReadOutcome::Closed => break 'conn,
                },
                Some(sub) => {
                    tokio::select! {
                        outcome = buffer.read_mark(&mut reader, self.socket_timeout) => {
                            match outcome {
                                ReadOutcome::Line(line) => line,
                                ReadOutcome::Timeout | ReadOutcome::Closed => break 'conn,
                            }
                        }
                        event = sub.queue.recv() => {
                            let Some(event) = event else { break 'conn };
                            if write_line(&mut writer, &event).await.is_err()
                                || !self.await_ack(&mut buffer, &mut reader).await
                            {
                                break 'conn;
                            }
                            last_time = Instant::now();
                            self.touch_host(&sub.listen_res_id);
                            continue 'conn;
                        }
                        () = tokio::time::sleep(Duration::from_secs(1)) => {
                            if last_time.elapsed() >= ping_after {
                                if write_line(&mut writer, "PING").await.is_err()
                                    || !self.await_ack(&mut buffer, &mut reader).await
                                {
                                    break 'conn;
                                }
                                last_time = Instant::now();
                                self.touch_host(&sub.listen_res_id);
                            }
                            continue 'conn;
                        }
                    }
                }
            };
            last_time = Instant::now();

            let upper = line.to_ascii_uppercase();
            if upper.starts_with("ID ") {
                res_id = line[3..].trim().to_owned();
                let _ = write_line(&mut writer, "TRUE").await;
            } else if upper.starts_with("LISTEN ") {
                let listen_res_id = line[7..].trim().to_owned();
                if listen_res_id.is_empty() || subscription.is_some() {
                    let _ = write_line(&mut writer, "FALSE").await;
                    continue;
                }
                subscription = Some(self.attach_subscriber(listen_res_id));
                let _ = write_line(&mut writer, "TRUE").await;
            } else if upper.starts_with("SELECT ") {
                let reply = match split_pair(&line[7..]).and_then(|(a, b)| selection_key(a, b)) {
                    Some(key) => {
                        if self.refresh_selection(&res_id, key) {
                            "TRUE"
                        } else {
                            "FALSE"
                        }
                    }
                    None => "FALSE",
                };
                let _ = write_line(&mut writer, reply).await;
            } else if upper.starts_with("UNSELECT ") {
                match split_pair(&line[9..]).and_then(|(a, b)| selection_key(a, b)) {
                    Some(key) => {
                        self.drop_selection(&res_id, &key);
                        let _ = write_line(&mut writer, "TRUE").await;
                    }
                    None => {
                        let _ = write_line(&mut writer, "FALSE").await;
                    }
                }
            } else if upper == "QUIT" {
                let _ = write_line(&mut writer, "BYE").await;
                break;
            } else if upper == "PING" {
                let _ = write_line(&mut writer, "TRUE").await;
            } else {
                let reply = if self.publish(&res_id, &line) {
                    "TRUE"
                } else {
                    "FALSE"
                };
                let _ = write_line(&mut writer, reply).await;
            }
        }

        if let Some(sub) = &mut subscription {
            self.detach_subscriber(&sub.listen_res_id, sub.subscriber_id);
            sub.queue.close();
            while sub.queue.try_recv().is_ok() {}
        }
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// The peer must answer a delivery or keepalive with exactly
    /// `TRUE` on its next line.
    async fn await_ack(
        &self,
        buffer: &mut LineBuffer,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
    ) -> bool {
        match buffer.read_mark(reader, self.socket_timeout).await {
            ReadOutcome::Line(line) => line.eq_ignore_ascii_case("TRUE"),
            ReadOutcome::Timeout | ReadOutcome::Closed => false,
        }
    }

    /// Register a subscriber stream under `res_id`, creating the host
    /// record when this is its first.
    fn attach_subscriber(&self, listen_res_id: String) -> Subscription {
        let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(FIFO_AVERAGE_LENGTH);
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriberHandle {
            id: subscriber_id,
            queue: queue_tx,
        };
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let host = match hosts.iter_mut().position(|h| h.res_id == listen_res_id) {
            Some(i) => &mut hosts[i],
            None => {
                hosts.push(HostNode {
                    res_id: listen_res_id.clone(),
                    ..HostNode::default()
                });
                hosts.last_mut().expect("pushed right before")
            }
        };
        host.last_time = Some(Instant::now());
        host.subscribers.push_back(handle);
        Subscription {
            listen_res_id,
            subscriber_id,
            queue: queue_rx,
        }
    }

    fn detach_subscriber(&self, res_id: &str, subscriber_id: u64) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(host) = hosts.iter_mut().find(|h| h.res_id == res_id) {
            host.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Deliver a published line to every other interested resource,
    /// rotating through each resource's subscriber pool. The publisher
    /// sees `TRUE` regardless of how many FIFOs had room.
    fn publish(&self, sender_res_id: &str, line: &str) -> bool {
        let mut tokens = line.splitn(4, ' ');
        let _verb = tokens.next().unwrap_or_default();
        let (Some(first), Some(second)) = (tokens.next(), tokens.next()) else {
            return false;
        };
        let Some(key) = selection_key(first, second) else {
            return false;
        };
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        for host in hosts.iter_mut() {
            if host.res_id == sender_res_id || !host.selections.contains_key(&key) {
                continue;
            }
            if let Some(subscriber) = host.subscribers.pop_front() {
                if subscriber.queue.try_send(line.to_owned()).is_err() {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
                host.subscribers.push_back(subscriber);
            }
        }
        true
    }

    fn refresh_selection(&self, res_id: &str, key: String) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        match hosts.iter_mut().find(|h| h.res_id == res_id) {
            Some(host) => {
                host.selections.insert(key, Instant::now());
                true
            }
            None => false,
        }
    }

    fn drop_selection(&self, res_id: &str, key: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(host) = hosts.iter_mut().find(|h| h.res_id == res_id) {
            host.selections.remove(key);
        }
    }

    fn touch_host(&self, res_id: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(host) = hosts.iter_mut().find(|h| h.res_id == res_id) {
            host.last_time = Some(Instant::now());
        }
    }

    /// Expiry sweeps: drop hosts that lost every subscriber and stayed
    /// quiet past the host horizon, and selections older than the
    /// selection horizon.
    async fn run_scanner(self: Arc<Self>, stop: StopToken) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.scan_interval) => {}
                () = stop.wait() => return,
            }
            let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            hosts.retain_mut(|host| {
                if host.subscribers.is_empty()
                    && host
                        .last_time
                        .is_some_and(|t| t.elapsed() > self.host_interval)
                {
                    return false;
                }
                host.selections
                    .retain(|_, refreshed| refreshed.elapsed() <= self.select_interval);
                true
            });
        }
    }
}

/// Split `rest` at its single separating space.
fn split_pair(rest: &str) -> Option<(&str, &str)> {
    rest.split_once(' ')
}

#[cfg(test)]
mod tests;
