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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mailplane_common::StopToken;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{EventService, EventServiceBuilder};

struct Peer {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = socket.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = Vec::new();
        loop {
            let byte = self.reader.read_u8().await.unwrap();
            line.push(byte);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return String::from_utf8(line).unwrap();
            }
        }
    }

    async fn expect(&mut self, want: &str) {
        let got = tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
        assert_eq!(got, want);
    }

    async fn expect_silence(&mut self, window: Duration) {
        let got = tokio::time::timeout(window, self.recv()).await;
        assert!(got.is_err(), "unexpected line {:?}", got.unwrap());
    }
}

async fn start(builder: EventServiceBuilder) -> (Arc<EventService>, SocketAddr, StopToken) {
    let service = builder.acl(vec!["127.0.0.1".to_owned()]).build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = StopToken::new();
    let serve = service.clone();
    let serve_stop = stop.clone();
    tokio::spawn(async move { serve.serve(listener, serve_stop).await });
    (service, addr, stop)
}

#[test_log::test(tokio::test)]
async fn fan_out_reaches_the_interested_subscriber() {
    let (_service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut publisher = Peer::connect(addr).await;
    publisher.expect("OK").await;
    publisher.send("ID pub").await;
    publisher.expect("TRUE").await;

    let mut subscriber = Peer::connect(addr).await;
    subscriber.expect("OK").await;
    subscriber.send("ID sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("LISTEN sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("SELECT alice INBOX").await;
    subscriber.expect("TRUE").await;

    publisher.send("NEW alice INBOX 42").await;
    publisher.expect("TRUE").await;

    subscriber.expect("NEW alice INBOX 42").await;
    subscriber.send("TRUE").await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn publisher_never_hears_its_own_events() {
    let (_service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut conn = Peer::connect(addr).await;
    conn.expect("OK").await;
    conn.send("ID pub").await;
    conn.expect("TRUE").await;
    conn.send("LISTEN pub").await;
    conn.expect("TRUE").await;
    conn.send("SELECT alice INBOX").await;
    conn.expect("TRUE").await;

    conn.send("NEW alice INBOX 7").await;
    conn.expect("TRUE").await;
    conn.expect_silence(Duration::from_millis(300)).await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn unselect_stops_delivery() {
    let (_service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut publisher = Peer::connect(addr).await;
    publisher.expect("OK").await;
    publisher.send("ID pub").await;
    publisher.expect("TRUE").await;

    let mut subscriber = Peer::connect(addr).await;
    subscriber.expect("OK").await;
    subscriber.send("ID sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("LISTEN sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("SELECT bob Sent").await;
    subscriber.expect("TRUE").await;

    publisher.send("MODIFY bob Sent 1").await;
    publisher.expect("TRUE").await;
    subscriber.expect("MODIFY bob Sent 1").await;
    subscriber.send("TRUE").await;

    subscriber.send("UNSELECT bob Sent").await;
    subscriber.expect("TRUE").await;

    publisher.send("MODIFY bob Sent 2").await;
    publisher.expect("TRUE").await;
    subscriber.expect_silence(Duration::from_millis(300)).await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn events_arrive_in_publish_order() {
    let (_service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut publisher = Peer::connect(addr).await;
    publisher.expect("OK").await;
    publisher.send("ID pub").await;
    publisher.expect("TRUE").await;

    let mut subscriber = Peer::connect(addr).await;
    subscriber.expect("OK").await;
    subscriber.send("ID sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("LISTEN sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("SELECT alice INBOX").await;
    subscriber.expect("TRUE").await;

    for n in 0..5 {
        publisher.send(&format!("NEW alice INBOX {n}")).await;
        publisher.expect("TRUE").await;
    }
    for n in 0..5 {
        subscriber.expect(&format!("NEW alice INBOX {n}")).await;
        subscriber.send("TRUE").await;
    }
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn select_needs_an_existing_host() {
    let (_service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut conn = Peer::connect(addr).await;
    conn.expect("OK").await;
    conn.send("ID lonely").await;
    conn.expect("TRUE").await;
    conn.send("SELECT alice INBOX").await;
    conn.expect("FALSE").await;
    conn.send("QUIT").await;
    conn.expect("BYE").await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn unlisted_peer_is_denied() {
    let service = EventServiceBuilder::default()
        .acl(vec!["203.0.113.1".to_owned()])
        .build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = StopToken::new();
    let serve_stop = stop.clone();
    tokio::spawn(async move { service.serve(listener, serve_stop).await });

    let mut conn = Peer::connect(addr).await;
    conn.expect("Access Deny").await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn connection_budget_is_enforced() {
    let (_service, addr, stop) = start(EventServiceBuilder::default().threads_num(1)).await;

    let mut first = Peer::connect(addr).await;
    first.expect("OK").await;

    let mut second = Peer::connect(addr).await;
    second.expect("Maximum Connection Reached!").await;

    first.send("QUIT").await;
    first.expect("BYE").await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn idle_subscriber_is_pinged_and_survives_on_true() {
    let (_service, addr, stop) =
        start(EventServiceBuilder::default().socket_timeout(Duration::from_secs(4))).await;

    let mut publisher = Peer::connect(addr).await;
    publisher.expect("OK").await;
    publisher.send("ID pub").await;
    publisher.expect("TRUE").await;

    let mut subscriber = Peer::connect(addr).await;
    subscriber.expect("OK").await;
    subscriber.send("ID sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("LISTEN sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("SELECT alice INBOX").await;
    subscriber.expect("TRUE").await;

    // socket_timeout 4s puts the keepalive one second out
    subscriber.expect("PING").await;
    subscriber.send("TRUE").await;

    publisher.send("NEW alice INBOX 9").await;
    publisher.expect("TRUE").await;
    subscriber.expect("NEW alice INBOX 9").await;
    subscriber.send("TRUE").await;
    stop.stop();
}

#[test_log::test(tokio::test)]
async fn full_fifo_drops_silently_but_counts() {
    let (service, addr, stop) = start(EventServiceBuilder::default()).await;

    let mut publisher = Peer::connect(addr).await;
    publisher.expect("OK").await;
    publisher.send("ID pub").await;
    publisher.expect("TRUE").await;

    let mut subscriber = Peer::connect(addr).await;
    subscriber.expect("OK").await;
    subscriber.send("ID sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("LISTEN sub").await;
    subscriber.expect("TRUE").await;
    subscriber.send("SELECT alice INBOX").await;
    subscriber.expect("TRUE").await;

    // the subscriber never acknowledges, so at most one event is in
    // flight and the FIFO holds the rest; overflow must still be TRUE
    // for the publisher
    for n in 0..(super::FIFO_AVERAGE_LENGTH + 40) {
        publisher.send(&format!("NEW alice INBOX {n}")).await;
        publisher.expect("TRUE").await;
    }
    assert!(service.dropped_events() > 0);
    stop.stop();
}
