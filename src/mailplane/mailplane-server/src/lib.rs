//! Service glue: wires the configuration to the dequeue engine, the
//! transporter worker pool and the event fan-out listener, and keeps
//! them running until the stop token fires.

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

mod transporter;

pub use transporter::{HookError, MessageHook, OutboundHook};

use std::sync::Arc;

use mailplane_common::StopToken;
use mailplane_config::Config;
use mailplane_delivery::{BounceProducer, SmtpClient};
use mailplane_dequeue::DequeueEngine;
use mailplane_event::{load_acl, EventServiceBuilder};

/// Everything a running daemon owns.
pub struct Server {
    /// The admission engine; front-end writers get its sender handle.
    pub dequeue: Arc<DequeueEngine>,
    /// The event fan-out service.
    pub events: Arc<mailplane_event::EventService>,
}

impl Server {
    /// Bring every service up. Returns once all listeners are bound and
    /// workers spawned; the services run until `stop` fires.
    ///
    /// # Errors
    ///
    /// Any failure to open the queue, read the ACL, or bind the event
    /// listener is startup-fatal.
    pub async fn start(config: &Config, stop: StopToken) -> anyhow::Result<Self> {
        let dequeue = Arc::new(DequeueEngine::open(
            &config.queue.path,
            config.queue.max_memory,
        )?);
        let loader = dequeue.clone();
        let loader_stop = stop.clone();
        tokio::spawn(async move { loader.run_loader(loader_stop).await });

        let smtp = SmtpClient::new(
            config.delivery.smtp_ip,
            config.delivery.smtp_port,
            config.server.host_id.clone(),
        );
        let bounce = Arc::new(BounceProducer::new(
            &config.bounce.separator_for_bounce,
            &config.server.host_id,
        ));
        if let Err(err) = bounce.refresh(&config.bounce.data_path) {
            tracing::warn!(%err, "starting without bounce templates");
        }
        let hook: Arc<dyn MessageHook> = Arc::new(OutboundHook::new(
            smtp,
            bounce,
            config.server.host_id.clone(),
        ));
        transporter::spawn_pool(
            dequeue.clone(),
            hook,
            config.server.transporter_threads,
            stop.clone(),
        );

        let acl = load_acl(&config.event.acl_path)?;
        let events = EventServiceBuilder::default()
            .acl(acl)
            .threads_num(config.event.threads_num)
            .build();
        let listener = tokio::net::TcpListener::bind((
            config.event.listen_ip,
            config.event.listen_port,
        ))
        .await?;
        tracing::info!(
            listen = %format_args!("[{}]:{}", config.event.listen_ip, config.event.listen_port),
            "event service listening"
        );
        let serve = events.clone();
        let serve_stop = stop.clone();
        tokio::spawn(async move { serve.serve(listener, serve_stop).await });

        Ok(Self { dequeue, events })
    }
}
