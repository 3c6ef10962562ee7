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

use anyhow::Context as _;
use clap::Parser;
use mailplane_common::StopToken;
use mailplane_config::Config;
use mailplane_server::Server;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path of the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Dump the effective configuration and exit.
    #[arg(long)]
    check_config: bool,
}

fn init_logs() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logs();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };
    if args.check_config {
        println!("{config:#?}");
        return Ok(());
    }

    let stop = StopToken::new();
    let _server = Server::start(&config, stop.clone())
        .await
        .context("starting services")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mailplane is now running");

    let shutdown = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.stop();
        }
    });

    stop.wait().await;
    // give every loop its one-second poll to wind down
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    Ok(())
}
