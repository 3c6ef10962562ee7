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

use crate::field::Config;

const BLOCK_SIZE: usize = 128 * 1024;

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.queue.max_memory >= BLOCK_SIZE,
        "queue.max_memory must hold at least one {BLOCK_SIZE}-byte block"
    );
    anyhow::ensure!(
        config.server.transporter_threads >= 1,
        "server.transporter_threads must be at least 1"
    );
    anyhow::ensure!(
        (1..=1000).contains(&config.event.threads_num),
        "event.threads_num must be within 1..=1000"
    );
    anyhow::ensure!(
        config.delivery.max_rcpt_num >= 1,
        "delivery.max_rcpt_num must be at least 1"
    );
    anyhow::ensure!(
        !config.bounce.separator_for_bounce.is_empty(),
        "bounce.separator_for_bounce must not be empty"
    );
    Ok(())
}
