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

use pretty_assertions::assert_eq;

use crate::Config;

#[test]
fn empty_input_yields_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn partial_file_keeps_other_defaults() {
    let config = Config::from_toml_str(
        r#"
[event]
listen_port = 12345

[delivery]
smtp_ip = "127.0.0.1"
"#,
    )
    .unwrap();
    assert_eq!(config.event.listen_port, 12345);
    assert_eq!(config.event.threads_num, 50);
    assert_eq!(
        config.delivery.smtp_ip,
        "127.0.0.1".parse::<std::net::IpAddr>().unwrap()
    );
    assert_eq!(config.delivery.smtp_port, 25);
}

#[test]
fn unknown_field_is_rejected() {
    assert!(Config::from_toml_str("[event]\nlisten_prot = 1\n").is_err());
}

#[test]
fn out_of_range_thread_count_is_rejected() {
    assert!(Config::from_toml_str("[event]\nthreads_num = 0\n").is_err());
    assert!(Config::from_toml_str("[event]\nthreads_num = 1001\n").is_err());
}

#[test]
fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mailplane.toml");
    std::fs::write(&path, "[queue]\nmax_memory = 1048576\n").unwrap();

    let config = Config::from_toml_file(&path).unwrap();
    assert_eq!(config.queue.max_memory, 1_048_576);
    assert_eq!(config.path.as_deref(), Some(path.as_path()));
}

#[test]
fn too_small_queue_memory_is_rejected() {
    assert!(Config::from_toml_str("[queue]\nmax_memory = 1024\n").is_err());
}
