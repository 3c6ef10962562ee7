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

use crate::TimeZone;

/// A minimal TZif version 1 image: two types (EST/EDT) and a single
/// recorded transition into daylight time at t = 1000.
fn tiny_v1_image() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TZif");
    out.push(0);
    out.extend_from_slice(&[0_u8; 15]);
    for count in [0_u32, 0, 0, 1, 2, 8] {
        out.extend_from_slice(&count.to_be_bytes());
    }
    out.extend_from_slice(&1000_i32.to_be_bytes()); // transition time
    out.push(1); // into type 1 (EDT)
    out.extend_from_slice(&(-5 * 3600_i32).to_be_bytes());
    out.push(0);
    out.push(0);
    out.extend_from_slice(&(-4 * 3600_i32).to_be_bytes());
    out.push(1);
    out.push(4);
    out.extend_from_slice(b"EST\0EDT\0");
    out
}

#[test]
fn v1_image_parses_and_switches_at_transition() {
    let tz = TimeZone::from_tzif(&tiny_v1_image()).unwrap();
    assert_eq!(tz.offset_at(999), -5 * 3600);
    assert_eq!(tz.offset_at(1000), -4 * 3600);
    assert_eq!(tz.offset_at(0), -5 * 3600);
    assert_eq!(tz.offset_at(-1_000_000), -5 * 3600);
}

#[test]
fn truncated_image_is_rejected() {
    let image = tiny_v1_image();
    assert!(TimeZone::from_tzif(&image[..image.len() - 3]).is_err());
    assert!(TimeZone::from_tzif(b"TZif").is_err());
    assert!(TimeZone::from_tzif(b"GZif\0").is_err());
}

#[test]
fn utc_local_round_trip_is_identity_off_the_edges() {
    let tz = TimeZone::from_posix("CET-1CEST,M3.5.0,M10.5.0/3").unwrap();
    // sweep one instant per week across 2024; every local clock away
    // from the two switch hours must round-trip exactly
    for week in 0..52_i64 {
        let utc = 1_704_067_200 + week * 7 * 86_400; // from 2024-01-01
        let local = tz.utc_to_local(utc);
        assert_eq!(tz.local_to_utc(local), utc, "week {week}");
    }
}

#[test]
fn ambiguous_hour_resolves_to_the_earlier_instant() {
    let tz = TimeZone::from_posix("CET-1CEST,M3.5.0,M10.5.0/3").unwrap();
    // 2024-10-27 02:30 local happens twice; the DST reading comes first
    let twice = 1_729_989_000 + 7200; // 02:30 wall clock, as local seconds
    let resolved = tz.local_to_utc(twice);
    assert_eq!(tz.utc_to_local(resolved), twice);
    assert_eq!(tz.offset_at(resolved), 7200, "earlier (DST) instant wins");
}

#[test]
fn load_rejects_escaping_names() {
    assert!(TimeZone::load("../etc/passwd").is_err());
    assert!(TimeZone::load("/etc/localtime").is_err());
    assert!(TimeZone::load("").is_err());
}

#[test]
fn load_from_reads_a_database_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("Test")).unwrap();
    std::fs::write(dir.path().join("Test/Zone"), tiny_v1_image()).unwrap();

    let tz = TimeZone::load_from(dir.path(), "Test/Zone").unwrap();
    assert_eq!(tz.offset_at(2000), -4 * 3600);
    assert!(TimeZone::load_from(dir.path(), "Test/Missing").is_err());
}
