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

use std::path::Path;

/// Read the peer allow-list: one numeric host address per line, blank
/// lines and `#` comments skipped. A missing file yields the implicit
/// loopback-only list.
///
/// # Errors
///
/// Any I/O error other than the file being absent.
pub fn load_acl(path: &Path) -> std::io::Result<Vec<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no event ACL file, defaulting to implicit access list {{::1}}");
            return Ok(vec!["::1".to_owned()]);
        }
        Err(err) => return Err(err),
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_defaults_to_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let acl = load_acl(&dir.path().join("event_acl.txt")).unwrap();
        assert_eq!(acl, vec!["::1".to_owned()]);
    }

    #[test]
    fn lines_are_trimmed_and_comments_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event_acl.txt");
        std::fs::write(&path, "::1\n# office\n 192.168.1.10 \n\n").unwrap();
        let acl = load_acl(&path).unwrap();
        assert_eq!(acl, vec!["::1".to_owned(), "192.168.1.10".to_owned()]);
    }
}
