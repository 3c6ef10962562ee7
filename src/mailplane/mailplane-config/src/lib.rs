//! mailplane configuration
//!
//! The behavior of the daemons is configured through a single TOML file,
//! passed with the `-c, --config` flag of `mailplane`.
//!
//! All parameters are optional and have default values; with no `-c`
//! flag the defaults are used. The file is read and parsed right after
//! start, producing an error on invalid syntax, an unknown field, or a
//! value outside its permitted range.

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

pub mod field;

mod default;
mod ensure;

use anyhow::Context;

pub use field::Config;

impl Config {
    /// Read a [`Config`] from a TOML file.
    ///
    /// # Errors
    ///
    /// * The file could not be opened or read.
    /// * The data is not valid TOML or contains an unknown field.
    /// * A value is outside its permitted range.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration at {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Read a [`Config`] from TOML data.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_toml_file`], minus the I/O.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw).context("the configuration is malformed")?;
        ensure::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests;
