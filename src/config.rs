// Copyright 2024 The vev developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Configuration for the server. The defaults match a local deployment:
/// port 1316, 60 second idle timeout, six workers, twelve database
/// sessions, resources served from `./resources`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port; must lie in 1024..=65535.
    pub port: u16,
    /// Idle connections are closed after this long without readiness.
    pub idle_timeout: Duration,
    /// Optional `SO_LINGER` for the listening socket.
    pub linger: Option<Duration>,
    /// Worker thread count.
    pub workers: usize,
    /// SQLite database file for the user table.
    pub db_path: PathBuf,
    /// Database sessions opened up front.
    pub db_conns: usize,
    /// Root directory of the static resource tree.
    pub src_dir: PathBuf,
    /// New connections beyond this are turned away with `Server busy!`.
    pub max_connections: usize,
    /// Readiness events accepted per multiplexer wait.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            idle_timeout: Duration::from_secs(60),
            linger: None,
            workers: 6,
            db_conns: 12,
            db_path: PathBuf::from("vev.db"),
            src_dir: PathBuf::from("resources"),
            max_connections: 65_536,
            event_capacity: 1024,
        }
    }
}

impl Config {
    /// Rejects configurations the listener cannot honor.
    pub fn validate(&self) -> Result<(), Error> {
        if self.port < 1024 {
            return Err(Error::Config(format!("port {} outside 1024..=65535", self.port)));
        }
        if self.workers == 0 {
            return Err(Error::Config("worker count must be positive".into()));
        }
        if self.db_conns == 0 {
            return Err(Error::Config("database pool must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn privileged_ports_are_rejected() {
        let config = Config {
            port: 80,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
