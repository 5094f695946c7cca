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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! vev is a single-process, event-driven HTTP/1.1 server for
//! high-concurrency short-lived connections.
//!
//! One reactor thread waits on a mio poll and owns the listener, the
//! connection table, and an indexed min-heap of idle timers. A fixed pool
//! of workers drives each connection's read/process/write turn; static
//! files go out through `writev` from a read-only memory mapping, and the
//! login/register form flow runs against a pool of SQLite sessions.
//!
//! ```no_run
//! use vev::{Config, Server};
//!
//! let mut server = Server::new(Config::default()).expect("server init");
//! server.run().expect("server run");
//! ```

pub mod buffer;
pub mod config;
pub mod db;
pub mod http;
pub mod server;
pub mod timer;
pub mod worker;

pub use config::Config;
pub use server::Server;

/// Failures that keep the server from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration cannot be honored.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Socket or poll failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Database pool failure.
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}
