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

//! Fixed-size pool of SQLite sessions and the login/register queries.
//!
//! Sessions are opened up front and handed out through a scoped leaser that
//! returns them on every exit path. `acquire` blocks without timeout when
//! the pool is empty; workers are the only callers, so the reactor thread
//! never waits here.

use std::ops::Deref;
use std::path::Path;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS user (
    username TEXT PRIMARY KEY,
    password TEXT NOT NULL
)";

/// Pool of pre-opened SQLite sessions gated by a condition variable.
#[derive(Debug)]
pub struct DbPool {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
}

impl DbPool {
    /// Opens `size` sessions against the database at `path`, creating the
    /// `user` table when absent. WAL mode lets the sessions read
    /// concurrently.
    pub fn new(path: &Path, size: usize) -> Result<Self, rusqlite::Error> {
        assert!(size > 0);
        let mut idle = Vec::with_capacity(size);
        for i in 0..size {
            let conn = Connection::open(path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            if i == 0 {
                conn.execute_batch(SCHEMA)?;
            }
            idle.push(conn);
        }
        Ok(Self {
            idle: Mutex::new(idle),
            available: Condvar::new(),
        })
    }

    /// Leases a session, blocking until one is idle.
    pub fn acquire(&self) -> PooledConn<'_> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = loop {
            match idle.pop() {
                Some(conn) => break conn,
                None => {
                    idle = self
                        .available
                        .wait(idle)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        };
        PooledConn {
            pool: self,
            conn: Some(conn),
        }
    }

    /// Idle session count.
    pub fn available(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every idle session. Leased sessions close when their leaser
    /// returns them to a pool that is simply never drained again.
    pub fn close(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn release(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
        self.available.notify_one();
    }

    /// Checks credentials for login, or claims them for registration.
    ///
    /// Login succeeds when the stored password matches; registration
    /// succeeds when the username is unclaimed, inserting the new row.
    /// Statements are parameterized; inputs are never spliced into SQL.
    pub fn verify(
        &self,
        username: &str,
        password: &str,
        is_login: bool,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.acquire();
        let stored: Option<String> = conn
            .query_row(
                "SELECT password FROM user WHERE username = ?1 LIMIT 1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        let ok = match (is_login, stored) {
            (true, Some(stored)) => stored == password,
            (true, None) => false,
            (false, Some(_)) => {
                warn!(username, "registration rejected: username taken");
                false
            }
            (false, None) => {
                conn.execute(
                    "INSERT INTO user (username, password) VALUES (?1, ?2)",
                    params![username, password],
                )?;
                true
            }
        };
        Ok(ok)
    }
}

/// Scoped session lease; the session goes back to the pool on drop.
#[derive(Debug)]
pub struct PooledConn<'a> {
    pool: &'a DbPool,
    conn: Option<Connection>,
}

impl Deref for PooledConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod test {
    use super::DbPool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    fn pool(size: usize) -> (TempDir, DbPool) {
        let dir = TempDir::new().unwrap();
        let pool = DbPool::new(&dir.path().join("users.db"), size).unwrap();
        (dir, pool)
    }

    #[test]
    fn register_then_login() {
        let (_dir, pool) = pool(2);
        assert!(pool.verify("alice", "secret", false).unwrap());
        assert!(pool.verify("alice", "secret", true).unwrap());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (_dir, pool) = pool(2);
        assert!(pool.verify("bob", "right", false).unwrap());
        assert!(!pool.verify("bob", "wrong", true).unwrap());
    }

    #[test]
    fn login_for_unknown_user_fails() {
        let (_dir, pool) = pool(1);
        assert!(!pool.verify("nobody", "pw", true).unwrap());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (_dir, pool) = pool(2);
        assert!(pool.verify("carol", "one", false).unwrap());
        assert!(!pool.verify("carol", "two", false).unwrap());
        // The original password still wins.
        assert!(pool.verify("carol", "one", true).unwrap());
    }

    #[test]
    fn lease_returns_on_drop() {
        let (_dir, pool) = pool(2);
        assert_eq!(2, pool.available());
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(0, pool.available());
        }
        assert_eq!(2, pool.available());
    }

    #[test]
    fn acquire_blocks_until_a_session_returns() {
        let (_dir, pool) = pool(1);
        let pool = Arc::new(pool);
        let lease = pool.acquire();
        let contender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _lease = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());
        drop(lease);
        contender.join().unwrap();
    }
}
