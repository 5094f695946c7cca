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

//! Per-connection state: the socket, both buffers, the request parser, and
//! the staged response with its file mapping.
//!
//! One request/response turn runs in three phases, each driven by a worker:
//! `read` drains the socket into the read buffer, `process` parses and
//! stages a response (returning whether the connection now wants writable
//! readiness), and `write` gathers the header bytes and the mapped file out
//! with `writev`. The reactor owns registration and closing; it is told the
//! outcome of each phase and never races a worker on this struct.

use std::io::{self, ErrorKind, IoSlice, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::config::Config;
use crate::db::DbPool;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::{Method, Status};

/// Request paths served as `<path>.html` from the resource root.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

/// State for one accepted connection.
#[derive(Debug)]
pub struct HttpConn {
    stream: TcpStream,
    token: Token,
    addr: SocketAddr,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Option<Response>,
    body_written: usize,
    closed: bool,
    user_count: Arc<AtomicUsize>,
}

impl HttpConn {
    /// Wraps an accepted stream, counting it against the user total.
    pub fn new(
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
        user_count: Arc<AtomicUsize>,
    ) -> Self {
        user_count.fetch_add(1, Ordering::Relaxed);
        Self {
            stream,
            token,
            addr,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            request: Request::default(),
            response: None,
            body_written: 0,
            closed: false,
            user_count,
        }
    }

    /// The connection's slab token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The socket, for registry operations on the reactor thread.
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read phase: drains the socket into the read buffer until it would
    /// block. `Ok(0)` means the peer closed. `WouldBlock` with nothing read
    /// is returned unchanged; the caller still runs the process phase, which
    /// simply re-arms readable when no full request is buffered.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut read = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => return Ok(0),
                Ok(n) => read += n,
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        return if read == 0 { Err(e) } else { Ok(read) };
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }
    }

    /// Process phase: advances the parser over whatever is buffered. When a
    /// full request (or a malformed one) is in hand, stages the response and
    /// returns `true` so the reactor arms writable readiness; returns
    /// `false` to stay in the reading state.
    pub fn process(&mut self, db: &DbPool, config: &Config) -> bool {
        let (path, status, keep_alive) = match self.request.parse(&mut self.read_buf) {
            Ok(false) => return false,
            Ok(true) => (self.route(db), Status::Ok, self.request.is_keep_alive()),
            Err(e) => {
                debug!(peer = %self.addr, error = %e, "bad request");
                (self.request.path.clone(), Status::BadRequest, false)
            }
        };
        let mut response = Response::new(
            &config.src_dir,
            &path,
            self.request.version,
            keep_alive,
            status,
        );
        response.build(&mut self.write_buf);
        self.body_written = 0;
        self.response = Some(response);
        true
    }

    /// Maps the request target to a file under the resource root, running
    /// the login/register flow for its POST targets.
    fn route(&self, db: &DbPool) -> String {
        let mut path = self.request.path.clone();
        if path == "/" {
            path = "/index.html".to_string();
        } else if DEFAULT_PAGES.contains(&path.as_str()) {
            path.push_str(".html");
        }

        if self.request.method == Method::Post
            && (path == "/login.html" || path == "/register.html")
        {
            let is_login = path == "/login.html";
            let username = self.request.form_value("username").unwrap_or("");
            let password = self.request.form_value("password").unwrap_or("");
            let verified = !username.is_empty()
                && db.verify(username, password, is_login).unwrap_or_else(|e| {
                    warn!(error = %e, "user verification failed");
                    false
                });
            path = if verified { "/welcome.html" } else { "/error.html" }.to_string();
        }
        path
    }

    /// Write phase: gathers the header bytes and the mapped file with
    /// `writev`, advancing whichever segments were partially sent, until
    /// everything is out or the socket would block (`WouldBlock` is
    /// propagated for the reactor to re-arm writable).
    pub fn write(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while self.to_write_bytes() > 0 {
            let n = {
                let body = self
                    .response
                    .as_ref()
                    .and_then(|r| r.file())
                    .map(|f| &f[self.body_written..])
                    .unwrap_or(&[]);
                let iovs = [self.write_buf.as_io_slice(), IoSlice::new(body)];
                let cnt = if body.is_empty() { 1 } else { 2 };
                match self.stream.write_vectored(&iovs[..cnt]) {
                    Ok(0) => {
                        return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            let header_part = n.min(self.write_buf.readable_bytes());
            self.write_buf.retrieve(header_part);
            self.body_written += n - header_part;
            written += n;
        }
        Ok(written)
    }

    /// Bytes still owed to the peer for the staged response.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes()
            + self
                .response
                .as_ref()
                .and_then(|r| r.file())
                .map_or(0, |f| f.len() - self.body_written)
    }

    /// Whether the finished turn leaves the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.response.as_ref().is_some_and(Response::is_keep_alive)
    }

    /// Resets request, response, and both buffers for the next keep-alive
    /// turn. Any pipelined bytes are dropped.
    pub fn reset_turn(&mut self) {
        self.request.reset();
        self.response = None;
        self.body_written = 0;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
    }

    /// Releases the file mapping and takes the connection out of the user
    /// count. Idempotent; the socket itself closes when the last handle to
    /// this struct drops.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(response) = self.response.as_mut() {
                response.unmap();
            }
            self.user_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::HttpConn;
    use crate::config::Config;
    use crate::db::DbPool;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::Duration;

    use mio::Token;
    use tempfile::TempDir;

    fn fixtures() -> (TempDir, Config, DbPool) {
        let dir = TempDir::new().unwrap();
        let src_dir = dir.path().join("resources");
        std::fs::create_dir(&src_dir).unwrap();
        std::fs::write(src_dir.join("index.html"), "<html>home</html>").unwrap();
        let db = DbPool::new(&dir.path().join("users.db"), 1).unwrap();
        let config = Config {
            src_dir,
            ..Config::default()
        };
        (dir, config, db)
    }

    /// Loopback pair: a mio stream on the server side, std on the client.
    fn pair() -> (HttpConn, std::net::TcpStream, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let conn = HttpConn::new(
            Token(0),
            mio::net::TcpStream::from_std(accepted),
            addr,
            count.clone(),
        );
        (conn, client, count)
    }

    fn read_some(conn: &mut HttpConn) -> usize {
        for _ in 0..50 {
            match conn.read() {
                Ok(n) => return n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => sleep(Duration::from_millis(10)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        panic!("no data arrived");
    }

    #[test]
    fn serves_one_request_end_to_end() {
        let (_dir, config, db) = fixtures();
        let (mut conn, mut client, _count) = pair();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        assert!(read_some(&mut conn) > 0);
        assert!(conn.process(&db, &config));
        assert!(conn.to_write_bytes() > 0);

        loop {
            match conn.write() {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => panic!("write failed: {e}"),
            }
        }
        assert_eq!(0, conn.to_write_bytes());
        assert!(!conn.is_keep_alive());
        drop(conn);

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("<html>home</html>"));
    }

    #[test]
    fn incomplete_request_stays_in_reading_state() {
        let (_dir, config, db) = fixtures();
        let (mut conn, mut client, _count) = pair();

        client.write_all(b"GET / HT").unwrap();
        read_some(&mut conn);
        assert!(!conn.process(&db, &config));
        assert_eq!(0, conn.to_write_bytes());

        client.write_all(b"TP/1.1\r\n\r\n").unwrap();
        read_some(&mut conn);
        assert!(conn.process(&db, &config));
        assert!(conn.is_keep_alive());
    }

    #[test]
    fn peer_close_reads_as_zero() {
        let (_dir, _config, _db) = fixtures();
        let (mut conn, client, _count) = pair();
        drop(client);
        for _ in 0..50 {
            match conn.read() {
                Ok(0) => return,
                Ok(_) => panic!("unexpected data"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => sleep(Duration::from_millis(10)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        panic!("never observed end of stream");
    }

    #[test]
    fn user_count_drops_exactly_once() {
        let (_dir, _config, _db) = fixtures();
        let (mut conn, _client, count) = pair();
        assert_eq!(1, count.load(Ordering::Relaxed));
        conn.close();
        conn.close();
        assert_eq!(0, count.load(Ordering::Relaxed));
        drop(conn);
        assert_eq!(0, count.load(Ordering::Relaxed));
    }
}
