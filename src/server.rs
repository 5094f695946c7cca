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

//! The reactor: one thread owning the poll, the listener, the connection
//! table, and the timer heap, with phase work handed to the worker pool.
//!
//! Interest is one-shot by construction: dispatching a job deregisters the
//! connection's stream, and only the job's completion (reported over a
//! channel and a waker) registers it again with whatever readiness the
//! state machine wants next. At most one job per connection is therefore
//! ever in flight, and a connection's buffers and parser are touched by one
//! thread at a time. Timers are adjusted and fired on the reactor thread
//! only; an expiry that lands while a job is out marks the table entry
//! doomed and the completion path closes it.

use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::DbPool;
use crate::http::conn::HttpConn;
use crate::timer::TimerHeap;
use crate::worker::WorkerPool;
use crate::Error;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const BUSY_REPLY: &[u8] = b"Server busy!";

/// Readiness a finished job asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Read,
    Write,
    Close,
}

/// Outcome of one worker job, reported back to the reactor.
#[derive(Debug)]
struct Completion {
    token: Token,
    next: Next,
}

/// Connection table entry. `in_flight` pins the connection while a job is
/// out; `doomed` defers a timer close until the job completes.
#[derive(Debug)]
struct Entry {
    conn: Arc<Mutex<HttpConn>>,
    in_flight: bool,
    doomed: bool,
}

/// Everything a job needs besides the connection itself.
struct JobCtx {
    db: Arc<DbPool>,
    config: Arc<Config>,
    done: Sender<Completion>,
    waker: Arc<Waker>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Read,
    Write,
}

/// The server: reactor state plus the pools it drives.
#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    connections: Slab<Entry>,
    timers: TimerHeap,
    pool: WorkerPool,
    db: Arc<DbPool>,
    user_count: Arc<AtomicUsize>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    expired_tx: Sender<Token>,
    expired_rx: Receiver<Token>,
}

impl Server {
    /// Binds the listener, opens the database pool, and spawns the workers.
    /// Fails instead of entering the main loop when any of that cannot be
    /// had.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if let Some(linger) = config.linger {
            socket.set_linger(Some(linger))?;
        }
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let db = Arc::new(DbPool::new(&config.db_path, config.db_conns)?);
        let pool = WorkerPool::new(config.workers);
        let (done_tx, done_rx) = unbounded();
        let (expired_tx, expired_rx) = unbounded();

        info!(
            port = config.port,
            workers = config.workers,
            db_conns = config.db_conns,
            src_dir = %config.src_dir.display(),
            "server listening"
        );

        Ok(Self {
            config: Arc::new(config),
            poll,
            listener,
            waker,
            connections: Slab::default(),
            timers: TimerHeap::new(),
            pool,
            db,
            user_count: Arc::new(AtomicUsize::new(0)),
            done_tx,
            done_rx,
            expired_tx,
            expired_rx,
        })
    }

    /// Address the listener actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept/dispatch loop. Only a poll failure returns.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(self.config.event_capacity);
        loop {
            let timeout = self.timers.next_tick();
            let expired: Vec<Token> = self.expired_rx.try_iter().collect();
            for token in expired {
                self.expire_conn(token);
            }

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    WAKE_TOKEN => self.drain_completions(),
                    token => self.conn_event(token, event),
                }
            }
        }
    }

    /// Accepts until the listener would block. `WouldBlock` ends the batch;
    /// any other errno is a real error and is logged.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.user_count.load(Ordering::Relaxed) >= self.config.max_connections {
                        self.refuse(stream, addr);
                        continue;
                    }
                    if let Err(e) = self.add_client(stream, addr) {
                        error!(error = %e, "failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn refuse(&self, mut stream: TcpStream, addr: SocketAddr) {
        warn!(peer = %addr, "connection table full, turning client away");
        let _ = stream.write(BUSY_REPLY);
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let conn = Arc::new(Mutex::new(HttpConn::new(
            token,
            stream,
            addr,
            self.user_count.clone(),
        )));
        {
            let mut locked = conn.lock().unwrap_or_else(PoisonError::into_inner);
            self.poll
                .registry()
                .register(locked.stream_mut(), token, Interest::READABLE)?;
        }
        entry.insert(Entry {
            conn,
            in_flight: false,
            doomed: false,
        });

        let tx = self.expired_tx.clone();
        self.timers.add(
            token,
            self.config.idle_timeout,
            Box::new(move || {
                let _ = tx.send(token);
            }),
        );
        info!(peer = %addr, ?token, "client in");
        Ok(())
    }

    fn conn_event(&mut self, token: Token, event: &Event) {
        if !self.connections.contains(token.0) {
            return;
        }
        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            debug!(?token, "peer hung up");
            self.close_conn(token);
        } else if event.is_readable() {
            self.dispatch(token, Phase::Read);
        } else if event.is_writable() {
            self.dispatch(token, Phase::Write);
        }
    }

    /// Hands one phase of a connection's turn to the pool: extends its idle
    /// timer, disarms its interest (the one-shot contract), and queues the
    /// job.
    fn dispatch(&mut self, token: Token, phase: Phase) {
        self.timers.adjust(token, self.config.idle_timeout);
        let Some(entry) = self.connections.get_mut(token.0) else {
            return;
        };
        entry.in_flight = true;
        let conn = entry.conn.clone();
        {
            let mut locked = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.poll.registry().deregister(locked.stream_mut()) {
                error!(?token, error = %e, "failed to disarm connection");
            }
        }
        let ctx = JobCtx {
            db: self.db.clone(),
            config: self.config.clone(),
            done: self.done_tx.clone(),
            waker: self.waker.clone(),
        };
        match phase {
            Phase::Read => self.pool.submit(move || on_read(&conn, token, &ctx)),
            Phase::Write => self.pool.submit(move || on_write(&conn, token, &ctx)),
        }
    }

    /// Applies job outcomes: closes, or re-arms the asked-for readiness.
    fn drain_completions(&mut self) {
        let completions: Vec<Completion> = self.done_rx.try_iter().collect();
        for Completion { token, next } in completions {
            let Some(entry) = self.connections.get_mut(token.0) else {
                continue;
            };
            entry.in_flight = false;
            if entry.doomed || next == Next::Close {
                self.close_conn(token);
                continue;
            }
            let interest = match next {
                Next::Read => Interest::READABLE,
                Next::Write => Interest::WRITABLE,
                Next::Close => unreachable!(),
            };
            let conn = entry.conn.clone();
            let rearm = {
                let mut locked = conn.lock().unwrap_or_else(PoisonError::into_inner);
                self.poll
                    .registry()
                    .register(locked.stream_mut(), token, interest)
            };
            if let Err(e) = rearm {
                debug!(?token, error = %e, "failed to re-arm connection");
                self.close_conn(token);
            }
        }
    }

    /// Idle-timer expiry. A connection with a job in flight is marked and
    /// closed when the job reports back; anything else closes now.
    fn expire_conn(&mut self, token: Token) {
        let Some(entry) = self.connections.get_mut(token.0) else {
            return;
        };
        if entry.in_flight {
            entry.doomed = true;
            return;
        }
        debug!(?token, "idle timeout");
        self.close_conn(token);
    }

    /// The single closing path: removes the table entry, cancels the timer,
    /// drops interest, and releases the connection's resources.
    fn close_conn(&mut self, token: Token) {
        if !self.connections.contains(token.0) {
            return;
        }
        let entry = self.connections.remove(token.0);
        self.timers.cancel(token);
        let mut conn = entry.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self.poll.registry().deregister(conn.stream_mut());
        info!(peer = %conn.peer_addr(), ?token, "client quit");
        conn.close();
    }
}

/// Read phase job: drain the socket, then run the process phase. End of
/// stream and hard errors close; otherwise the connection asks for whatever
/// readiness the parser's progress implies.
fn on_read(conn: &Arc<Mutex<HttpConn>>, token: Token, ctx: &JobCtx) {
    let next = match conn.lock() {
        Ok(mut c) => match c.read() {
            Ok(0) => Next::Close,
            Ok(_) => on_process(&mut c, ctx),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => on_process(&mut c, ctx),
            Err(e) => {
                debug!(?token, error = %e, "read failed");
                Next::Close
            }
        },
        Err(_) => Next::Close,
    };
    finish(token, next, ctx);
}

fn on_process(conn: &mut HttpConn, ctx: &JobCtx) -> Next {
    if conn.process(&ctx.db, &ctx.config) {
        Next::Write
    } else {
        Next::Read
    }
}

/// Write phase job: flush the gather vector. A fully flushed keep-alive
/// turn resets the connection and immediately processes any next request;
/// a would-block keeps writable interest; anything else closes.
fn on_write(conn: &Arc<Mutex<HttpConn>>, token: Token, ctx: &JobCtx) {
    let next = match conn.lock() {
        Ok(mut c) => match c.write() {
            Ok(_) if c.to_write_bytes() == 0 => {
                if c.is_keep_alive() {
                    c.reset_turn();
                    on_process(&mut c, ctx)
                } else {
                    Next::Close
                }
            }
            Ok(_) => Next::Write,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Next::Write,
            Err(e) => {
                debug!(?token, error = %e, "write failed");
                Next::Close
            }
        },
        Err(_) => Next::Close,
    };
    finish(token, next, ctx);
}

fn finish(token: Token, next: Next, ctx: &JobCtx) {
    let _ = ctx.done.send(Completion { token, next });
    if let Err(e) = ctx.waker.wake() {
        error!(error = %e, "failed to wake the reactor");
    }
}
