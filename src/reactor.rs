// Copyright 2026 the vakt authors
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

//! The reactor: a single thread driving every socket the gateway owns.
//!
//! Level-triggered readiness over the listener plus all connections in
//! `Idle`/`Reading`/`Writing`. Dispatched connections are deregistered
//! from the poll set so worker-owned state is never concurrently drained;
//! workers announce completion over a channel + waker, exactly one
//! direction of coupling. Each tick also runs the housekeeping pass:
//! timeouts, rate-limiter GC, and the WebSocket hub.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::MAX_BODY_SIZE;
use crate::conn::{interest_for, Conn, ConnState, Stream};
use crate::engine::codec::escape;
use crate::parser::request::Request;
use crate::parser::response::Response;
use crate::parser::{ParseError, Status};
use crate::router;
use crate::services::Services;
use crate::tls::TlsStream;
use crate::video;
use crate::worker::{Task, WorkerCtx, WorkerPool};
use crate::ws::Hub;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Poll tick; also the floor of housekeeping latency.
const TICK: Duration = Duration::from_millis(10);

/// What to do with a connection after the parse step, decided under the io
/// lock and executed after it is released.
enum Verdict {
    Nothing,
    Close,
    /// Queue this response; optionally close once it drains.
    Respond(Box<Response>, bool),
    /// Hand the socket to the WebSocket hub.
    Upgrade {
        stream: Stream,
        key: String,
    },
    /// Detach the socket to an MJPEG streamer thread.
    Video {
        stream: Stream,
        context_id: String,
        single_frame: bool,
    },
    /// Staged and ready for the worker pool.
    Dispatch,
}

/// The single-threaded event loop.
#[derive(Debug)]
pub struct Reactor {
    services: Arc<Services>,
    listener: Option<mio::net::TcpListener>,
    poll: Poll,
    events: Events,
    conns: Slab<Arc<Conn>>,
    pool: Option<WorkerPool>,
    ctx: Arc<WorkerCtx>,
    done_rx: Receiver<usize>,
    hub: Hub,
    tls: Option<Arc<rustls::ServerConfig>>,
    draining: Option<Instant>,
}

impl Reactor {
    /// Binds the listener and wires the worker pool and hub.
    pub fn new(services: Arc<Services>) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", services.config.host, services.config.port);
        let std_listener = std::net::TcpListener::bind(&addr)
            .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;
        std_listener.set_nonblocking(true)?;
        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let (done_tx, done_rx) = unbounded();
        let ctx = Arc::new(WorkerCtx {
            services: Arc::clone(&services),
            done_tx,
            waker,
        });

        let workers = match services.config.worker_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        };
        let queue_cap = services.config.max_connections * 2;
        let pool = WorkerPool::new(workers, queue_cap, Arc::clone(&ctx));

        let hub = Hub::new(services.config.websocket.clone())?;
        let tls = if services.config.ssl.enabled {
            Some(crate::tls::server_config(&services.config.ssl)?)
        } else {
            None
        };

        info!(%addr, workers, tls = tls.is_some(), "gateway listening");
        Ok(Self {
            services,
            listener: Some(listener),
            poll,
            events: Events::with_capacity(1024),
            conns: Slab::new(),
            pool: Some(pool),
            ctx,
            done_rx,
            hub,
            tls,
            draining: None,
        })
    }

    /// Runs until shutdown completes. Blocks the calling thread.
    pub fn run(&mut self) {
        loop {
            if self.services.is_shutting_down() && self.draining.is_none() {
                self.begin_shutdown();
            }
            if let Some(started) = self.draining {
                let deadline =
                    Duration::from_secs(self.services.config.shutdown_timeout_sec);
                let drained = self.conns.is_empty()
                    && self.hub.active() == 0
                    && self.pool.as_ref().map(WorkerPool::queued).unwrap_or(0) == 0;
                if drained || started.elapsed() >= deadline {
                    break;
                }
            }

            match self.poll.poll(&mut self.events, Some(TICK)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(err = %e, "poll failed");
                    break;
                }
            }

            let mut accept_pending = false;
            let tokens: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable() || e.is_read_closed(), e.is_writable()))
                .collect();
            for (token, readable, writable) in tokens {
                match token {
                    LISTEN_TOKEN => accept_pending = true,
                    WAKE_TOKEN => {}
                    Token(key) => self.conn_event(key, readable, writable),
                }
            }
            if accept_pending {
                self.accept_loop();
            }

            self.drain_done_queue();
            self.housekeeping();
        }

        self.finish_shutdown();
    }

    fn begin_shutdown(&mut self) {
        info!("shutdown signal observed; closing listener");
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.hub.close_all();
        // idle keep-alive connections have nothing in flight; only
        // Dispatched/Writing ones are worth draining
        let closable: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                !self.services.config.graceful_shutdown
                    || matches!(conn.state(), ConnState::Idle | ConnState::Reading)
            })
            .map(|(key, _)| key)
            .collect();
        for key in closable {
            self.close_conn(key);
        }
        self.draining = Some(Instant::now());
    }

    fn finish_shutdown(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close_conn(key);
        }
        // fail in-flight engine calls first so blocked workers wake up and
        // the pool can actually join
        self.services.engine.shutdown();
        if let Some(pool) = self.pool.take() {
            pool.shutdown(Duration::from_secs(1));
        }
        info!("reactor stopped");
    }

    fn accept_loop(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((sock, addr)) => {
                    if self.conns.len() >= self.services.config.max_connections {
                        debug!(%addr, "connection slots exhausted; dropping accept");
                        continue;
                    }
                    let _ = sock.set_nodelay(true);

                    let stream = match &self.tls {
                        None => Stream::Plain(sock),
                        Some(config) => match TlsStream::new(sock, Arc::clone(config)) {
                            Ok(tls) => Stream::Tls(Box::new(tls)),
                            Err(e) => {
                                warn!(err = %e, "TLS session setup failed");
                                continue;
                            }
                        },
                    };

                    let entry = self.conns.vacant_entry();
                    let token = entry.key();
                    let conn = Arc::new(Conn::new(
                        token,
                        addr.ip(),
                        stream,
                        self.services.epoch,
                    ));
                    {
                        let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                        let registered = io.stream.as_mut().map(|s| {
                            s.register(self.poll.registry(), Token(token), Interest::READABLE)
                        });
                        if !matches!(registered, Some(Ok(()))) {
                            continue; // drop the socket, slot stays vacant
                        }
                    }
                    entry.insert(conn);
                    self.services.stats.conn_opened();
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    // steady-state: log and keep serving existing traffic
                    warn!(err = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn conn_event(&mut self, key: usize, readable: bool, writable: bool) {
        let Some(conn) = self.conns.get(key).map(Arc::clone) else {
            return; // stale event for a removed/detached connection
        };

        match conn.state() {
            ConnState::Dispatched | ConnState::Closed => return,
            ConnState::Writing => {
                if writable || readable {
                    self.drain_send(&conn);
                }
            }
            ConnState::Idle | ConnState::Reading => {
                if writable {
                    self.drain_send(&conn);
                }
                if readable {
                    self.fill_and_parse(&conn);
                }
            }
        }
    }

    fn drain_done_queue(&mut self) {
        loop {
            match self.done_rx.try_recv() {
                Ok(key) => self.on_worker_done(key),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// A worker finished a dispatched request: the connection re-enters the
    /// poll set and its response starts draining.
    fn on_worker_done(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key).map(Arc::clone) else {
            return;
        };
        if conn.state() == ConnState::Closed {
            self.close_conn(key);
            return;
        }

        {
            let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            let io = &mut *guard;
            let interest = interest_for(io);
            let Some(stream) = io.stream.as_mut() else {
                drop(guard);
                self.close_conn(key);
                return;
            };
            if stream
                .register(self.poll.registry(), Token(key), interest)
                .is_err()
            {
                drop(guard);
                self.close_conn(key);
                return;
            }
        }
        conn.touch(self.services.epoch);
        self.drain_send(&conn);
    }

    /// Reads available bytes and attempts a parse; acts on the verdict.
    fn fill_and_parse(&mut self, conn: &Arc<Conn>) {
        let filled = {
            let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            let io = &mut *guard;
            let Some(stream) = io.stream.as_mut() else {
                drop(guard);
                self.close_conn(conn.token);
                return;
            };
            match io.recv.fill_from(stream, MAX_BODY_SIZE + crate::parser::MAX_HEAD_SIZE) {
                Ok(0) => {
                    drop(guard);
                    self.close_conn(conn.token);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
                Err(_) => {
                    drop(guard);
                    self.close_conn(conn.token);
                    return;
                }
            }
        };
        if filled > 0 {
            self.services.stats.add_bytes_in(filled as u64);
            conn.touch(self.services.epoch);
        }
        self.parse_pending(conn);
        // a TLS handshake may have queued bytes without any response staged
        if self.conns.contains(conn.token) {
            self.refresh_interest(conn);
        }
    }

    /// Parses whatever is buffered (no socket read) and acts on it. Also
    /// called after a response drains, for the next keep-alive request.
    fn parse_pending(&mut self, conn: &Arc<Conn>) {
        let verdict = {
            let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            let io = &mut *guard;
            if io.recv.is_empty() {
                Verdict::Nothing
            } else {
                self.parse_verdict(conn, io)
            }
        };
        self.apply_verdict(conn, verdict);
    }

    /// The parse + gate + path-choice step, run under the io lock.
    fn parse_verdict(&self, conn: &Arc<Conn>, io: &mut crate::conn::ConnIo) -> Verdict {
        match Request::parse(io.recv.unread(), MAX_BODY_SIZE) {
            Ok(Status::Partial) => {
                if conn.state() == ConnState::Idle {
                    conn.set_state(ConnState::Reading);
                }
                Verdict::Nothing
            }
            Err(e) => {
                let status = if e.is_too_large() { 413 } else { 400 };
                Verdict::Respond(Box::new(synthesized_error(status, &e)), true)
            }
            Ok(Status::Complete((request, consumed))) => {
                io.recv.mark_read(consumed);

                if let Err(denial) = self.services.gates.check(conn.peer, &request) {
                    let mut response = denial.to_response();
                    router::apply_cors(&self.services.config.cors, &mut response);
                    self.services.stats.record_request(false, 0);
                    return Verdict::Respond(Box::new(response), false);
                }

                // WebSocket upgrade leaves the reactor entirely
                if self.services.config.websocket.enabled
                    && request.path == "/ws"
                    && request.wants_websocket()
                {
                    if !self.hub.has_capacity() {
                        let mut response = Response::json(
                            503,
                            &serde_json::json!({
                                "success": false,
                                "error": "WebSocket capacity exhausted",
                            }),
                        );
                        router::apply_cors(&self.services.config.cors, &mut response);
                        return Verdict::Respond(Box::new(response), false);
                    }
                    let key = request.ws_key().unwrap_or_default().to_owned();
                    if let Some(stream) = io.stream.take() {
                        return Verdict::Upgrade { stream, key };
                    }
                    return Verdict::Close;
                }

                // MJPEG paths detach to a dedicated thread
                for (prefix, single) in
                    [("/video/stream/", false), ("/video/frame/", true)]
                {
                    if let Some(rest) = request.path.strip_prefix(prefix) {
                        if rest.is_empty() {
                            let response =
                                crate::error::GatewayError::NotFound(request.path.clone())
                                    .to_response();
                            return Verdict::Respond(Box::new(response), false);
                        }
                        if let Some(stream) = io.stream.take() {
                            return Verdict::Video {
                                stream,
                                context_id: crate::parser::url_decode(rest),
                                single_frame: single,
                            };
                        }
                        return Verdict::Close;
                    }
                }

                io.staged = Some(request);
                io.arrived = Some(Instant::now());
                Verdict::Dispatch
            }
        }
    }

    fn apply_verdict(&mut self, conn: &Arc<Conn>, verdict: Verdict) {
        match verdict {
            Verdict::Nothing => {}
            Verdict::Close => self.close_conn(conn.token),
            Verdict::Respond(response, close_after) => {
                {
                    let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                    let mut bytes = Vec::with_capacity(256 + response.body_len());
                    response.serialize_into(&mut bytes);
                    self.services.stats.add_bytes_out(bytes.len() as u64);
                    io.send.extend(&bytes);
                    io.close_after_drain |= close_after;
                }
                conn.set_state(ConnState::Writing);
                self.drain_send(conn);
            }
            Verdict::Upgrade { stream, key } => {
                self.detach(conn.token, stream, |reactor, stream| {
                    let peer = conn.peer;
                    if let Err(e) = reactor.hub.adopt(stream, peer, &key) {
                        warn!(err = %e, "websocket adoption failed");
                        reactor.services.stats.conn_closed();
                    }
                });
            }
            Verdict::Video {
                stream,
                context_id,
                single_frame,
            } => {
                self.detach(conn.token, stream, |reactor, stream| {
                    video::spawn_stream(
                        Arc::clone(&reactor.services),
                        stream,
                        context_id,
                        single_frame,
                    );
                });
            }
            Verdict::Dispatch => {
                // out of the poll set while the worker owns it
                {
                    let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(stream) = io.stream.as_mut() {
                        let _ = stream.deregister(self.poll.registry());
                    }
                }
                conn.set_state(ConnState::Dispatched);

                if let Some(pool) = self.pool.as_ref() {
                    if let Err(task) = pool.submit(Task::Http(Arc::clone(conn))) {
                        // documented degradation: run on the reactor thread
                        warn!("worker queue full; executing request inline");
                        crate::worker::run_task(&self.ctx, task);
                    }
                }
            }
        }
    }

    /// Removes the connection from the reactor's bookkeeping and hands the
    /// deregistered socket to `adopt`.
    fn detach(
        &mut self,
        key: usize,
        mut stream: Stream,
        adopt: impl FnOnce(&mut Self, Stream),
    ) {
        let _ = stream.deregister(self.poll.registry());
        if self.conns.contains(key) {
            self.conns.remove(key);
        }
        adopt(self, stream);
    }

    /// Drains the send buffer; on completion the connection re-enters
    /// `Idle` and any pipelined bytes get parsed.
    fn drain_send(&mut self, conn: &Arc<Conn>) {
        let outcome = {
            let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
            let io = &mut *guard;
            let Some(stream) = io.stream.as_mut() else {
                drop(guard);
                self.close_conn(conn.token);
                return;
            };
            if io.send.is_empty() && !stream.wants_write() {
                None
            } else {
                match io.send.drain_into(stream) {
                    Ok(_) => {
                        let _ = std::io::Write::flush(stream);
                        if io.send.is_empty() {
                            io.send.reset(4 * 1024);
                            Some(Ok(true))
                        } else {
                            Some(Ok(false))
                        }
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        };

        match outcome {
            None => {}
            Some(Err(_)) => {
                self.close_conn(conn.token);
                return;
            }
            Some(Ok(fully_drained)) => {
                conn.touch(self.services.epoch);
                if fully_drained {
                    let close_after = {
                        let io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                        io.close_after_drain
                    };
                    // during shutdown a finished connection does not
                    // re-enter keep-alive
                    if close_after || self.draining.is_some() {
                        self.close_conn(conn.token);
                        return;
                    }
                    if conn.state() == ConnState::Writing {
                        conn.set_state(ConnState::Idle);
                    }
                    self.parse_pending(conn);
                }
            }
        }

        // interest may have changed (buffer drained or still pending)
        self.refresh_interest(conn);
    }

    fn refresh_interest(&mut self, conn: &Arc<Conn>) {
        if conn.state() == ConnState::Closed || conn.state() == ConnState::Dispatched {
            return;
        }
        let mut guard = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        let io = &mut *guard;
        let interest = interest_for(io);
        if let Some(stream) = io.stream.as_mut() {
            let _ = stream.reregister(self.poll.registry(), Token(conn.token), interest);
        }
    }

    /// Closes and forgets a connection, whatever state it is in.
    fn close_conn(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }
        let conn = self.conns.remove(key);
        conn.set_state(ConnState::Closed);
        let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut stream) = io.stream.take() {
            let _ = stream.deregister(self.poll.registry());
        }
        self.services.stats.conn_closed();
    }

    /// Timeout scan + rate-limiter GC + hub pass.
    fn housekeeping(&mut self) {
        let request_timeout = self.services.config.request_timeout_ms;
        let keep_alive = self.services.config.keep_alive_timeout_sec * 1000;
        let epoch = self.services.epoch;

        let expired: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                let idle = conn.idle_ms(epoch);
                match conn.state() {
                    ConnState::Dispatched => false, // workers own it
                    ConnState::Idle => idle > keep_alive,
                    ConnState::Reading | ConnState::Writing => idle > request_timeout,
                    ConnState::Closed => true,
                }
            })
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            debug!(token = key, "connection timed out");
            // a half-received request gets a best-effort 408 on the way out
            if let Some(conn) = self.conns.get(key) {
                if conn.state() == ConnState::Reading {
                    let mut io = conn.io.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(stream) = io.stream.as_mut() {
                        let body = br#"{"success":false,"error":"Request timeout"}"#;
                        let head = format!(
                            "HTTP/1.1 408 Request Timeout\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = std::io::Write::write(stream, head.as_bytes());
                        let _ = std::io::Write::write(stream, body);
                    }
                }
            }
            self.close_conn(key);
        }

        self.services.gates.housekeeping();

        if let Some(pool) = self.pool.as_ref() {
            self.hub.tick(pool, &self.ctx);
        }
    }
}

/// Parse failures are answered without allocating a serde tree; the body
/// is assembled by hand with the shared escape helper.
fn synthesized_error(status: u16, error: &ParseError) -> Response {
    let body = format!(
        "{{\"success\":false,\"error\":\"{}\"}}",
        escape(&error.to_string())
    );
    Response::new(status)
        .with_header("Content-Type", "application/json")
        .with_body(body.into_bytes())
}

// Exercised end-to-end in tests/gateway.rs; the unit layer covers the
// pieces the loop is assembled from.
#[cfg(test)]
mod test {
    use super::synthesized_error;
    use crate::parser::ParseError;

    #[test]
    fn synthesized_errors_use_contractual_statuses() {
        assert_eq!(400, synthesized_error(400, &ParseError::Method).status());
        let resp = synthesized_error(413, &ParseError::BodyTooLarge);
        assert_eq!(413, resp.status());
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("\"success\":false"));
        assert!(text.contains("Request body too large"));
    }
}
